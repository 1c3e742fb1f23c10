//! Tools to facilitate mocks for testing

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use curve25519_dalek::scalar::Scalar;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::construct::fees::FeeParameters;
use crate::error::DaemonError;
use crate::interface::{BlockSink, DaemonComms};
use crate::keys::{derive_output, keccak256, Address, Keyring};
use crate::primitives::{
    Block, BlockHash, BlockHeight, BlockTx, DecoyOutput, KeyImage, Output, SubaddressIndex,
    Transaction, TxExtra, TxHash, TxInput,
};

macro_rules! build_method {
    ($name:ident, $localtype:ty) => {
        #[doc = concat!("Set the `", stringify!($name), "` field of the builder.")]
        pub fn $name(mut self, $name: $localtype) -> Self {
            self.$name = Some($name);
            self
        }
    };
}

/// Deterministic full keyring
pub fn keyring(seed: u8) -> Keyring {
    Keyring::from_seed([seed; 32])
}

/// Deterministic keyring tracking a few subaddresses
pub fn keyring_with_subaddresses(seed: u8) -> Keyring {
    keyring(seed).with_subaddress_lookahead(2, 5)
}

/// A struct to build a mock owned [`Output`] from scratch
#[derive(Clone, Copy, Debug, Default)]
pub struct OutputBuilder {
    amount: Option<u64>,
    key_image: Option<KeyImage>,
    global_index: Option<u64>,
    subaddress: Option<SubaddressIndex>,
    block_height: Option<BlockHeight>,
    unlock_height: Option<BlockHeight>,
}

impl OutputBuilder {
    /// Instantiate an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    build_method!(amount, u64);
    build_method!(key_image, KeyImage);
    build_method!(global_index, u64);
    build_method!(subaddress, SubaddressIndex);
    build_method!(block_height, BlockHeight);
    build_method!(unlock_height, BlockHeight);

    /// Builds the output. Unset fields take defaults derived from the key image.
    pub fn build(self) -> Output {
        let key_image = self.key_image.unwrap_or_default();
        let block_height = self.block_height.unwrap_or(1);
        Output::from_parts(
            self.amount.unwrap_or(100_000),
            *key_image.as_bytes(),
            key_image,
            self.global_index.unwrap_or(key_image.as_bytes()[0] as u64),
            self.subaddress.unwrap_or_default(),
            self.unlock_height.unwrap_or(block_height + 10),
            block_height,
            0,
            TxHash(*key_image.as_bytes()),
            0,
            [0; 32],
        )
    }
}

/// Seconds between synthetic blocks
pub const BLOCK_INTERVAL: u64 = 120;
/// Timestamp of the synthetic block at height 0
pub const GENESIS_TIMESTAMP: u64 = 1_600_000_000;

/// Builds a synthetic chain, block by block. Transactions are queued with [`ChainBuilder::pay`]
/// and friends and sealed into the next block by [`ChainBuilder::block`].
///
/// Every output gets the next global output index. Randomness is seeded, so a chain built twice
/// with the same calls is identical.
pub struct ChainBuilder {
    rng: StdRng,
    stranger: Keyring,
    height: BlockHeight,
    next_global_index: u64,
    pending: Vec<BlockTx>,
    blocks: Vec<Block>,
    outputs: Vec<DecoyOutput>,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBuilder {
    /// Empty chain; the first sealed block has height 1
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Empty chain whose first sealed block has height `height`
    pub fn starting_at(height: BlockHeight) -> Self {
        Self {
            rng: StdRng::seed_from_u64(height),
            stranger: keyring(0xee),
            height: height - 1,
            next_global_index: 0,
            pending: Vec::new(),
            blocks: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Queues a transaction paying `amount` to `address`
    pub fn pay(&mut self, address: &Address, amount: u64) -> TxHash {
        self.payment(address, amount, 0, false)
    }

    /// Queues a transaction paying `amount` to `address`, locked until `unlock_time`
    pub fn pay_locked(&mut self, address: &Address, amount: u64, unlock_time: u64) -> TxHash {
        self.payment(address, amount, unlock_time, false)
    }

    /// Queues the block reward, paid to `address`
    pub fn coinbase(&mut self, address: &Address, amount: u64) -> TxHash {
        self.payment(address, amount, 0, true)
    }

    /// Queues a transaction spending the given key images to an unrelated address
    pub fn spend(&mut self, key_images: &[KeyImage]) -> TxHash {
        let inputs = key_images
            .iter()
            .map(|key_image| TxInput::ToKey {
                key_offsets: vec![self.rng.gen_range(0..1_000)],
                key_image: *key_image,
            })
            .collect();
        let address = self.stranger.main_address();
        self.push_transaction(inputs, &address, 1, 0)
    }

    fn payment(
        &mut self,
        address: &Address,
        amount: u64,
        unlock_time: u64,
        coinbase: bool,
    ) -> TxHash {
        let inputs = if coinbase {
            vec![TxInput::Gen {
                height: self.height + 1,
            }]
        } else {
            vec![TxInput::ToKey {
                key_offsets: vec![self.rng.gen_range(0..1_000)],
                key_image: KeyImage(self.rng.gen()),
            }]
        };
        self.push_transaction(inputs, address, amount, unlock_time)
    }

    fn push_transaction(
        &mut self,
        inputs: Vec<TxInput>,
        address: &Address,
        amount: u64,
        unlock_time: u64,
    ) -> TxHash {
        let mut wide = [0u8; 64];
        self.rng.fill_bytes(&mut wide);
        let tx_secret = Scalar::from_bytes_mod_order_wide(&wide);
        let derived = derive_output(&tx_secret, address, 0, amount)
            .expect("mock addresses are valid points");
        let extra = if address.is_subaddress {
            TxExtra {
                tx_pubkey: None,
                additional_pubkeys: vec![derived.tx_pubkey],
            }
        } else {
            TxExtra {
                tx_pubkey: Some(derived.tx_pubkey),
                additional_pubkeys: Vec::new(),
            }
        };

        let hash = TxHash(self.rng.gen());
        let global_index = self.next_global_index;
        self.next_global_index += 1;
        self.outputs.push(DecoyOutput::from_parts(
            global_index,
            derived.output.key,
            keccak256(&derived.output.key),
            true,
            self.height + 1,
            hash,
        ));

        let tx = Transaction {
            version: 4,
            unlock_time,
            inputs,
            outputs: vec![derived.output],
            extra,
            fee: 0,
        };
        self.pending
            .push(BlockTx::from_parts(hash, tx, vec![global_index]));
        hash
    }

    /// Seals the queued transactions into the next block
    pub fn block(&mut self) -> Block {
        self.height += 1;
        let block = Block::from_parts(
            self.height,
            BlockHash(self.rng.gen()),
            GENESIS_TIMESTAMP + self.height * BLOCK_INTERVAL,
            std::mem::take(&mut self.pending),
        );
        self.blocks.push(block.clone());
        block
    }

    /// Seals `count` blocks without transactions
    pub fn empty_blocks(&mut self, count: usize) -> Vec<Block> {
        (0..count).map(|_| self.block()).collect()
    }

    /// Every sealed block
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Height of the last sealed block
    pub fn height(&self) -> BlockHeight {
        self.height
    }

    /// Public data of every output created so far
    pub fn outputs(&self) -> &[DecoyOutput] {
        &self.outputs
    }
}

/// A registration received by the [`MockDaemon`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registration {
    /// First height the wallet asked for
    pub next_height: BlockHeight,
    /// Wallet asked the daemon to rewind its cursor
    pub update_sync_height: bool,
    /// Fresh subscription
    pub new_wallet: bool,
}

/// How the [`MockDaemon`] answers deregistration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeregisterResponse {
    /// Signals completion immediately
    #[default]
    Acknowledge,
    /// Keeps the signal without ever firing it
    Withhold,
    /// Drops the signal without firing it
    Drop,
}

/// A registration held open by [`MockDaemon::pause_next_registration`]
#[derive(Debug)]
pub struct PausedRegistration {
    /// Fires once the wallet is inside the registration call
    pub entered: crossbeam_channel::Receiver<()>,
    /// Lets the registration complete
    pub release: crossbeam_channel::Sender<()>,
}

type RegistrationGate = (crossbeam_channel::Sender<()>, crossbeam_channel::Receiver<()>);

/// Daemon double recording the wallet's requests and serving canned chain data
#[derive(Default)]
pub struct MockDaemon {
    registrations: Mutex<Vec<Registration>>,
    registration_gate: Mutex<Option<RegistrationGate>>,
    sink: Mutex<Option<Weak<dyn BlockSink>>>,
    deregistrations: AtomicUsize,
    deregister_response: Mutex<DeregisterResponse>,
    withheld: Mutex<Vec<crossbeam_channel::Sender<()>>>,
    fee_parameters: Mutex<FeeParameters>,
    output_count: AtomicU64,
    known_outputs: Mutex<HashMap<u64, DecoyOutput>>,
    locked: Mutex<HashSet<u64>>,
    missing: Mutex<HashSet<u64>>,
    blacklist: Mutex<Vec<u64>>,
    output_requests: Mutex<Vec<Vec<u64>>>,
}

impl MockDaemon {
    /// Daemon with default fee rates and an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Every registration received, oldest first
    pub fn registrations(&self) -> Vec<Registration> {
        self.registrations.lock().clone()
    }

    /// The most recent registration
    pub fn last_registration(&self) -> Option<Registration> {
        self.registrations.lock().last().copied()
    }

    /// Number of deregistrations received
    pub fn deregistrations(&self) -> usize {
        self.deregistrations.load(Ordering::SeqCst)
    }

    /// Returns true while a wallet is subscribed
    pub fn is_registered(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Blocks the next registration call until released, recording it only afterwards
    pub fn pause_next_registration(&self) -> PausedRegistration {
        let (entered_tx, entered) = crossbeam_channel::bounded(1);
        let (release, release_rx) = crossbeam_channel::bounded(1);
        *self.registration_gate.lock() = Some((entered_tx, release_rx));
        PausedRegistration { entered, release }
    }

    /// Sets how deregistration is answered
    pub fn set_deregister_response(&self, response: DeregisterResponse) {
        *self.deregister_response.lock() = response;
    }

    /// Sets the served fee rates
    pub fn set_fee_parameters(&self, fee_parameters: FeeParameters) {
        *self.fee_parameters.lock() = fee_parameters;
    }

    /// Sets the number of outputs on chain
    pub fn set_output_count(&self, output_count: u64) {
        self.output_count.store(output_count, Ordering::SeqCst);
    }

    /// Serves the given outputs as they are, extending the output count to cover them
    pub fn add_outputs(&self, outputs: &[DecoyOutput]) {
        let mut known = self.known_outputs.lock();
        for output in outputs {
            known.insert(output.global_index(), *output);
            self.output_count
                .fetch_max(output.global_index() + 1, Ordering::SeqCst);
        }
    }

    /// Reports the outputs in `indices` as still locked
    pub fn lock_outputs(&self, indices: Range<u64>) {
        self.locked.lock().extend(indices);
    }

    /// Leaves the outputs in `indices` out of answers
    pub fn hide_outputs(&self, indices: Range<u64>) {
        self.missing.lock().extend(indices);
    }

    /// Sets the output blacklist
    pub fn set_blacklist(&self, blacklist: Vec<u64>) {
        *self.blacklist.lock() = blacklist;
    }

    /// Index lists of every output request, oldest first
    pub fn output_requests(&self) -> Vec<Vec<u64>> {
        self.output_requests.lock().clone()
    }

    /// Pushes blocks to the subscribed wallet. Returns false if no live wallet is subscribed.
    pub fn deliver_blocks(&self, blocks: Vec<Block>) -> bool {
        match self.subscribed_wallet() {
            Some(wallet) => {
                wallet.deliver_blocks(blocks);
                true
            }
            None => false,
        }
    }

    /// Pushes a chain tip notification to the subscribed wallet
    pub fn deliver_top_block(&self, height: BlockHeight, hash: BlockHash) -> bool {
        match self.subscribed_wallet() {
            Some(wallet) => {
                wallet.deliver_top_block_info(height, hash);
                true
            }
            None => false,
        }
    }

    // the sink lock is released before the wallet is called back
    fn subscribed_wallet(&self) -> Option<Arc<dyn BlockSink>> {
        let sink = self.sink.lock().clone();
        sink.and_then(|sink| sink.upgrade())
    }

    fn output(&self, global_index: u64) -> DecoyOutput {
        let unlocked = !self.locked.lock().contains(&global_index);
        let known = self.known_outputs.lock().get(&global_index).copied();
        match known {
            Some(output) => DecoyOutput::from_parts(
                output.global_index(),
                output.key(),
                output.mask(),
                unlocked,
                output.height(),
                output.tx_hash(),
            ),
            None => {
                let key = keccak256(&global_index.to_le_bytes());
                DecoyOutput::from_parts(
                    global_index,
                    key,
                    keccak256(&key),
                    unlocked,
                    global_index / 4,
                    TxHash(keccak256(&key)),
                )
            }
        }
    }
}

impl DaemonComms for MockDaemon {
    fn register_wallet(
        &self,
        wallet: Weak<dyn BlockSink>,
        next_height: BlockHeight,
        update_sync_height: bool,
        new_wallet: bool,
    ) {
        let gate = self.registration_gate.lock().take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }
        self.registrations.lock().push(Registration {
            next_height,
            update_sync_height,
            new_wallet,
        });
        *self.sink.lock() = Some(wallet);
    }

    fn deregister_wallet(
        &self,
        _wallet: Weak<dyn BlockSink>,
        completion: crossbeam_channel::Sender<()>,
    ) {
        self.deregistrations.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock() = None;
        let response = *self.deregister_response.lock();
        match response {
            DeregisterResponse::Acknowledge => {
                let _ = completion.send(());
            }
            DeregisterResponse::Withhold => self.withheld.lock().push(completion),
            DeregisterResponse::Drop => drop(completion),
        }
    }

    fn get_fee_parameters(
        &self,
    ) -> impl Future<Output = Result<FeeParameters, DaemonError>> + Send {
        let fee_parameters = *self.fee_parameters.lock();
        async move { Ok(fee_parameters) }
    }

    fn get_output_count(&self) -> impl Future<Output = Result<u64, DaemonError>> + Send {
        let output_count = self.output_count.load(Ordering::SeqCst);
        async move { Ok(output_count) }
    }

    fn get_outputs(
        &self,
        indices: Vec<u64>,
    ) -> impl Future<Output = Result<Vec<DecoyOutput>, DaemonError>> + Send {
        self.output_requests.lock().push(indices.clone());
        let missing = self.missing.lock().clone();
        let outputs: Vec<DecoyOutput> = indices
            .into_iter()
            .filter(|index| !missing.contains(index))
            .map(|index| self.output(index))
            .collect();
        async move { Ok(outputs) }
    }

    fn get_output_blacklist(&self) -> impl Future<Output = Result<Vec<u64>, DaemonError>> + Send {
        let blacklist = self.blacklist.lock().clone();
        async move { Ok(blacklist) }
    }
}
