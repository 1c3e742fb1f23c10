//! Entrypoint for sync engine
//!
//! The [`Wallet`] ingests blocks pushed by the daemon, in height order, one storage transaction
//! per block. The persisted scan height and the in-memory one move together: a block is either
//! fully committed and counted, or not applied at all.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use parking_lot::{Mutex, ReentrantMutex};
use wallet3_config::WalletConfig;

use crate::error::SyncError;
use crate::interface::{BlockSink, DaemonComms, StorageTransaction, WalletStorage};
use crate::keys::Keyring;
use crate::primitives::{Block, BlockHash, BlockHeight, SubaddressIndex};
use crate::scan::{TransactionScanner, UnlockRules};

/// Lifecycle of the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Not registered with the daemon
    Stopped,
    /// Asking the daemon for blocks
    Registering,
    /// Applying a batch of blocks
    Syncing,
    /// Registered, waiting for the next batch
    AwaitingBlocks,
}

#[derive(Debug)]
struct SyncState {
    last_scan_height: BlockHeight,
    scan_target_height: BlockHeight,
    running: bool,
    status: SyncStatus,
}

/// Wallet synchronisation engine.
///
/// The daemon only ever holds a [`Weak`] reference to it, so dropping the last [`Arc`] ends
/// delivery even without deregistering.
pub struct Wallet<S, D> {
    storage: Arc<S>,
    daemon: Arc<D>,
    keyring: Arc<Keyring>,
    scanner: TransactionScanner,
    state: Mutex<SyncState>,
    /// Held across every call to the daemon's register and deregister. Reentrant, so a daemon
    /// may deliver from within registration.
    registration: ReentrantMutex<()>,
    deregister_timeout: Duration,
    this: Weak<Self>,
}

impl<S, D> std::fmt::Debug for Wallet<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("keyring", &self.keyring)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl<S, D> Wallet<S, D>
where
    S: WalletStorage,
    D: DaemonComms,
{
    /// Opens the wallet over `storage`, resuming from the persisted scan height.
    /// The engine is stopped until [`Wallet::init`].
    pub fn new(
        keyring: Arc<Keyring>,
        storage: Arc<S>,
        daemon: Arc<D>,
        config: &WalletConfig,
    ) -> Result<Arc<Self>, SyncError> {
        storage.add_address(SubaddressIndex::PRIMARY, &keyring.main_address())?;
        let last_scan_height = storage.last_scan_height()?;
        let scan_target_height = storage.scan_target_height()?;
        tracing::info!(
            "Opened wallet at scan height {} of {}",
            last_scan_height,
            scan_target_height
        );

        let scanner = TransactionScanner::new(keyring.clone(), UnlockRules::from_config(config));
        Ok(Arc::new_cyclic(|this| Self {
            storage,
            daemon,
            keyring,
            scanner,
            state: Mutex::new(SyncState {
                last_scan_height,
                scan_target_height,
                running: false,
                status: SyncStatus::Stopped,
            }),
            registration: ReentrantMutex::new(()),
            deregister_timeout: config.daemon.deregister_timeout,
            this: this.clone(),
        }))
    }

    fn sink(&self) -> Weak<dyn BlockSink> {
        self.this.clone()
    }

    /// Starts the engine and registers with the daemon for the next needed block
    pub fn init(&self) {
        let next_height = {
            let mut state = self.state.lock();
            state.running = true;
            state.status = SyncStatus::Registering;
            state.last_scan_height + 1
        };
        tracing::info!("Registering wallet from height {}", next_height);
        self.register(next_height, true, true);
    }

    // a stopped engine never subscribes again
    fn register(&self, next_height: BlockHeight, update_sync_height: bool, new_wallet: bool) {
        let _registration = self.registration.lock();
        if !self.is_running() {
            tracing::debug!("Not registering at {}, wallet is stopped", next_height);
            return;
        }
        self.daemon
            .register_wallet(self.sink(), next_height, update_sync_height, new_wallet);

        // the daemon may already have delivered blocks from within the registration call
        let mut state = self.state.lock();
        if state.running && state.status == SyncStatus::Registering {
            state.status = SyncStatus::AwaitingBlocks;
        }
    }

    /// Applies an ordered batch of blocks pushed by the daemon, then registers for the next one.
    ///
    /// A batch starting past the next needed height is not applied; the engine re-registers from
    /// the next needed height instead. Blocks at or below the scan height are skipped.
    pub fn add_blocks(&self, blocks: Vec<Block>) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(SyncError::NotRunning);
        }
        let Some(first) = blocks.first() else {
            tracing::warn!("Received an empty block batch");
            return Ok(());
        };

        let next_height = state.last_scan_height + 1;
        if first.height() > next_height {
            tracing::info!(
                "Block batch starts at {}, expected {}. Re-registering",
                first.height(),
                next_height
            );
            state.status = SyncStatus::Registering;
            drop(state);
            self.register(next_height, true, false);
            return Ok(());
        }

        state.status = SyncStatus::Syncing;
        let mut result = Ok(());
        let mut rewind = false;
        for block in &blocks {
            let expected = state.last_scan_height + 1;
            if block.height() < expected {
                tracing::trace!("Skipping already applied block {}", block.height());
                continue;
            }
            if block.height() > expected {
                tracing::info!("Gap before block {}, expected {}", block.height(), expected);
                rewind = true;
                break;
            }
            if let Err(error) = self.apply_block(&mut state, block) {
                tracing::warn!("Failed to apply block {}: {}", block.height(), error);
                result = Err(error);
                rewind = true;
                break;
            }
        }

        let next_height = state.last_scan_height + 1;
        state.status = SyncStatus::Registering;
        drop(state);
        // rewind the daemon to the first block not applied
        self.register(next_height, rewind, false);
        result
    }

    /// Applies a single block. Its height must follow the scan height.
    pub fn add_block(&self, block: &Block) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(SyncError::NotRunning);
        }
        if block.height() != state.last_scan_height + 1 {
            return Err(SyncError::UnexpectedHeight {
                height: block.height(),
                last_scan_height: state.last_scan_height,
            });
        }
        self.apply_block(&mut state, block)
    }

    fn apply_block(&self, state: &mut SyncState, block: &Block) -> Result<(), SyncError> {
        let mut db_tx = self.storage.scoped_transaction()?;
        db_tx.store_block(block)?;

        let mut received = 0;
        let mut spent = 0;
        for tx in block.transactions() {
            let outputs = self
                .scanner
                .scan_received(tx, block.height(), block.timestamp());
            if !outputs.is_empty() {
                received += outputs.len();
                db_tx.store_transaction(tx.hash(), block.height(), outputs)?;
            }

            let spends = self.scanner.scan_spent(tx.tx(), &db_tx);
            if !spends.is_empty() {
                spent += spends.len();
                db_tx.store_spends(tx.hash(), block.height(), spends)?;
            }
        }
        db_tx.commit()?;

        state.last_scan_height = block.height();
        state.scan_target_height = state.scan_target_height.max(block.height());
        if received > 0 || spent > 0 {
            tracing::info!(
                "Block {}: received {} outputs, spent {}",
                block.height(),
                received,
                spent
            );
        } else {
            tracing::debug!("Applied block {}", block.height());
        }
        Ok(())
    }

    /// Records the daemon's chain tip. Ignored once stopped.
    pub fn update_top_block_info(
        &self,
        height: BlockHeight,
        hash: BlockHash,
    ) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        if !state.running {
            tracing::debug!("Ignoring chain tip {} while stopped", height);
            return Ok(());
        }
        self.storage.update_top_block_info(height, hash)?;
        state.scan_target_height = height;
        Ok(())
    }

    /// Stops the engine and waits for the daemon to confirm no further block will be delivered.
    /// A batch finishing concurrently does not subscribe the engine again.
    ///
    /// Fails with [`SyncError::DeregisterTimeout`] if the confirmation does not arrive within the
    /// configured timeout.
    pub fn deregister(&self) -> Result<(), SyncError> {
        {
            let mut state = self.state.lock();
            state.running = false;
            state.status = SyncStatus::Stopped;
        }
        tracing::info!("Deregistering wallet");
        // a registration already in flight completes first
        drop(self.registration.lock());

        let (completion, confirmed) = crossbeam_channel::bounded(1);
        self.daemon.deregister_wallet(self.sink(), completion);
        match confirmed.recv_timeout(self.deregister_timeout) {
            Ok(()) => {
                tracing::info!("Wallet deregistered");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "Daemon did not confirm deregistration within {:?}",
                    self.deregister_timeout
                );
                Err(SyncError::DeregisterTimeout(self.deregister_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(SyncError::DeregisterAborted),
        }
    }

    /// Sum of all unspent outputs
    pub fn get_balance(&self) -> Result<u64, SyncError> {
        Ok(self.storage.overall_balance()?)
    }

    /// Sum of the unspent outputs spendable at the current scan height
    pub fn get_unlocked_balance(&self) -> Result<u64, SyncError> {
        let height = self.last_scan_height();
        Ok(self.storage.unlocked_balance(height)?)
    }

    /// Highest block height fully applied
    pub fn last_scan_height(&self) -> BlockHeight {
        self.state.lock().last_scan_height
    }

    /// Highest block height known to exist on the chain
    pub fn scan_target_height(&self) -> BlockHeight {
        self.state.lock().scan_target_height
    }

    /// Scan height and target height
    pub fn sync_progress(&self) -> (BlockHeight, BlockHeight) {
        let state = self.state.lock();
        (state.last_scan_height, state.scan_target_height)
    }

    /// Current lifecycle state
    pub fn status(&self) -> SyncStatus {
        self.state.lock().status
    }

    /// Returns true between [`Wallet::init`] and [`Wallet::deregister`]
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// The wallet's keys
    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    /// The wallet's storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }
}

impl<S, D> BlockSink for Wallet<S, D>
where
    S: WalletStorage,
    D: DaemonComms,
{
    fn deliver_blocks(&self, blocks: Vec<Block>) {
        match self.add_blocks(blocks) {
            Ok(()) => {}
            Err(SyncError::NotRunning) => tracing::debug!("Discarding blocks, wallet is stopped"),
            Err(error) => tracing::warn!("Block batch not fully applied: {}", error),
        }
    }

    fn deliver_top_block_info(&self, height: BlockHeight, hash: BlockHash) {
        if let Err(error) = self.update_top_block_info(height, hash) {
            tracing::warn!("Failed to record chain tip {}: {}", height, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use wallet3_config::Network;

    use super::*;
    use crate::mocks::{self, ChainBuilder, DeregisterResponse, MockDaemon, Registration};
    use crate::storage::InMemoryStorage;

    type TestWallet = Wallet<InMemoryStorage, MockDaemon>;

    fn config() -> WalletConfig {
        let mut config = WalletConfig::create_unconnected(Network::Fakechain, None);
        config.daemon.deregister_timeout = Duration::from_millis(50);
        config
    }

    fn wallet_over(storage: Arc<InMemoryStorage>) -> (Arc<TestWallet>, Arc<MockDaemon>) {
        let daemon = Arc::new(MockDaemon::new());
        let wallet = Wallet::new(
            Arc::new(mocks::keyring(1)),
            storage,
            daemon.clone(),
            &config(),
        )
        .unwrap();
        (wallet, daemon)
    }

    fn running_wallet() -> (Arc<TestWallet>, Arc<MockDaemon>) {
        let (wallet, daemon) = wallet_over(Arc::new(InMemoryStorage::new()));
        wallet.init();
        (wallet, daemon)
    }

    fn registration(
        next_height: BlockHeight,
        update_sync_height: bool,
        new_wallet: bool,
    ) -> Registration {
        Registration {
            next_height,
            update_sync_height,
            new_wallet,
        }
    }

    #[test]
    fn init_registers_for_next_block() {
        let (wallet, daemon) = wallet_over(Arc::new(InMemoryStorage::new()));
        assert_eq!(wallet.status(), SyncStatus::Stopped);
        assert!(daemon.registrations().is_empty());

        wallet.init();

        assert_eq!(daemon.registrations(), vec![registration(1, true, true)]);
        assert_eq!(wallet.status(), SyncStatus::AwaitingBlocks);
        assert!(wallet.is_running());
        assert_eq!(
            wallet.storage().address(SubaddressIndex::PRIMARY),
            Some(wallet.keyring().main_address())
        );
    }

    #[test]
    fn consecutive_blocks_advance_height_by_one_each() {
        let (wallet, daemon) = running_wallet();
        let mut chain = ChainBuilder::new();

        assert!(daemon.deliver_blocks(chain.empty_blocks(3)));

        assert_eq!(wallet.last_scan_height(), 3);
        assert_eq!(wallet.storage().last_scan_height().unwrap(), 3);
        assert_eq!(daemon.last_registration(), Some(registration(4, false, false)));
        assert_eq!(wallet.status(), SyncStatus::AwaitingBlocks);
    }

    #[test]
    fn gap_applies_nothing_and_reregisters() {
        let (wallet, daemon) = running_wallet();
        let mut chain = ChainBuilder::new();
        let blocks = chain.empty_blocks(5);

        daemon.deliver_blocks(blocks[2..].to_vec());

        assert_eq!(wallet.last_scan_height(), 0);
        assert_eq!(wallet.storage().block_hash(3), None);
        assert_eq!(daemon.last_registration(), Some(registration(1, true, false)));

        daemon.deliver_blocks(blocks);
        assert_eq!(wallet.last_scan_height(), 5);
    }

    #[test]
    fn gap_inside_batch_stops_and_rewinds() {
        let (wallet, daemon) = running_wallet();
        let mut chain = ChainBuilder::new();
        let blocks = chain.empty_blocks(4);

        daemon.deliver_blocks(vec![blocks[0].clone(), blocks[1].clone(), blocks[3].clone()]);

        assert_eq!(wallet.last_scan_height(), 2);
        assert_eq!(wallet.storage().block_hash(4), None);
        assert_eq!(daemon.last_registration(), Some(registration(3, true, false)));
    }

    #[test]
    fn duplicate_blocks_are_skipped() {
        let (wallet, daemon) = running_wallet();
        let keys = mocks::keyring(1);
        let mut chain = ChainBuilder::new();
        chain.pay(&keys.main_address(), 10);
        let first = chain.block();
        let second = chain.block();

        daemon.deliver_blocks(vec![first.clone(), second.clone()]);
        daemon.deliver_blocks(vec![first, second, chain.block()]);

        assert_eq!(wallet.last_scan_height(), 3);
        assert_eq!(wallet.get_balance().unwrap(), 10);
        assert_eq!(wallet.storage().outputs().len(), 1);
    }

    #[test]
    fn empty_batch_is_dropped() {
        let (wallet, daemon) = running_wallet();

        assert!(wallet.add_blocks(Vec::new()).is_ok());

        assert_eq!(daemon.registrations().len(), 1);
        assert_eq!(wallet.last_scan_height(), 0);
    }

    #[test]
    fn stopped_wallet_discards_blocks() {
        let (wallet, _daemon) = wallet_over(Arc::new(InMemoryStorage::new()));
        let mut chain = ChainBuilder::new();

        assert!(matches!(
            wallet.add_blocks(chain.empty_blocks(1)),
            Err(SyncError::NotRunning)
        ));
        assert_eq!(wallet.last_scan_height(), 0);
    }

    #[test]
    fn failed_commit_keeps_height_and_rewinds_daemon() {
        let (wallet, daemon) = running_wallet();
        let mut chain = ChainBuilder::new();
        let blocks = chain.empty_blocks(3);
        wallet.add_blocks(blocks[..1].to_vec()).unwrap();
        wallet.storage().fail_next_commits(1);

        assert!(matches!(
            wallet.add_blocks(blocks[1..].to_vec()),
            Err(SyncError::Storage(_))
        ));
        assert_eq!(wallet.last_scan_height(), 1);
        assert_eq!(wallet.storage().last_scan_height().unwrap(), 1);
        assert_eq!(daemon.last_registration(), Some(registration(2, true, false)));

        daemon.deliver_blocks(blocks[1..].to_vec());
        assert_eq!(wallet.last_scan_height(), 3);
    }

    #[test]
    fn single_block_must_follow_scan_height() {
        let (wallet, _daemon) = running_wallet();
        let mut chain = ChainBuilder::new();
        let blocks = chain.empty_blocks(2);

        assert!(matches!(
            wallet.add_block(&blocks[1]),
            Err(SyncError::UnexpectedHeight {
                height: 2,
                last_scan_height: 0
            })
        ));
        wallet.add_block(&blocks[0]).unwrap();
        assert_eq!(wallet.last_scan_height(), 1);
    }

    #[test]
    fn top_block_info_is_advisory() {
        let (wallet, daemon) = running_wallet();
        let mut chain = ChainBuilder::new();

        daemon.deliver_top_block(50, BlockHash([5; 32]));
        daemon.deliver_blocks(chain.empty_blocks(2));

        assert_eq!(wallet.sync_progress(), (2, 50));
        assert_eq!(wallet.storage().top_block_hash(), Some(BlockHash([5; 32])));
    }

    #[test]
    fn deregister_waits_for_confirmation() {
        let (wallet, daemon) = running_wallet();

        wallet.deregister().unwrap();

        assert_eq!(daemon.deregistrations(), 1);
        assert!(!daemon.is_registered());
        assert_eq!(wallet.status(), SyncStatus::Stopped);
        wallet
            .update_top_block_info(9, BlockHash::default())
            .unwrap();
        assert_eq!(wallet.scan_target_height(), 0);
    }

    #[test]
    fn deregister_during_batch_registration_stays_deregistered() {
        let (wallet, daemon) = running_wallet();
        let mut chain = ChainBuilder::new();
        let blocks = chain.empty_blocks(2);
        let paused = daemon.pause_next_registration();

        std::thread::scope(|scope| {
            let delivery = scope.spawn(|| daemon.deliver_blocks(blocks));
            paused
                .entered
                .recv_timeout(Duration::from_secs(5))
                .unwrap();
            let teardown = scope.spawn(|| wallet.deregister());

            // held back until the batch's registration returns
            std::thread::sleep(Duration::from_millis(20));
            assert_eq!(daemon.deregistrations(), 0);

            paused.release.send(()).unwrap();
            assert!(delivery.join().unwrap());
            teardown.join().unwrap().unwrap();
        });

        assert_eq!(wallet.last_scan_height(), 2);
        assert_eq!(daemon.registrations().len(), 2);
        assert_eq!(daemon.deregistrations(), 1);
        assert!(!daemon.is_registered());
        assert_eq!(wallet.status(), SyncStatus::Stopped);
    }

    #[test]
    fn registration_after_deregister_is_skipped() {
        let (wallet, daemon) = running_wallet();
        wallet.deregister().unwrap();

        wallet.register(1, true, false);

        assert_eq!(daemon.registrations().len(), 1);
        assert!(!daemon.is_registered());
    }

    #[test]
    fn readers_never_see_a_partly_applied_block() {
        let (wallet, daemon) = running_wallet();
        let address = wallet.keyring().main_address();
        let mut chain = ChainBuilder::new();
        let blocks: Vec<Block> = (0..40)
            .map(|_| {
                chain.pay(&address, 1);
                chain.block()
            })
            .collect();
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for block in blocks {
                    daemon.deliver_blocks(vec![block]);
                }
                done.store(true, Ordering::SeqCst);
            });
            scope.spawn(|| {
                // every block pays one unit, so the balance counts committed blocks
                while !done.load(Ordering::SeqCst) {
                    let before = wallet.last_scan_height();
                    let balance = wallet.get_balance().unwrap();
                    let (after, _) = wallet.sync_progress();
                    assert!(
                        before <= balance && balance <= after,
                        "height {} then {}, balance {}",
                        before,
                        after,
                        balance
                    );
                }
            });
        });

        assert_eq!(wallet.last_scan_height(), 40);
        assert_eq!(wallet.get_balance().unwrap(), 40);
    }

    #[test]
    fn deregister_times_out_without_confirmation() {
        let (wallet, daemon) = running_wallet();
        daemon.set_deregister_response(DeregisterResponse::Withhold);

        assert!(matches!(
            wallet.deregister(),
            Err(SyncError::DeregisterTimeout(timeout)) if timeout == Duration::from_millis(50)
        ));
        assert!(!wallet.is_running());
    }

    #[test]
    fn deregister_fails_when_signal_dropped() {
        let (wallet, daemon) = running_wallet();
        daemon.set_deregister_response(DeregisterResponse::Drop);

        assert!(matches!(
            wallet.deregister(),
            Err(SyncError::DeregisterAborted)
        ));
    }

    #[test]
    fn restart_resumes_from_persisted_height() {
        let storage = Arc::new(InMemoryStorage::new());
        let (wallet, daemon) = wallet_over(storage.clone());
        wallet.init();
        let mut chain = ChainBuilder::new();
        daemon.deliver_blocks(chain.empty_blocks(4));
        wallet.deregister().unwrap();
        drop(wallet);

        let (reopened, daemon) = wallet_over(storage);
        reopened.init();

        assert_eq!(reopened.last_scan_height(), 4);
        assert_eq!(daemon.registrations(), vec![registration(5, true, true)]);
    }

    #[test]
    fn dropped_wallet_receives_nothing() {
        let (wallet, daemon) = running_wallet();
        drop(wallet);

        let mut chain = ChainBuilder::new();
        assert!(!daemon.deliver_blocks(chain.empty_blocks(1)));
    }

    #[test]
    fn unlocked_balance_follows_scan_height() {
        let (wallet, daemon) = running_wallet();
        let mut chain = ChainBuilder::new();
        chain.pay(&wallet.keyring().main_address(), 25);
        daemon.deliver_blocks(vec![chain.block()]);

        assert_eq!(wallet.get_balance().unwrap(), 25);
        assert_eq!(wallet.get_unlocked_balance().unwrap(), 0);

        daemon.deliver_blocks(chain.empty_blocks(10));
        assert_eq!(wallet.last_scan_height(), 11);
        assert_eq!(wallet.get_unlocked_balance().unwrap(), 25);
    }
}
