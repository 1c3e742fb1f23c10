//! Traits for interfacing the sync engine with its collaborators: the daemon, the wallet storage
//! and the consumer of pushed blocks.

use std::future::Future;
use std::sync::Weak;

use crate::construct::fees::FeeParameters;
use crate::error::{DaemonError, StorageError};
use crate::keys::Address;
use crate::primitives::{
    Block, BlockHash, BlockHeight, DecoyOutput, KeyImage, Output, SubaddressIndex, TxHash,
};

/// Receives blocks and chain tip notifications pushed by the daemon.
///
/// The daemon holds a [`Weak`] reference to the sink so that it never keeps a wallet alive, and
/// drops deliveries for a wallet whose last owner released it.
pub trait BlockSink: Send + Sync {
    /// Delivers an ordered batch of blocks
    fn deliver_blocks(&self, blocks: Vec<Block>);

    /// Delivers the height and hash of the current chain tip
    fn deliver_top_block_info(&self, height: BlockHeight, hash: BlockHash);
}

/// Channel to the daemon the wallet syncs from
pub trait DaemonComms: Send + Sync + 'static {
    /// Subscribes `wallet` to blocks starting at `next_height`.
    ///
    /// `update_sync_height` asks the daemon to move its delivery cursor to `next_height` even if it
    /// already delivered past it. `new_wallet` marks a fresh subscription.
    fn register_wallet(
        &self,
        wallet: Weak<dyn BlockSink>,
        next_height: BlockHeight,
        update_sync_height: bool,
        new_wallet: bool,
    );

    /// Stops delivery to `wallet`. `completion` must be signalled once no further delivery can
    /// reach the wallet.
    fn deregister_wallet(
        &self,
        wallet: Weak<dyn BlockSink>,
        completion: crossbeam_channel::Sender<()>,
    );

    /// Current fee rates
    fn get_fee_parameters(&self) -> impl Future<Output = Result<FeeParameters, DaemonError>> + Send;

    /// Number of outputs on chain; global output indices are `0..count`
    fn get_output_count(&self) -> impl Future<Output = Result<u64, DaemonError>> + Send;

    /// Public data of the outputs at the given global indices
    fn get_outputs(
        &self,
        indices: Vec<u64>,
    ) -> impl Future<Output = Result<Vec<DecoyOutput>, DaemonError>> + Send;

    /// Global indices of outputs that must never be used as ring members
    fn get_output_blacklist(&self) -> impl Future<Output = Result<Vec<u64>, DaemonError>> + Send;
}

/// Lookup of the wallet's own key images
pub trait OwnedKeyImages {
    /// Returns true if `key_image` belongs to an output owned by the wallet
    fn is_key_image_mine(&self, key_image: &KeyImage) -> bool;
}

/// Writes staged for one block. Nothing is visible to readers of the storage until
/// [`StorageTransaction::commit`] succeeds; dropping the transaction discards the writes.
///
/// Lookups through [`OwnedKeyImages`] see the staged outputs.
pub trait StorageTransaction: OwnedKeyImages {
    /// Records the block as scanned, advancing the persisted scan height to its height
    fn store_block(&mut self, block: &Block) -> Result<(), StorageError>;

    /// Records the owned outputs received in a transaction
    fn store_transaction(
        &mut self,
        hash: TxHash,
        height: BlockHeight,
        outputs: Vec<Output>,
    ) -> Result<(), StorageError>;

    /// Records the spends of owned outputs made by a transaction
    fn store_spends(
        &mut self,
        hash: TxHash,
        height: BlockHeight,
        key_images: Vec<KeyImage>,
    ) -> Result<(), StorageError>;

    /// Applies every staged write atomically
    fn commit(self) -> Result<(), StorageError>;
}

/// Persistent wallet storage
pub trait WalletStorage: OwnedKeyImages + Send + Sync + 'static {
    /// Scoped transaction type
    type Transaction<'a>: StorageTransaction
    where
        Self: 'a;

    /// Opens a scoped transaction
    fn scoped_transaction(&self) -> Result<Self::Transaction<'_>, StorageError>;

    /// Records a receiving address of the wallet
    fn add_address(&self, index: SubaddressIndex, address: &Address) -> Result<(), StorageError>;

    /// Highest block height fully applied
    fn last_scan_height(&self) -> Result<BlockHeight, StorageError>;

    /// Highest block height known to exist on the chain
    fn scan_target_height(&self) -> Result<BlockHeight, StorageError>;

    /// Records the chain tip
    fn update_top_block_info(
        &self,
        height: BlockHeight,
        hash: BlockHash,
    ) -> Result<(), StorageError>;

    /// Sum of all unspent outputs
    fn overall_balance(&self) -> Result<u64, StorageError>;

    /// Sum of the unspent outputs unlocked at `height`
    fn unlocked_balance(&self, height: BlockHeight) -> Result<u64, StorageError>;

    /// Unspent outputs unlocked at `height`
    fn available_outputs(&self, height: BlockHeight) -> Result<Vec<Output>, StorageError>;

    /// Owned output with the given key image
    fn output(&self, key_image: &KeyImage) -> Result<Option<Output>, StorageError>;
}

impl OwnedKeyImages for std::collections::HashSet<KeyImage> {
    fn is_key_image_mine(&self, key_image: &KeyImage) -> bool {
        self.contains(key_image)
    }
}
