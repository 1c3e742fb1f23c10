//! In-memory implementation of the wallet storage contract.
//!
//! Writes made through a [`InMemoryTransaction`] are staged and only applied, all at once and
//! under a single write lock, when the transaction is committed. Readers therefore observe either
//! the state before a block or the state after it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::StorageError;
use crate::interface::{OwnedKeyImages, StorageTransaction, WalletStorage};
use crate::keys::Address;
use crate::primitives::{
    Block, BlockHash, BlockHeight, KeyImage, Output, SpendRecord, SubaddressIndex, TxHash,
};

#[derive(Debug, Default)]
struct WalletData {
    last_scan_height: BlockHeight,
    scan_target_height: BlockHeight,
    top_block_hash: Option<BlockHash>,
    block_hashes: BTreeMap<BlockHeight, BlockHash>,
    outputs: BTreeMap<KeyImage, Output>,
    spends: BTreeMap<KeyImage, SpendRecord>,
    addresses: BTreeMap<SubaddressIndex, Address>,
}

/// Wallet storage held in memory
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    data: RwLock<WalletData>,
    failing_commits: AtomicUsize,
}

impl InMemoryStorage {
    /// Creates an empty storage. Nothing has been scanned: the first block needed is height 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash of the scanned block at `height`
    pub fn block_hash(&self, height: BlockHeight) -> Option<BlockHash> {
        self.data.read().block_hashes.get(&height).copied()
    }

    /// Hash of the last reported chain tip
    pub fn top_block_hash(&self) -> Option<BlockHash> {
        self.data.read().top_block_hash
    }

    /// Stored receiving address for a subaddress index
    pub fn address(&self, index: SubaddressIndex) -> Option<Address> {
        self.data.read().addresses.get(&index).copied()
    }

    /// Every owned output, spent ones included, ordered by key image
    pub fn outputs(&self) -> Vec<Output> {
        self.data.read().outputs.values().cloned().collect()
    }

    /// Spend record of an owned output
    pub fn spend(&self, key_image: &KeyImage) -> Option<SpendRecord> {
        self.data.read().spends.get(key_image).copied()
    }

    /// Makes the next `count` commits fail without applying anything
    #[cfg(any(test, feature = "test-features"))]
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    fn take_commit_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl OwnedKeyImages for InMemoryStorage {
    fn is_key_image_mine(&self, key_image: &KeyImage) -> bool {
        self.data.read().outputs.contains_key(key_image)
    }
}

impl WalletStorage for InMemoryStorage {
    type Transaction<'a> = InMemoryTransaction<'a>;

    fn scoped_transaction(&self) -> Result<Self::Transaction<'_>, StorageError> {
        Ok(InMemoryTransaction {
            storage: self,
            blocks: Vec::new(),
            outputs: Vec::new(),
            spends: Vec::new(),
            finished: false,
        })
    }

    fn add_address(&self, index: SubaddressIndex, address: &Address) -> Result<(), StorageError> {
        self.data.write().addresses.insert(index, *address);
        Ok(())
    }

    fn last_scan_height(&self) -> Result<BlockHeight, StorageError> {
        Ok(self.data.read().last_scan_height)
    }

    fn scan_target_height(&self) -> Result<BlockHeight, StorageError> {
        Ok(self.data.read().scan_target_height)
    }

    fn update_top_block_info(
        &self,
        height: BlockHeight,
        hash: BlockHash,
    ) -> Result<(), StorageError> {
        let mut data = self.data.write();
        data.scan_target_height = height;
        data.top_block_hash = Some(hash);
        Ok(())
    }

    fn overall_balance(&self) -> Result<u64, StorageError> {
        Ok(self
            .data
            .read()
            .outputs
            .values()
            .filter(|output| !output.spent())
            .map(|output| output.amount())
            .sum())
    }

    fn unlocked_balance(&self, height: BlockHeight) -> Result<u64, StorageError> {
        Ok(self
            .available_outputs(height)?
            .iter()
            .map(|output| output.amount())
            .sum())
    }

    fn available_outputs(&self, height: BlockHeight) -> Result<Vec<Output>, StorageError> {
        Ok(self
            .data
            .read()
            .outputs
            .values()
            .filter(|output| !output.spent() && output.is_unlocked_at(height))
            .cloned()
            .collect())
    }

    fn output(&self, key_image: &KeyImage) -> Result<Option<Output>, StorageError> {
        Ok(self.data.read().outputs.get(key_image).cloned())
    }
}

/// Scoped transaction of [`InMemoryStorage`]. Dropping it without committing discards every
/// staged write.
#[derive(Debug)]
pub struct InMemoryTransaction<'a> {
    storage: &'a InMemoryStorage,
    blocks: Vec<(BlockHeight, BlockHash)>,
    outputs: Vec<Output>,
    spends: Vec<SpendRecord>,
    finished: bool,
}

impl InMemoryTransaction<'_> {
    fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.outputs.is_empty() && self.spends.is_empty()
    }
}

impl OwnedKeyImages for InMemoryTransaction<'_> {
    fn is_key_image_mine(&self, key_image: &KeyImage) -> bool {
        self.outputs
            .iter()
            .any(|output| output.key_image() == *key_image)
            || self.storage.is_key_image_mine(key_image)
    }
}

impl StorageTransaction for InMemoryTransaction<'_> {
    fn store_block(&mut self, block: &Block) -> Result<(), StorageError> {
        self.blocks.push((block.height(), block.hash()));
        Ok(())
    }

    fn store_transaction(
        &mut self,
        _hash: TxHash,
        _height: BlockHeight,
        outputs: Vec<Output>,
    ) -> Result<(), StorageError> {
        self.outputs.extend(outputs);
        Ok(())
    }

    fn store_spends(
        &mut self,
        hash: TxHash,
        height: BlockHeight,
        key_images: Vec<KeyImage>,
    ) -> Result<(), StorageError> {
        self.spends.extend(
            key_images
                .into_iter()
                .map(|key_image| SpendRecord::from_parts(key_image, height, hash)),
        );
        Ok(())
    }

    fn commit(mut self) -> Result<(), StorageError> {
        self.finished = true;
        if self.storage.take_commit_failure() {
            return Err(StorageError::CommitFailed(
                "injected commit failure".to_string(),
            ));
        }

        let mut data = self.storage.data.write();
        // received before spent, a block may contain both
        for output in std::mem::take(&mut self.outputs) {
            data.outputs.entry(output.key_image()).or_insert(output);
        }
        for spend in std::mem::take(&mut self.spends) {
            if let Some(output) = data.outputs.get_mut(&spend.key_image()) {
                output.mark_spent();
            }
            data.spends.insert(spend.key_image(), spend);
        }
        for (height, hash) in std::mem::take(&mut self.blocks) {
            data.block_hashes.insert(height, hash);
            data.last_scan_height = height;
            data.scan_target_height = data.scan_target_height.max(height);
        }
        Ok(())
    }
}

impl Drop for InMemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.is_empty() {
            tracing::debug!(
                "Discarding uncommitted storage transaction with {} blocks, {} outputs and {} spends",
                self.blocks.len(),
                self.outputs.len(),
                self.spends.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(amount: u64, image: u8, unlock_height: BlockHeight) -> Output {
        Output::from_parts(
            amount,
            [image; 32],
            KeyImage([image; 32]),
            image as u64,
            SubaddressIndex::PRIMARY,
            unlock_height,
            1,
            0,
            TxHash([image; 32]),
            0,
            [0; 32],
        )
    }

    fn block(height: BlockHeight) -> Block {
        Block::from_parts(height, BlockHash([height as u8; 32]), 0, Vec::new())
    }

    #[test]
    fn uncommitted_writes_are_invisible_and_discarded() {
        let storage = InMemoryStorage::new();
        {
            let mut tx = storage.scoped_transaction().unwrap();
            tx.store_block(&block(1)).unwrap();
            tx.store_transaction(TxHash::default(), 1, vec![output(5, 1, 0)])
                .unwrap();
            assert!(tx.is_key_image_mine(&KeyImage([1; 32])));
            assert!(!storage.is_key_image_mine(&KeyImage([1; 32])));
        }

        assert_eq!(storage.last_scan_height().unwrap(), 0);
        assert_eq!(storage.overall_balance().unwrap(), 0);
        assert_eq!(storage.block_hash(1), None);
    }

    #[test]
    fn commit_applies_block_outputs_and_spends() {
        let storage = InMemoryStorage::new();
        let mut tx = storage.scoped_transaction().unwrap();
        tx.store_block(&block(1)).unwrap();
        tx.store_transaction(TxHash::default(), 1, vec![output(5, 1, 0), output(7, 2, 0)])
            .unwrap();
        tx.store_spends(TxHash([9; 32]), 1, vec![KeyImage([2; 32])])
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(storage.last_scan_height().unwrap(), 1);
        assert_eq!(storage.scan_target_height().unwrap(), 1);
        assert_eq!(storage.block_hash(1), Some(BlockHash([1; 32])));
        assert_eq!(storage.overall_balance().unwrap(), 5);
        assert!(storage.output(&KeyImage([2; 32])).unwrap().unwrap().spent());
        assert_eq!(
            storage.spend(&KeyImage([2; 32])).unwrap().tx_hash(),
            TxHash([9; 32])
        );
    }

    #[test]
    fn reapplying_outputs_keeps_spent_flag() {
        let storage = InMemoryStorage::new();
        let mut tx = storage.scoped_transaction().unwrap();
        tx.store_transaction(TxHash::default(), 1, vec![output(5, 1, 0)])
            .unwrap();
        tx.store_spends(TxHash::default(), 2, vec![KeyImage([1; 32])])
            .unwrap();
        tx.commit().unwrap();

        let mut tx = storage.scoped_transaction().unwrap();
        tx.store_transaction(TxHash::default(), 1, vec![output(5, 1, 0)])
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(storage.outputs().len(), 1);
        assert_eq!(storage.overall_balance().unwrap(), 0);
    }

    #[test]
    fn injected_failure_applies_nothing() {
        let storage = InMemoryStorage::new();
        storage.fail_next_commits(1);

        let mut tx = storage.scoped_transaction().unwrap();
        tx.store_block(&block(1)).unwrap();
        assert!(matches!(tx.commit(), Err(StorageError::CommitFailed(_))));
        assert_eq!(storage.last_scan_height().unwrap(), 0);

        let mut tx = storage.scoped_transaction().unwrap();
        tx.store_block(&block(1)).unwrap();
        tx.commit().unwrap();
        assert_eq!(storage.last_scan_height().unwrap(), 1);
    }

    #[test]
    fn unlocked_balance_respects_unlock_height() {
        let storage = InMemoryStorage::new();
        let mut tx = storage.scoped_transaction().unwrap();
        tx.store_transaction(TxHash::default(), 1, vec![output(5, 1, 11), output(3, 2, 40)])
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(storage.unlocked_balance(10).unwrap(), 0);
        assert_eq!(storage.unlocked_balance(11).unwrap(), 5);
        assert_eq!(storage.unlocked_balance(40).unwrap(), 8);
        assert_eq!(storage.available_outputs(11).unwrap().len(), 1);
        assert_eq!(storage.overall_balance().unwrap(), 8);
    }

    #[test]
    fn top_block_info_updates_target() {
        let storage = InMemoryStorage::new();
        storage
            .update_top_block_info(120, BlockHash([4; 32]))
            .unwrap();

        assert_eq!(storage.scan_target_height().unwrap(), 120);
        assert_eq!(storage.top_block_hash(), Some(BlockHash([4; 32])));
    }
}
