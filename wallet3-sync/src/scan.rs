//! Per-transaction detection of received outputs and spends.

use std::sync::Arc;

use wallet3_config::WalletConfig;

use crate::interface::OwnedKeyImages;
use crate::keys::{KeyMatcher, Keyring};
use crate::primitives::{BlockHeight, BlockTx, KeyImage, Output, Transaction};

/// Unlock times below this value are block heights, others are unix timestamps.
pub const MAX_BLOCK_NUMBER: u64 = 500_000_000;

/// Rules deciding the height at which a received output becomes spendable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockRules {
    /// Blocks an ordinary output must age
    pub spendable_age: u64,
    /// Blocks a coinbase output must age
    pub coinbase_unlock_window: u64,
    /// Seconds per block, used to convert timestamp unlock times
    pub target_block_time: u64,
}

impl UnlockRules {
    /// Rules of the configured network
    pub fn from_config(config: &WalletConfig) -> Self {
        Self {
            spendable_age: config.construction.spendable_age,
            coinbase_unlock_window: config.construction.coinbase_unlock_window,
            target_block_time: config.network.target_block_time(),
        }
    }

    /// Height from which the outputs of `tx`, mined at `height` and `timestamp`, can be spent
    pub fn unlock_height(
        &self,
        tx: &Transaction,
        height: BlockHeight,
        timestamp: u64,
    ) -> BlockHeight {
        let age = if tx.is_coinbase() {
            self.coinbase_unlock_window
        } else {
            self.spendable_age
        };
        let default_unlock = height + age;

        let requested = match tx.unlock_time {
            0 => return default_unlock,
            unlock_time if unlock_time < MAX_BLOCK_NUMBER => unlock_time,
            unlock_time if unlock_time <= timestamp => return default_unlock,
            unlock_time => {
                height + (unlock_time - timestamp).div_ceil(self.target_block_time.max(1))
            }
        };
        default_unlock.max(requested)
    }
}

/// Applies the key matcher to transactions, producing owned outputs and detecting their spends.
#[derive(Debug, Clone)]
pub struct TransactionScanner {
    keyring: Arc<Keyring>,
    unlock_rules: UnlockRules,
}

impl TransactionScanner {
    /// Creates a scanner for `keyring`
    pub fn new(keyring: Arc<Keyring>, unlock_rules: UnlockRules) -> Self {
        Self {
            keyring,
            unlock_rules,
        }
    }

    /// Returns the outputs of `tx` owned by the wallet, unspent, in output order.
    ///
    /// Owned outputs without a key image (view-only keyring) or without a global index are
    /// skipped: they could never be spent through this wallet.
    pub fn scan_received(
        &self,
        tx: &BlockTx,
        height: BlockHeight,
        timestamp: u64,
    ) -> Vec<Output> {
        let matches = KeyMatcher::new(&self.keyring).owned_outputs(tx.tx());
        if matches.is_empty() {
            return Vec::new();
        }
        let unlock_height = self.unlock_rules.unlock_height(tx.tx(), height, timestamp);

        matches
            .into_iter()
            .filter_map(|owned| {
                let Some(key_image) = owned.key_image else {
                    tracing::debug!(
                        "Output {} of tx {} is owned but has no key image",
                        owned.output_index,
                        tx.hash()
                    );
                    return None;
                };
                let Some(global_index) = tx.global_indices().get(owned.output_index as usize)
                else {
                    tracing::warn!(
                        "Output {} of tx {} is owned but has no global index",
                        owned.output_index,
                        tx.hash()
                    );
                    return None;
                };
                Some(Output::from_parts(
                    owned.amount,
                    owned.key,
                    key_image,
                    *global_index,
                    owned.subaddress,
                    unlock_height,
                    height,
                    timestamp,
                    tx.hash(),
                    owned.output_index,
                    owned.tx_pubkey,
                ))
            })
            .collect()
    }

    /// Returns the key images spent by `tx` that belong to the wallet
    pub fn scan_spent<O>(&self, tx: &Transaction, owned: &O) -> Vec<KeyImage>
    where
        O: OwnedKeyImages + ?Sized,
    {
        tx.key_images()
            .filter(|key_image| owned.is_key_image_mine(key_image))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use test_case::test_case;

    use super::*;
    use crate::mocks::{self, ChainBuilder};
    use crate::primitives::{TxExtra, TxInput};

    const BLOCK_TIME: u64 = 1_600_000_000;

    fn rules() -> UnlockRules {
        UnlockRules {
            spendable_age: 10,
            coinbase_unlock_window: 30,
            target_block_time: 120,
        }
    }

    fn tx(coinbase: bool, unlock_time: u64) -> Transaction {
        let inputs = if coinbase {
            vec![TxInput::Gen { height: 100 }]
        } else {
            Vec::new()
        };
        Transaction {
            version: 4,
            unlock_time,
            inputs,
            outputs: Vec::new(),
            extra: TxExtra::default(),
            fee: 0,
        }
    }

    #[test_case(false, 0, 110 ; "normal output ages ten blocks")]
    #[test_case(true, 0, 130 ; "coinbase output ages thirty blocks")]
    #[test_case(false, 105, 110 ; "unlock height below spendable age")]
    #[test_case(false, 500, 500 ; "unlock height above spendable age")]
    #[test_case(false, BLOCK_TIME + 120 * 50, 150 ; "unlock timestamp converted to blocks")]
    #[test_case(false, BLOCK_TIME + 1, 110 ; "unlock timestamp within spendable age")]
    #[test_case(false, BLOCK_TIME - 1, 110 ; "unlock timestamp already passed")]
    fn unlock_height(coinbase: bool, unlock_time: u64, expected: BlockHeight) {
        assert_eq!(
            rules().unlock_height(&tx(coinbase, unlock_time), 100, BLOCK_TIME),
            expected
        );
    }

    #[test]
    fn scan_received_populates_owned_outputs() {
        let keys = Arc::new(mocks::keyring(1));
        let stranger = mocks::keyring(2);
        let mut chain = ChainBuilder::new();
        chain.pay(&stranger.main_address(), 3);
        chain.pay(&keys.main_address(), 10);
        let block = chain.block();
        let scanner = TransactionScanner::new(keys, rules());

        let found: Vec<Output> = block
            .transactions()
            .iter()
            .flat_map(|tx| scanner.scan_received(tx, block.height(), block.timestamp()))
            .collect();

        assert_eq!(found.len(), 1);
        let output = &found[0];
        assert_eq!(output.amount(), 10);
        assert_eq!(output.block_height(), 1);
        assert_eq!(output.unlock_height(), 11);
        assert_eq!(output.global_index(), 1);
        assert_eq!(output.tx_hash(), block.transactions()[1].hash());
        assert!(!output.spent());
    }

    #[test]
    fn scan_received_skips_outputs_without_global_index() {
        let keys = Arc::new(mocks::keyring(1));
        let mut chain = ChainBuilder::new();
        chain.pay(&keys.main_address(), 10);
        let block = chain.block();
        let paid = &block.transactions()[0];
        let stripped = BlockTx::from_parts(paid.hash(), paid.tx().clone(), Vec::new());

        let scanner = TransactionScanner::new(keys, rules());

        assert_eq!(scanner.scan_received(paid, 1, 0).len(), 1);
        assert!(scanner.scan_received(&stripped, 1, 0).is_empty());
    }

    #[test]
    fn scan_spent_returns_only_owned_key_images() {
        let keys = Arc::new(mocks::keyring(1));
        let scanner = TransactionScanner::new(keys, rules());
        let owned: HashSet<KeyImage> = [KeyImage([1; 32]), KeyImage([2; 32])].into();
        let mut chain = ChainBuilder::new();
        chain.spend(&[KeyImage([2; 32]), KeyImage([3; 32])]);
        let block = chain.block();

        let spent = scanner.scan_spent(block.transactions()[0].tx(), &owned);

        assert_eq!(spent, vec![KeyImage([2; 32])]);
        assert!(scanner
            .scan_spent(block.transactions()[0].tx(), &HashSet::new())
            .is_empty());
    }
}
