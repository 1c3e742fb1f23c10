//! Module for primitive structs associated with the sync engine

use std::fmt;

use getset::{CopyGetters, Getters};

/// Chain position of a block.
pub type BlockHeight = u64;

macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Returns the raw bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }
    };
}

hash_newtype!(
    /// Hash identifying a block
    BlockHash
);
hash_newtype!(
    /// Hash identifying a transaction
    TxHash
);
hash_newtype!(
    /// Deterministic tag of an output's spend. Unique per output, so it identifies the spend of
    /// an owned output without revealing which ring member was real.
    KeyImage
);

/// Index of a wallet subaddress. `(0, 0)` is the primary address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SubaddressIndex {
    /// Account
    pub major: u32,
    /// Address within the account
    pub minor: u32,
}

impl SubaddressIndex {
    /// The wallet's primary address
    pub const PRIMARY: SubaddressIndex = SubaddressIndex { major: 0, minor: 0 };

    /// Creates new SubaddressIndex from parts
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Returns true for the primary address
    pub fn is_primary(&self) -> bool {
        *self == Self::PRIMARY
    }
}

/// Public output of a transaction as it appears on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    /// One-time public key (compressed edwards point)
    pub key: [u8; 32],
    /// First byte of the view tag hash, lets recipients skip most non-owned outputs cheaply
    pub view_tag: Option<u8>,
    /// Amount masked with the shared secret of the recipient
    pub encrypted_amount: [u8; 8],
}

/// Transaction input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxInput {
    /// Coinbase input, creates the block reward
    Gen {
        /// Height of the block the reward belongs to
        height: BlockHeight,
    },
    /// Spend of a ring of existing outputs
    ToKey {
        /// Relative global output indices of the ring members
        key_offsets: Vec<u64>,
        /// Key image of the real output being spent
        key_image: KeyImage,
    },
}

/// Parsed fields of a transaction's extra relevant to output detection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxExtra {
    /// Transaction public key `R`
    pub tx_pubkey: Option<[u8; 32]>,
    /// Per-output transaction public keys, present when paying subaddresses
    pub additional_pubkeys: Vec<[u8; 32]>,
}

/// A transaction's parsed on-chain representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Transaction format version
    pub version: u8,
    /// Height (below [`crate::scan::MAX_BLOCK_NUMBER`]) or unix timestamp the outputs are locked until
    pub unlock_time: u64,
    /// Inputs
    pub inputs: Vec<TxInput>,
    /// Outputs
    pub outputs: Vec<TxOutput>,
    /// Detection-relevant extra fields
    pub extra: TxExtra,
    /// Fee paid by the transaction
    pub fee: u64,
}

impl Transaction {
    /// Returns true if the transaction creates the block reward
    pub fn is_coinbase(&self) -> bool {
        matches!(self.inputs.first(), Some(TxInput::Gen { .. }))
    }

    /// Key images of every ring input
    pub fn key_images(&self) -> impl Iterator<Item = &KeyImage> {
        self.inputs.iter().filter_map(|input| match input {
            TxInput::ToKey { key_image, .. } => Some(key_image),
            TxInput::Gen { .. } => None,
        })
    }
}

/// A transaction delivered as part of a block, with the global indices of its outputs
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct BlockTx {
    #[getset(get_copy = "pub")]
    hash: TxHash,
    #[getset(get = "pub")]
    tx: Transaction,
    #[getset(skip)]
    global_indices: Vec<u64>,
}

impl BlockTx {
    /// Creates new BlockTx from parts
    pub fn from_parts(hash: TxHash, tx: Transaction, global_indices: Vec<u64>) -> Self {
        Self {
            hash,
            tx,
            global_indices,
        }
    }

    /// Global output index of each output, in output order
    pub fn global_indices(&self) -> &[u64] {
        &self.global_indices
    }
}

/// Block data as delivered by the daemon
#[derive(Debug, Clone, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Block {
    height: BlockHeight,
    hash: BlockHash,
    timestamp: u64,
    #[getset(skip)]
    transactions: Vec<BlockTx>,
}

impl Block {
    /// Creates new Block from parts
    pub fn from_parts(
        height: BlockHeight,
        hash: BlockHash,
        timestamp: u64,
        transactions: Vec<BlockTx>,
    ) -> Self {
        Self {
            height,
            hash,
            timestamp,
            transactions,
        }
    }

    /// Transactions in block order, coinbase first
    pub fn transactions(&self) -> &[BlockTx] {
        &self.transactions
    }
}

/// An output owned by the wallet
#[derive(Debug, Clone, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Output {
    amount: u64,
    /// One-time public key
    key: [u8; 32],
    key_image: KeyImage,
    global_index: u64,
    subaddress: SubaddressIndex,
    unlock_height: BlockHeight,
    block_height: BlockHeight,
    block_time: u64,
    tx_hash: TxHash,
    /// Index of the output within its transaction
    output_index: u32,
    /// Transaction public key the output was derived from
    tx_pubkey: [u8; 32],
    spent: bool,
}

impl Output {
    /// Creates a new unspent Output from parts
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        amount: u64,
        key: [u8; 32],
        key_image: KeyImage,
        global_index: u64,
        subaddress: SubaddressIndex,
        unlock_height: BlockHeight,
        block_height: BlockHeight,
        block_time: u64,
        tx_hash: TxHash,
        output_index: u32,
        tx_pubkey: [u8; 32],
    ) -> Self {
        Self {
            amount,
            key,
            key_image,
            global_index,
            subaddress,
            unlock_height,
            block_height,
            block_time,
            tx_hash,
            output_index,
            tx_pubkey,
            spent: false,
        }
    }

    /// Flags the output as spent
    pub fn mark_spent(&mut self) {
        self.spent = true;
    }

    /// Returns true if the output can be spent in a block following `height`
    pub fn is_unlocked_at(&self, height: BlockHeight) -> bool {
        self.unlock_height <= height
    }
}

/// Spend of an owned output, identified by its key image
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct SpendRecord {
    key_image: KeyImage,
    height: BlockHeight,
    tx_hash: TxHash,
}

impl SpendRecord {
    /// Creates new SpendRecord from parts
    pub fn from_parts(key_image: KeyImage, height: BlockHeight, tx_hash: TxHash) -> Self {
        Self {
            key_image,
            height,
            tx_hash,
        }
    }
}

/// Public data of an output fetched from the daemon for use as a ring member
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct DecoyOutput {
    global_index: u64,
    key: [u8; 32],
    /// Amount commitment
    mask: [u8; 32],
    unlocked: bool,
    height: BlockHeight,
    tx_hash: TxHash,
}

impl DecoyOutput {
    /// Creates new DecoyOutput from parts
    pub fn from_parts(
        global_index: u64,
        key: [u8; 32],
        mask: [u8; 32],
        unlocked: bool,
        height: BlockHeight,
        tx_hash: TxHash,
    ) -> Self {
        Self {
            global_index,
            key,
            mask,
            unlocked,
            height,
            tx_hash,
        }
    }
}
