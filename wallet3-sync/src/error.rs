//! Top level error module for the crate

use std::time::Duration;

use crate::primitives::BlockHeight;

/// Errors reported by a storage backend
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The scoped transaction could not be committed; nothing it staged was applied
    #[error("Commit failed. {0}")]
    CommitFailed(String),
    /// The backend cannot be read or written
    #[error("Storage unavailable. {0}")]
    Unavailable(String),
}

/// Errors reported by the daemon communications channel
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// The daemon could not be reached or did not answer
    #[error("Daemon unreachable. {0}")]
    Unreachable(String),
    /// The daemon answered without some of the requested outputs
    #[error("Daemon returned {returned} of {requested} requested outputs")]
    MissingOutputs {
        /// Number of outputs asked for
        requested: usize,
        /// Number of outputs answered
        returned: usize,
    },
}

/// Top level error enum encapsulating any error that may occur during sync
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Errors associated with the storage backend
    #[error("Storage error. {0}")]
    Storage(#[from] StorageError),
    /// Errors associated with the daemon
    #[error("Daemon error. {0}")]
    Daemon(#[from] DaemonError),
    /// A single block was handed to the engine out of order
    #[error("Block with height {height} does not follow last scanned height {last_scan_height}")]
    UnexpectedHeight {
        /// Height of the rejected block
        height: BlockHeight,
        /// Height the wallet has fully applied
        last_scan_height: BlockHeight,
    },
    /// The engine is not running
    #[error("Wallet is not running")]
    NotRunning,
    /// The daemon did not confirm deregistration in time
    #[error("Daemon did not confirm deregistration within {0:?}")]
    DeregisterTimeout(Duration),
    /// The daemon dropped the deregistration signal without confirming
    #[error("Daemon dropped the deregistration signal")]
    DeregisterAborted,
}

/// Errors sampling decoys
#[derive(Debug, thiserror::Error)]
pub enum DecoyError {
    /// The output universe cannot supply the requested decoys after exclusions
    #[error(
        "No decoys available. Requested {requested} with {excluded} excluded from {universe} outputs"
    )]
    NoDecoysAvailable {
        /// Number of decoys asked for
        requested: usize,
        /// Number of excluded indices inside the universe
        excluded: usize,
        /// Number of selectable global output indices
        universe: u64,
    },
}

/// Errors building an outgoing transaction. Every variant is recoverable by the caller.
#[derive(Debug, thiserror::Error)]
pub enum ConstructionError {
    /// Unlocked unspent outputs do not cover the destinations and fee
    #[error("Insufficient funds. Available {available}, required {required}")]
    InsufficientFunds {
        /// Sum of the unlocked unspent outputs
        available: u64,
        /// Destinations plus the smallest fee
        required: u64,
    },
    /// Not enough decoys to fill a ring
    #[error("{0}")]
    NoDecoysAvailable(#[from] DecoyError),
    /// The fee kept outgrowing the selected inputs
    #[error("Fee estimation failed after {attempts} attempts")]
    FeeEstimationFailed {
        /// Finalise attempts made
        attempts: usize,
    },
    /// The destination list is unusable
    #[error("Invalid destinations. {0}")]
    InvalidDestinations(String),
    /// Errors associated with the storage backend
    #[error("Storage error. {0}")]
    Storage(#[from] StorageError),
    /// Errors associated with the daemon
    #[error("Daemon error. {0}")]
    Daemon(#[from] DaemonError),
}
