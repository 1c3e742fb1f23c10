#![warn(missing_docs)]
//! Wallet3 sync engine
//!
//! Ingests blocks pushed by the daemon, detects owned outputs and their spends, and builds
//! outgoing transactions ready for signing.
//!
//! Entrypoint: [`crate::sync::Wallet`]

pub mod construct;
pub mod decoys;
pub mod error;
pub mod interface;
pub mod keys;
#[allow(missing_docs)]
pub mod primitives;
pub mod scan;
pub mod storage;
pub mod sync;

#[cfg(any(test, feature = "test-features"))]
pub mod mocks;
