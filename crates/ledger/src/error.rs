//! Error types for the ledger crate

use thiserror::Error;

/// Errors surfaced by [`crate::Ledger`] operations
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("block store error: {0}")]
    Store(#[from] StoreError),

    #[error("timed out waiting for {bucket}/{key} to be committed")]
    Timeout { bucket: String, key: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("data error: {0}")]
    Data(#[from] DataError),
}

/// Errors from a [`crate::BlockStore`] implementation
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("out of order append: expected index {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("corrupt store: {0}")]
    Corrupt(String),
}

/// Why a block does not extend the chain it was offered to
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("non-contiguous block: expected index {expected}, got {got}")]
    NonContiguous { expected: u64, got: u64 },

    #[error("previous hash mismatch at index {index}")]
    PrevHashMismatch { index: u64 },

    #[error("checksum mismatch at index {index}")]
    ChecksumMismatch { index: u64 },
}

/// Errors converting between typed values and [`crate::Data`]
#[derive(Error, Debug)]
pub enum DataError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
