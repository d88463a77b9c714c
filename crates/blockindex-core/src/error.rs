//! Error types for the rewind core and the block filter.

use thiserror::Error;

/// Errors surfaced by the filter, the storage layer, and the rewind operation.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Block {block_index} not found")]
    NotFound { block_index: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Duplicate key in '{collection}': {key}")]
    DuplicateKey { collection: String, key: String },
}

impl IndexerError {
    /// Returns `true` if the rewind target had no Block row.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` for any failure reported by the store.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::DuplicateKey { .. })
    }
}
