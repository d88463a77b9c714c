//! blockindex-core — consistency-recovery core of the block indexer.
//!
//! # Architecture
//!
//! ```text
//! BlockRewindOperation
//!     ├── archive        (ReorgBlock snapshot, before any delete)
//!     ├── delete pass 1  (outputs, tx mappings, computed rows, utxos)
//!     ├── restore        (inputs ⋈ outputs → utxos, origin block index)
//!     └── delete pass 2  (inputs, utxos)
//!            │
//!            ▼
//!     IndexStore (memory / SQLite)
//!
//! Bloom — 2048-bit block filter (M3:2048 over Keccak-256)
//! ```

pub mod bloom;
pub mod config;
pub mod error;
pub mod rewind;
pub mod store;
pub mod types;

pub use bloom::{Bloom, BLOOM_BITS, BLOOM_LENGTH};
pub use config::RewindConfig;
pub use error::IndexerError;
pub use rewind::{BlockRewindOperation, DeleteCounts, RewindReport};
pub use store::{Collection, Filter, FilterMatcher, IndexStore, MemoryCollection, Record};
pub use types::{
    AddressComputed, AddressHistoryComputed, BlockRecord, ContractBlockFields, HistoryEntryType,
    InputRecord, Outpoint, OutputRecord, ReorgBlock, SpentOutput, TransactionBlock, UnspentOutput,
};
