//! Rewind configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a [`BlockRewindOperation`](crate::rewind::BlockRewindOperation).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewindConfig {
    /// Chain slug attached to log records (e.g. `"cirrus"`).
    pub chain: String,
    /// Drop spends of outputs created in the block being rewound before the
    /// UTXO set is rebuilt. When off, those rows are inserted and then removed
    /// again by the second deletion pass.
    pub filter_same_block_spends: bool,
    /// Let `delete_block` remove the Block row after the rewind completes.
    pub remove_block_row: bool,
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            chain: "bitcoin".into(),
            filter_same_block_spends: true,
            remove_block_row: true,
        }
    }
}
