//! Rows persisted by the indexer, keyed by block index.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bloom::Bloom;

// ─── Outpoint ────────────────────────────────────────────────────────────────

/// Reference to a transaction output: transaction id + output position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Outpoint {
    pub transaction_id: String,
    pub output_index: u32,
}

impl Outpoint {
    pub fn new(transaction_id: impl Into<String>, output_index: u32) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            output_index,
        }
    }
}

/// Canonical key form, `"<txid>-<index>"`.
impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.transaction_id, self.output_index)
    }
}

// ─── Block ───────────────────────────────────────────────────────────────────

/// Extension fields carried by blocks of smart-contract chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractBlockFields {
    pub hash_state_root: String,
    pub receipt_root: String,
    pub bloom: Bloom,
}

/// One indexed block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Chain height; unique.
    pub block_index: u64,
    pub block_hash: String,
    pub previous_block_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub block_time: i64,
    pub transaction_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<ContractBlockFields>,
}

// ─── Outputs / inputs ────────────────────────────────────────────────────────

/// A transaction output, recorded at the block that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub outpoint: Outpoint,
    pub address: String,
    pub value: i64,
    pub block_index: u64,
    #[serde(default)]
    pub coinbase: bool,
}

/// A transaction input, recorded at the block that spent the output.
///
/// `address` and `value` are copied from the spent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    pub outpoint: Outpoint,
    pub transaction_id: String,
    pub address: String,
    pub value: i64,
    pub block_index: u64,
}

/// A spendable output. `block_index` is where the output was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub outpoint: Outpoint,
    pub address: String,
    pub value: i64,
    pub block_index: u64,
}

/// An input joined with the output it spends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpentOutput {
    pub input: InputRecord,
    pub output: OutputRecord,
}

impl SpentOutput {
    /// Project back to the UTXO row the spend removed: the input's value and
    /// address with the output's origin block index.
    pub fn to_unspent(&self) -> UnspentOutput {
        UnspentOutput {
            outpoint: self.input.outpoint.clone(),
            address: self.input.address.clone(),
            value: self.input.value,
            block_index: self.output.block_index,
        }
    }
}

// ─── Transactions and derived tables ─────────────────────────────────────────

/// Maps a transaction id to the block containing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBlock {
    pub transaction_id: String,
    pub block_index: u64,
    pub transaction_index: u32,
}

/// Running totals for an address, tagged with the block that last computed them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressComputed {
    pub address: String,
    pub available: i64,
    pub received: i64,
    pub sent: i64,
    pub count_received: u64,
    pub count_sent: u64,
    pub computed_block_index: u64,
}

/// One history entry for an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressHistoryComputed {
    pub address: String,
    pub transaction_id: String,
    pub entry_type: HistoryEntryType,
    pub amount_in_inputs: i64,
    pub amount_in_outputs: i64,
    pub block_index: u64,
    pub position: u32,
}

/// Direction of an address history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEntryType {
    Receive,
    Send,
    Mine,
    Stake,
}

// ─── Archive ─────────────────────────────────────────────────────────────────

/// Snapshot of a rewound block, written once before any deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgBlock {
    pub created: DateTime<Utc>,
    pub block_index: u64,
    pub block_hash: String,
    pub block: BlockRecord,
    pub inputs: Vec<InputRecord>,
    pub outputs: Vec<OutputRecord>,
    pub transaction_ids: Vec<TransactionBlock>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outpoint_key_form() {
        let p = Outpoint::new("ab12", 3);
        assert_eq!(p.to_string(), "ab12-3");
    }

    #[test]
    fn spent_output_keeps_origin_index() {
        let spent = SpentOutput {
            input: InputRecord {
                outpoint: Outpoint::new("p2", 0),
                transaction_id: "spender".into(),
                address: "B".into(),
                value: 3,
                block_index: 10,
            },
            output: OutputRecord {
                outpoint: Outpoint::new("p2", 0),
                address: "B".into(),
                value: 3,
                block_index: 7,
                coinbase: false,
            },
        };
        let utxo = spent.to_unspent();
        assert_eq!(utxo.block_index, 7);
        assert_eq!(utxo.value, 3);
        assert_eq!(utxo.address, "B");
        assert_eq!(utxo.outpoint, Outpoint::new("p2", 0));
    }

    #[test]
    fn block_without_contract_fields_serializes_compactly() {
        let block = BlockRecord {
            block_index: 1,
            block_hash: "0x01".into(),
            previous_block_hash: "0x00".into(),
            block_time: 0,
            transaction_count: 1,
            contract: None,
        };
        let json = serde_json::to_value(&block).unwrap();
        assert!(json.get("contract").is_none());
        let back: BlockRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn contract_block_carries_bloom() {
        let mut bloom = Bloom::new();
        bloom.add(b"log-address");
        let block = BlockRecord {
            block_index: 2,
            block_hash: "0x02".into(),
            previous_block_hash: "0x01".into(),
            block_time: 16,
            transaction_count: 2,
            contract: Some(ContractBlockFields {
                hash_state_root: "0xstate".into(),
                receipt_root: "0xreceipts".into(),
                bloom: bloom.clone(),
            }),
        };
        let back: BlockRecord = serde_json::from_str(&serde_json::to_string(&block).unwrap()).unwrap();
        assert_eq!(back.contract.unwrap().bloom, bloom);
    }
}
