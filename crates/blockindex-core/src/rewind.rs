//! Block rewind — undoes everything indexing one block wrote.
//!
//! A rewind runs four phases against the [`IndexStore`]; a phase starts only
//! after every request of the previous one has completed, and requests within
//! a phase run concurrently:
//!
//! 1. **Archive** — snapshot the Block row, its inputs, outputs and
//!    transaction ids into a [`ReorgBlock`]. Nothing is deleted before this
//!    insert succeeds.
//! 2. **Delete pass 1** — outputs, transaction mappings, computed address
//!    rows, address history and UTXO rows scoped to the block.
//! 3. **Restore** — inputs of the block joined with the outputs they spent
//!    become UTXO rows again, keeping the output's origin block index.
//! 4. **Delete pass 2** — inputs and, again, UTXO rows scoped to the block.
//!
//! Any failure aborts the remaining phases. Every delete is a no-op when
//! nothing matches, so a failed rewind is repaired by running it again.
//! Callers must not run forward indexing or another rewind for the same
//! block range at the same time.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::RewindConfig;
use crate::error::IndexerError;
use crate::store::{Filter, IndexStore};
use crate::types::{Outpoint, ReorgBlock, SpentOutput, UnspentOutput};

/// Rows removed from each collection by one rewind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteCounts {
    pub outputs: u64,
    pub transactions: u64,
    pub address_computed: u64,
    pub address_history: u64,
    /// Sum of both UTXO deletion passes.
    pub unspent_outputs: u64,
    pub inputs: u64,
}

/// Outcome of rewinding one block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewindReport {
    pub block_index: u64,
    pub block_hash: String,
    pub archived_inputs: usize,
    pub archived_outputs: usize,
    pub archived_transactions: usize,
    pub deleted: DeleteCounts,
    /// UTXO rows inserted by the restore phase.
    pub restored_utxos: usize,
    /// Set by [`BlockRewindOperation::delete_block`] once the Block row is gone.
    pub block_removed: bool,
}

/// Undoes the indexed effects of single blocks.
pub struct BlockRewindOperation {
    store: Arc<dyn IndexStore>,
    config: RewindConfig,
}

impl BlockRewindOperation {
    pub fn new(store: Arc<dyn IndexStore>, config: RewindConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RewindConfig {
        &self.config
    }

    /// Rewind the block at `block_index`.
    ///
    /// Fails with [`IndexerError::NotFound`] and touches nothing when no Block
    /// row exists at that index. The Block row itself is left in place; see
    /// [`delete_block`](Self::delete_block).
    pub async fn rewind_block(&self, block_index: u64) -> Result<RewindReport, IndexerError> {
        let mut report = self.archive(block_index).await?;
        let store = self.store.as_ref();

        let by_block = Filter::BlockIndex(block_index);
        let by_computed = Filter::ComputedBlockIndex(block_index);

        let (outputs, transactions, address_computed, address_history, unspent) = futures::try_join!(
            store.outputs().delete_many(&by_block),
            store.transaction_blocks().delete_many(&by_block),
            store.address_computed().delete_many(&by_computed),
            store.address_history_computed().delete_many(&by_block),
            // A batch that failed half way may have left rows for this block.
            store.unspent_outputs().delete_many(&by_block)
        )?;

        report.restored_utxos = self.restore_spent_outputs(block_index).await?;

        let (inputs, unspent_again) = futures::try_join!(
            store.inputs().delete_many(&by_block),
            store.unspent_outputs().delete_many(&by_block)
        )?;

        report.deleted = DeleteCounts {
            outputs,
            transactions,
            address_computed,
            address_history,
            unspent_outputs: unspent + unspent_again,
            inputs,
        };

        info!(
            chain = %self.config.chain,
            block_index,
            block_hash = %report.block_hash,
            outputs,
            inputs,
            restored = report.restored_utxos,
            "block rewound"
        );
        Ok(report)
    }

    /// Rewind the block and then remove its Block row.
    ///
    /// The Block row goes last, so an interrupted call can simply be repeated;
    /// once a call has completed, repeating it fails with `NotFound` without
    /// touching storage.
    pub async fn delete_block(&self, block_index: u64) -> Result<RewindReport, IndexerError> {
        let mut report = self.rewind_block(block_index).await?;
        if self.config.remove_block_row {
            let removed = self
                .store
                .blocks()
                .delete_many(&Filter::BlockIndex(block_index))
                .await?;
            report.block_removed = removed > 0;
        }
        Ok(report)
    }

    /// Delete blocks `tip` down to `fork_point + 1`, newest first.
    ///
    /// Stops at the first error; blocks already removed stay removed.
    pub async fn rewind_after(
        &self,
        fork_point: u64,
        tip: u64,
    ) -> Result<Vec<RewindReport>, IndexerError> {
        let mut reports = Vec::new();
        for block_index in (fork_point.saturating_add(1)..=tip).rev() {
            reports.push(self.delete_block(block_index).await?);
        }
        info!(
            chain = %self.config.chain,
            fork_point,
            tip,
            removed = reports.len(),
            "rewound to fork point"
        );
        Ok(reports)
    }

    /// Phase 1: write the [`ReorgBlock`] snapshot.
    async fn archive(&self, block_index: u64) -> Result<RewindReport, IndexerError> {
        let store = self.store.as_ref();
        let filter = Filter::BlockIndex(block_index);

        let (mut blocks, inputs, outputs, transaction_ids) = futures::try_join!(
            store.blocks().find(&filter),
            store.inputs().find(&filter),
            store.outputs().find(&filter),
            store.transaction_blocks().find(&filter)
        )?;

        let block = match blocks.len() {
            0 => return Err(IndexerError::NotFound { block_index }),
            1 => blocks.remove(0),
            n => {
                return Err(IndexerError::Storage(format!(
                    "{n} block rows at index {block_index}"
                )))
            }
        };

        let report = RewindReport {
            block_index,
            block_hash: block.block_hash.clone(),
            archived_inputs: inputs.len(),
            archived_outputs: outputs.len(),
            archived_transactions: transaction_ids.len(),
            ..Default::default()
        };

        store
            .reorg_blocks()
            .insert_one(ReorgBlock {
                created: Utc::now(),
                block_index,
                block_hash: block.block_hash.clone(),
                block,
                inputs,
                outputs,
                transaction_ids,
            })
            .await?;

        debug!(
            block_index,
            inputs = report.archived_inputs,
            outputs = report.archived_outputs,
            "block archived"
        );
        Ok(report)
    }

    /// Phase 3: bring back the UTXO rows spent by the block's inputs.
    async fn restore_spent_outputs(&self, block_index: u64) -> Result<usize, IndexerError> {
        let spent = self.store.lookup_spent_outputs(block_index).await?;
        let mut restored =
            unspent_from_spends(&spent, block_index, self.config.filter_same_block_spends);
        if restored.is_empty() {
            return Ok(0);
        }

        // Rows left by an earlier attempt that failed after this phase.
        let keys: Vec<Outpoint> = restored.values().map(|u| u.outpoint.clone()).collect();
        let existing = self
            .store
            .unspent_outputs()
            .find(&Filter::Outpoints(keys))
            .await?;
        for row in existing {
            debug!(outpoint = %row.outpoint, "utxo already restored");
            restored.remove(&row.outpoint.to_string());
        }
        if restored.is_empty() {
            return Ok(0);
        }

        let rows: Vec<UnspentOutput> = restored.into_values().collect();
        let count = rows.len();
        self.store.unspent_outputs().insert_many(rows).await?;
        Ok(count)
    }
}

/// Project joined spends to UTXO rows keyed by outpoint string.
///
/// Duplicate join results for one outpoint keep the first row. With
/// `skip_same_block` set, outputs created in `block_index` itself are left
/// out: they were created and spent inside the block being removed.
fn unspent_from_spends(
    spent: &[SpentOutput],
    block_index: u64,
    skip_same_block: bool,
) -> BTreeMap<String, UnspentOutput> {
    let mut rows = BTreeMap::new();
    for pair in spent {
        if skip_same_block && pair.output.block_index == block_index {
            debug!(outpoint = %pair.input.outpoint, block_index, "skipping same-block spend");
            continue;
        }
        let key = pair.input.outpoint.to_string();
        if rows.contains_key(&key) {
            warn!(outpoint = %key, block_index, "duplicate spend in join result");
            continue;
        }
        rows.insert(key, pair.to_unspent());
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InputRecord, OutputRecord};

    fn spend(tx: &str, origin: u64, spent_at: u64, value: i64) -> SpentOutput {
        let outpoint = Outpoint::new(tx, 0);
        SpentOutput {
            input: InputRecord {
                outpoint: outpoint.clone(),
                transaction_id: format!("spender-{tx}"),
                address: "B".into(),
                value,
                block_index: spent_at,
            },
            output: OutputRecord {
                outpoint,
                address: "B".into(),
                value,
                block_index: origin,
                coinbase: false,
            },
        }
    }

    #[test]
    fn projects_origin_block_index() {
        let rows = unspent_from_spends(&[spend("p2", 7, 10, 3)], 10, true);
        let utxo = &rows["p2-0"];
        assert_eq!(utxo.block_index, 7);
        assert_eq!(utxo.value, 3);
    }

    #[test]
    fn duplicate_join_results_keep_one_row() {
        let rows = unspent_from_spends(&[spend("p2", 7, 10, 3), spend("p2", 7, 10, 3)], 10, true);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn same_block_spends_are_filtered_when_enabled() {
        let spent = [spend("inner", 10, 10, 1), spend("outer", 4, 10, 2)];

        let filtered = unspent_from_spends(&spent, 10, true);
        assert_eq!(filtered.keys().collect::<Vec<_>>(), vec!["outer-0"]);

        let legacy = unspent_from_spends(&spent, 10, false);
        assert_eq!(legacy.len(), 2);
    }
}
