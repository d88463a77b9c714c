//! In-memory storage backend.
//!
//! Holds every indexer collection in RAM. Useful for tests and short-lived
//! indexers that don't need persistence. Unique keys (block index, output and
//! UTXO outpoints, computed address) are enforced like a real store would.

use async_trait::async_trait;

use blockindex_core::error::IndexerError;
use blockindex_core::store::{Collection, Filter, IndexStore, MemoryCollection, Record};
use blockindex_core::types::{
    AddressComputed, AddressHistoryComputed, BlockRecord, InputRecord, OutputRecord, ReorgBlock,
    SpentOutput, TransactionBlock, UnspentOutput,
};

/// In-memory indexer storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    blocks: MemoryCollection<BlockRecord>,
    inputs: MemoryCollection<InputRecord>,
    outputs: MemoryCollection<OutputRecord>,
    transaction_blocks: MemoryCollection<TransactionBlock>,
    address_computed: MemoryCollection<AddressComputed>,
    address_history_computed: MemoryCollection<AddressHistoryComputed>,
    unspent_outputs: MemoryCollection<UnspentOutput>,
    reorg_blocks: MemoryCollection<ReorgBlock>,
}

/// Every collection except the archive, each sorted into a stable order.
///
/// Two snapshots compare equal when the stores hold the same rows,
/// regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSnapshot {
    pub blocks: Vec<BlockRecord>,
    pub inputs: Vec<InputRecord>,
    pub outputs: Vec<OutputRecord>,
    pub transaction_blocks: Vec<TransactionBlock>,
    pub address_computed: Vec<AddressComputed>,
    pub address_history_computed: Vec<AddressHistoryComputed>,
    pub unspent_outputs: Vec<UnspentOutput>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current content of all primary and derived collections.
    pub fn snapshot(&self) -> Result<TableSnapshot, IndexerError> {
        Ok(TableSnapshot {
            blocks: sorted(&self.blocks)?,
            inputs: sorted(&self.inputs)?,
            outputs: sorted(&self.outputs)?,
            transaction_blocks: sorted(&self.transaction_blocks)?,
            address_computed: sorted(&self.address_computed)?,
            address_history_computed: sorted(&self.address_history_computed)?,
            unspent_outputs: sorted(&self.unspent_outputs)?,
        })
    }

    /// All archived blocks, oldest first.
    pub fn archived(&self) -> Result<Vec<ReorgBlock>, IndexerError> {
        self.reorg_blocks.all()
    }
}

fn sorted<T: Record>(col: &MemoryCollection<T>) -> Result<Vec<T>, IndexerError> {
    let mut keyed = col
        .all()?
        .into_iter()
        .map(|row| serde_json::to_string(&row).map(|key| (key, row)))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| IndexerError::Storage(e.to_string()))?;
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(keyed.into_iter().map(|(_, row)| row).collect())
}

#[async_trait]
impl IndexStore for InMemoryStorage {
    fn blocks(&self) -> &dyn Collection<BlockRecord> {
        &self.blocks
    }

    fn inputs(&self) -> &dyn Collection<InputRecord> {
        &self.inputs
    }

    fn outputs(&self) -> &dyn Collection<OutputRecord> {
        &self.outputs
    }

    fn transaction_blocks(&self) -> &dyn Collection<TransactionBlock> {
        &self.transaction_blocks
    }

    fn address_computed(&self) -> &dyn Collection<AddressComputed> {
        &self.address_computed
    }

    fn address_history_computed(&self) -> &dyn Collection<AddressHistoryComputed> {
        &self.address_history_computed
    }

    fn unspent_outputs(&self) -> &dyn Collection<UnspentOutput> {
        &self.unspent_outputs
    }

    fn reorg_blocks(&self) -> &dyn Collection<ReorgBlock> {
        &self.reorg_blocks
    }

    async fn lookup_spent_outputs(
        &self,
        block_index: u64,
    ) -> Result<Vec<SpentOutput>, IndexerError> {
        let inputs = self.inputs.find(&Filter::BlockIndex(block_index)).await?;
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let outpoints = inputs.iter().map(|i| i.outpoint.clone()).collect();
        let outputs = self.outputs.find(&Filter::Outpoints(outpoints)).await?;

        let mut spent = Vec::new();
        for input in inputs {
            for output in outputs.iter().filter(|o| o.outpoint == input.outpoint) {
                spent.push(SpentOutput {
                    input: input.clone(),
                    output: output.clone(),
                });
            }
        }
        Ok(spent)
    }
}
