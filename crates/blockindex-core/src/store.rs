//! Storage interface consumed by the rewind operation.
//!
//! Every table is a typed [`Collection`] of [`Record`] rows supporting
//! filtered find, filtered delete, and inserts. [`IndexStore`] groups the
//! collections and adds the one aggregation the rewind needs: inputs of a
//! block joined with the outputs they spend.
//!
//! Implementations include [`MemoryCollection`] (here), `InMemoryStorage`,
//! and `SqliteStorage` (in `blockindex-storage`).

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::IndexerError;
use crate::types::{
    AddressComputed, AddressHistoryComputed, BlockRecord, InputRecord, Outpoint, OutputRecord,
    ReorgBlock, SpentOutput, TransactionBlock, UnspentOutput,
};

// ─── Record ──────────────────────────────────────────────────────────────────

/// A row stored in a named collection.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Collection (table) name.
    const COLLECTION: &'static str;

    /// Block index the row is scoped to.
    fn block_index(&self) -> u64;

    /// Index of the block that computed a derived row, if the row has one.
    fn computed_block_index(&self) -> Option<u64> {
        None
    }

    fn outpoint(&self) -> Option<&Outpoint> {
        None
    }

    /// Key the store must keep unique within the collection.
    fn unique_key(&self) -> Option<String> {
        None
    }
}

impl Record for BlockRecord {
    const COLLECTION: &'static str = "block";

    fn block_index(&self) -> u64 {
        self.block_index
    }

    fn unique_key(&self) -> Option<String> {
        Some(self.block_index.to_string())
    }
}

impl Record for InputRecord {
    const COLLECTION: &'static str = "input";

    fn block_index(&self) -> u64 {
        self.block_index
    }

    fn outpoint(&self) -> Option<&Outpoint> {
        Some(&self.outpoint)
    }
}

impl Record for OutputRecord {
    const COLLECTION: &'static str = "output";

    fn block_index(&self) -> u64 {
        self.block_index
    }

    fn outpoint(&self) -> Option<&Outpoint> {
        Some(&self.outpoint)
    }

    fn unique_key(&self) -> Option<String> {
        Some(self.outpoint.to_string())
    }
}

impl Record for UnspentOutput {
    const COLLECTION: &'static str = "unspent_output";

    fn block_index(&self) -> u64 {
        self.block_index
    }

    fn outpoint(&self) -> Option<&Outpoint> {
        Some(&self.outpoint)
    }

    fn unique_key(&self) -> Option<String> {
        Some(self.outpoint.to_string())
    }
}

impl Record for TransactionBlock {
    const COLLECTION: &'static str = "transaction_block";

    fn block_index(&self) -> u64 {
        self.block_index
    }
}

impl Record for AddressComputed {
    const COLLECTION: &'static str = "address_computed";

    fn block_index(&self) -> u64 {
        self.computed_block_index
    }

    fn computed_block_index(&self) -> Option<u64> {
        Some(self.computed_block_index)
    }

    fn unique_key(&self) -> Option<String> {
        Some(self.address.clone())
    }
}

impl Record for AddressHistoryComputed {
    const COLLECTION: &'static str = "address_history_computed";

    fn block_index(&self) -> u64 {
        self.block_index
    }
}

impl Record for ReorgBlock {
    const COLLECTION: &'static str = "reorg_block";

    fn block_index(&self) -> u64 {
        self.block_index
    }
}

// ─── Filter ──────────────────────────────────────────────────────────────────

/// Equality predicate for find / delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `block_index == n`
    BlockIndex(u64),
    /// `computed_block_index == n`; rows without one never match.
    ComputedBlockIndex(u64),
    /// Outpoint is one of the listed values; rows without one never match.
    Outpoints(Vec<Outpoint>),
}

impl Filter {
    /// Returns `true` if `row` satisfies the predicate.
    pub fn matches<T: Record>(&self, row: &T) -> bool {
        self.matcher().matches(row)
    }

    /// Prepare the filter for testing many rows; outpoint lists are hashed once.
    pub fn matcher(&self) -> FilterMatcher<'_> {
        let outpoints = match self {
            Self::Outpoints(keys) => keys.iter().collect(),
            _ => HashSet::new(),
        };
        FilterMatcher {
            filter: self,
            outpoints,
        }
    }
}

/// A [`Filter`] ready to be applied to a whole collection.
pub struct FilterMatcher<'a> {
    filter: &'a Filter,
    outpoints: HashSet<&'a Outpoint>,
}

impl FilterMatcher<'_> {
    pub fn matches<T: Record>(&self, row: &T) -> bool {
        match self.filter {
            Filter::BlockIndex(n) => row.block_index() == *n,
            Filter::ComputedBlockIndex(n) => row.computed_block_index() == Some(*n),
            Filter::Outpoints(_) => row.outpoint().is_some_and(|p| self.outpoints.contains(p)),
        }
    }
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// One typed collection of the document store.
#[async_trait]
pub trait Collection<T: Record>: Send + Sync {
    /// All rows matching `filter`.
    async fn find(&self, filter: &Filter) -> Result<Vec<T>, IndexerError>;

    /// Delete all rows matching `filter`; returns how many were removed.
    /// Deleting nothing is not an error.
    async fn delete_many(&self, filter: &Filter) -> Result<u64, IndexerError>;

    async fn insert_one(&self, row: T) -> Result<(), IndexerError>;

    /// Insert `rows` as one batch. A unique-key violation rejects the batch
    /// with [`IndexerError::DuplicateKey`].
    async fn insert_many(&self, rows: Vec<T>) -> Result<(), IndexerError>;
}

/// The indexer's document store.
#[async_trait]
pub trait IndexStore: Send + Sync {
    fn blocks(&self) -> &dyn Collection<BlockRecord>;
    fn inputs(&self) -> &dyn Collection<InputRecord>;
    fn outputs(&self) -> &dyn Collection<OutputRecord>;
    fn transaction_blocks(&self) -> &dyn Collection<TransactionBlock>;
    fn address_computed(&self) -> &dyn Collection<AddressComputed>;
    fn address_history_computed(&self) -> &dyn Collection<AddressHistoryComputed>;
    fn unspent_outputs(&self) -> &dyn Collection<UnspentOutput>;
    fn reorg_blocks(&self) -> &dyn Collection<ReorgBlock>;

    /// Inputs recorded at `block_index`, each joined with the output it spends
    /// (match on block index, left-outer join on outpoint, unwind). Inputs
    /// whose output is not in the output collection are dropped; an input
    /// matching several outputs yields one entry per match.
    async fn lookup_spent_outputs(
        &self,
        block_index: u64,
    ) -> Result<Vec<SpentOutput>, IndexerError>;
}

// ─── In-memory collection ────────────────────────────────────────────────────

/// In-memory collection for tests and ephemeral indexers.
pub struct MemoryCollection<T> {
    rows: Mutex<Vec<T>>,
}

impl<T: Record> MemoryCollection<T> {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
        }
    }

    /// Copy of every row, in insertion order.
    pub fn all(&self) -> Result<Vec<T>, IndexerError> {
        Ok(self.lock()?.clone())
    }

    pub fn len(&self) -> Result<usize, IndexerError> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, IndexerError> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<T>>, IndexerError> {
        self.rows
            .lock()
            .map_err(|_| IndexerError::Storage(format!("{} lock poisoned", T::COLLECTION)))
    }
}

impl<T: Record> Default for MemoryCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Record> Collection<T> for MemoryCollection<T> {
    async fn find(&self, filter: &Filter) -> Result<Vec<T>, IndexerError> {
        let matcher = filter.matcher();
        let rows = self.lock()?;
        Ok(rows.iter().filter(|r| matcher.matches(*r)).cloned().collect())
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64, IndexerError> {
        let matcher = filter.matcher();
        let mut rows = self.lock()?;
        let before = rows.len();
        rows.retain(|r| !matcher.matches(r));
        Ok((before - rows.len()) as u64)
    }

    async fn insert_one(&self, row: T) -> Result<(), IndexerError> {
        self.insert_many(vec![row]).await
    }

    async fn insert_many(&self, new_rows: Vec<T>) -> Result<(), IndexerError> {
        let mut rows = self.lock()?;
        let mut keys: HashSet<String> = rows.iter().filter_map(|r| r.unique_key()).collect();
        for row in &new_rows {
            if let Some(key) = row.unique_key() {
                if !keys.insert(key.clone()) {
                    return Err(IndexerError::DuplicateKey {
                        collection: T::COLLECTION.to_string(),
                        key,
                    });
                }
            }
        }
        rows.extend(new_rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(tx: &str, block: u64) -> UnspentOutput {
        UnspentOutput {
            outpoint: Outpoint::new(tx, 0),
            address: "A".into(),
            value: 1,
            block_index: block,
        }
    }

    fn computed(address: &str, block: u64) -> AddressComputed {
        AddressComputed {
            address: address.into(),
            available: 0,
            received: 0,
            sent: 0,
            count_received: 0,
            count_sent: 0,
            computed_block_index: block,
        }
    }

    #[test]
    fn filter_matching() {
        let row = utxo("aa", 7);
        assert!(Filter::BlockIndex(7).matches(&row));
        assert!(!Filter::BlockIndex(8).matches(&row));
        assert!(!Filter::ComputedBlockIndex(7).matches(&row));
        assert!(Filter::Outpoints(vec![Outpoint::new("aa", 0)]).matches(&row));
        assert!(!Filter::Outpoints(vec![Outpoint::new("aa", 1)]).matches(&row));

        assert!(Filter::ComputedBlockIndex(4).matches(&computed("X", 4)));
    }

    #[tokio::test]
    async fn find_and_delete_scoped_rows() {
        let col: MemoryCollection<UnspentOutput> = MemoryCollection::new();
        col.insert_many(vec![utxo("a", 1), utxo("b", 2), utxo("c", 2)]).await.unwrap();

        assert_eq!(col.find(&Filter::BlockIndex(2)).await.unwrap().len(), 2);
        assert_eq!(col.delete_many(&Filter::BlockIndex(2)).await.unwrap(), 2);
        assert_eq!(col.delete_many(&Filter::BlockIndex(2)).await.unwrap(), 0);
        assert_eq!(col.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn unique_key_rejects_whole_batch() {
        let col: MemoryCollection<UnspentOutput> = MemoryCollection::new();
        col.insert_one(utxo("a", 1)).await.unwrap();

        let err = col
            .insert_many(vec![utxo("b", 1), utxo("a", 5)])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::DuplicateKey { ref key, .. } if key == "a-0"));
        assert_eq!(col.len().unwrap(), 1);

        let err = col
            .insert_many(vec![utxo("c", 1), utxo("c", 1)])
            .await
            .unwrap_err();
        assert!(err.is_storage());
        assert_eq!(col.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn rows_without_unique_key_may_repeat() {
        let col: MemoryCollection<TransactionBlock> = MemoryCollection::new();
        let tx = TransactionBlock {
            transaction_id: "t".into(),
            block_index: 3,
            transaction_index: 0,
        };
        col.insert_many(vec![tx.clone(), tx]).await.unwrap();
        assert_eq!(col.all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn outpoint_filter_over_large_key_list() {
        let col: MemoryCollection<UnspentOutput> = MemoryCollection::new();
        let rows: Vec<_> = (0..2_000).map(|i| utxo(&format!("tx{i}"), 1)).collect();
        col.insert_many(rows).await.unwrap();

        // every other row, one key listed twice, one key absent
        let mut keys: Vec<Outpoint> = (0..2_000)
            .step_by(2)
            .map(|i| Outpoint::new(format!("tx{i}"), 0))
            .collect();
        keys.push(Outpoint::new("tx0", 0));
        keys.push(Outpoint::new("missing", 0));
        let filter = Filter::Outpoints(keys);

        assert_eq!(col.find(&filter).await.unwrap().len(), 1_000);
        assert_eq!(col.delete_many(&filter).await.unwrap(), 1_000);
        assert_eq!(col.len().unwrap(), 1_000);
        assert!(col.find(&filter).await.unwrap().is_empty());
    }
}
