//! SQLite storage backend for BlockIndex.
//!
//! Each collection is a table of JSON documents next to the columns the
//! rewind filters on (`block_index`, `computed_block_index`, `outpoint`) and a
//! `unique_key` column carrying the collection's uniqueness constraint.
//! Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use blockindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./index.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::marker::PhantomData;

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use blockindex_core::error::IndexerError;
use blockindex_core::store::{Collection, Filter, IndexStore, Record};
use blockindex_core::types::{
    AddressComputed, AddressHistoryComputed, BlockRecord, InputRecord, Outpoint, OutputRecord,
    ReorgBlock, SpentOutput, TransactionBlock, UnspentOutput,
};

fn storage_err(e: impl std::fmt::Display) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

// ─── Collection ──────────────────────────────────────────────────────────────

/// One document table.
pub struct SqliteCollection<T> {
    pool: SqlitePool,
    _rows: PhantomData<fn() -> T>,
}

impl<T: Record> SqliteCollection<T> {
    fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            _rows: PhantomData,
        }
    }

    async fn init_schema(&self) -> Result<(), IndexerError> {
        let table = T::COLLECTION;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                block_index          INTEGER NOT NULL,
                computed_block_index INTEGER,
                outpoint             TEXT,
                unique_key           TEXT UNIQUE,
                doc                  TEXT    NOT NULL
            );"
        ))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_block ON \"{table}\" (block_index);"
        ))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_outpoint ON \"{table}\" (outpoint);"
        ))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    fn insert_error(err: sqlx::Error, row: &T) -> IndexerError {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => IndexerError::DuplicateKey {
                collection: T::COLLECTION.to_string(),
                key: row.unique_key().unwrap_or_default(),
            },
            _ => storage_err(err),
        }
    }
}

/// Outpoints bound per statement; keeps well under SQLite's host parameter limit.
const OUTPOINT_CHUNK: usize = 500;

/// Split a filter into statements that each bind at most [`OUTPOINT_CHUNK`]
/// outpoints. Repeated outpoints are bound once.
fn split_filter(filter: &Filter) -> Vec<Filter> {
    match filter {
        Filter::Outpoints(keys) if keys.len() > 1 => {
            let unique: BTreeSet<&Outpoint> = keys.iter().collect();
            unique
                .into_iter()
                .cloned()
                .collect::<Vec<_>>()
                .chunks(OUTPOINT_CHUNK)
                .map(|chunk| Filter::Outpoints(chunk.to_vec()))
                .collect()
        }
        _ => vec![filter.clone()],
    }
}

fn where_clause(filter: &Filter) -> String {
    match filter {
        Filter::BlockIndex(_) => "block_index = ?".into(),
        Filter::ComputedBlockIndex(_) => "computed_block_index = ?".into(),
        Filter::Outpoints(keys) if keys.is_empty() => "0".into(),
        Filter::Outpoints(keys) => {
            format!("outpoint IN ({})", vec!["?"; keys.len()].join(", "))
        }
    }
}

fn bind_filter<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    filter: &Filter,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match filter {
        Filter::BlockIndex(n) | Filter::ComputedBlockIndex(n) => query.bind(*n as i64),
        Filter::Outpoints(keys) => keys.iter().fold(query, |q, p| q.bind(p.to_string())),
    }
}

fn decode<T: Record>(doc: &str) -> Result<T, IndexerError> {
    serde_json::from_str(doc)
        .map_err(|e| IndexerError::Storage(format!("corrupt {} document: {e}", T::COLLECTION)))
}

#[async_trait]
impl<T: Record> Collection<T> for SqliteCollection<T> {
    async fn find(&self, filter: &Filter) -> Result<Vec<T>, IndexerError> {
        let mut found = Vec::new();
        for part in split_filter(filter) {
            let sql = format!(
                "SELECT doc FROM \"{}\" WHERE {} ORDER BY id",
                T::COLLECTION,
                where_clause(&part)
            );
            let rows = bind_filter(sqlx::query(&sql), &part)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?;

            for row in &rows {
                found.push(decode(&row.get::<String, _>("doc"))?);
            }
        }
        Ok(found)
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64, IndexerError> {
        let parts = split_filter(filter);
        let statements = parts.len();

        // All chunks commit together.
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut deleted = 0;
        for part in parts {
            let sql = format!(
                "DELETE FROM \"{}\" WHERE {}",
                T::COLLECTION,
                where_clause(&part)
            );
            deleted += bind_filter(sqlx::query(&sql), &part)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?
                .rows_affected();
        }
        tx.commit().await.map_err(storage_err)?;

        debug!(collection = T::COLLECTION, statements, deleted, "delete_many");
        Ok(deleted)
    }

    async fn insert_one(&self, row: T) -> Result<(), IndexerError> {
        self.insert_many(vec![row]).await
    }

    async fn insert_many(&self, rows: Vec<T>) -> Result<(), IndexerError> {
        let sql = format!(
            "INSERT INTO \"{}\" (block_index, computed_block_index, outpoint, unique_key, doc)
             VALUES (?, ?, ?, ?, ?)",
            T::COLLECTION
        );

        // One transaction per batch; dropping it on error rolls the batch back.
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for row in &rows {
            let doc = serde_json::to_string(row).map_err(storage_err)?;
            sqlx::query(&sql)
                .bind(row.block_index() as i64)
                .bind(row.computed_block_index().map(|n| n as i64))
                .bind(row.outpoint().map(|p| p.to_string()))
                .bind(row.unique_key())
                .bind(doc)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::insert_error(e, row))?;
        }
        tx.commit().await.map_err(storage_err)?;

        debug!(collection = T::COLLECTION, rows = rows.len(), "insert_many");
        Ok(())
    }
}

// ─── Storage ─────────────────────────────────────────────────────────────────

/// SQLite-backed document store for every indexer collection.
pub struct SqliteStorage {
    pool: SqlitePool,
    blocks: SqliteCollection<BlockRecord>,
    inputs: SqliteCollection<InputRecord>,
    outputs: SqliteCollection<OutputRecord>,
    transaction_blocks: SqliteCollection<TransactionBlock>,
    address_computed: SqliteCollection<AddressComputed>,
    address_history_computed: SqliteCollection<AddressHistoryComputed>,
    unspent_outputs: SqliteCollection<UnspentOutput>,
    reorg_blocks: SqliteCollection<ReorgBlock>,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full
    /// SQLite URL (`"sqlite:./index.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        Self::with_pool(pool).await
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every pooled connection to `sqlite::memory:` is its own database, so the
    /// pool is pinned to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, IndexerError> {
        let storage = Self {
            blocks: SqliteCollection::new(pool.clone()),
            inputs: SqliteCollection::new(pool.clone()),
            outputs: SqliteCollection::new(pool.clone()),
            transaction_blocks: SqliteCollection::new(pool.clone()),
            address_computed: SqliteCollection::new(pool.clone()),
            address_history_computed: SqliteCollection::new(pool.clone()),
            unspent_outputs: SqliteCollection::new(pool.clone()),
            reorg_blocks: SqliteCollection::new(pool.clone()),
            pool,
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        // WAL mode — better concurrent read throughput
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        self.blocks.init_schema().await?;
        self.inputs.init_schema().await?;
        self.outputs.init_schema().await?;
        self.transaction_blocks.init_schema().await?;
        self.address_computed.init_schema().await?;
        self.address_history_computed.init_schema().await?;
        self.unspent_outputs.init_schema().await?;
        self.reorg_blocks.init_schema().await?;
        Ok(())
    }

    /// Number of rows in collection `T`.
    pub async fn count<T: Record>(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS cnt FROM \"{}\"",
            T::COLLECTION
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

#[async_trait]
impl IndexStore for SqliteStorage {
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
        let sql = format!(
            "SELECT i.doc AS input_doc, o.doc AS output_doc
             FROM \"{input}\" i
             JOIN \"{output}\" o ON o.outpoint = i.outpoint
             WHERE i.block_index = ?
             ORDER BY i.id, o.id",
            input = InputRecord::COLLECTION,
            output = OutputRecord::COLLECTION,
        );
        let rows = sqlx::query(&sql)
            .bind(block_index as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        rows.iter()
            .map(|row| -> Result<SpentOutput, IndexerError> {
                Ok(SpentOutput {
                    input: decode(&row.get::<String, _>("input_doc"))?,
                    output: decode(&row.get::<String, _>("output_doc"))?,
                })
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
