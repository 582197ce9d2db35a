//! Chunked, per-table serialized batch persistence.

mod chunk;
mod memory;
mod postgres;
mod store;

use std::collections::HashMap;
use std::sync::Arc;

use gdi_core::{CellValue, ColumnSpec, RawRecord, TableSchema};
use gdi_schema::{clean_identifier, conform, diff_against, synthesize, NormalizedBatch, SchemaDiff, SynthesisOptions};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use chunk::{ChunkEvent, ChunkState, RetryPolicy, TransitionError};
pub use memory::{ConnectionFault, MemoryStore, RowRejector};
pub use postgres::{classify, quote_ident, PgStore, BBOX_GEOMETRY_COLUMN, POINT_GEOMETRY_COLUMN};
pub use store::{FailureKind, InsertOutcome, SpatialIndexing, StoreError, StoredRow, TableStore};

pub const CRATE_NAME: &str = "gdi-persist";

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("store unreachable: {0}")]
    StoreUnreachable(String),
    #[error("schema change for table {table} failed: {source}")]
    Schema {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl PersistError {
    /// Failures that end the whole run rather than one unit.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, PersistError::StoreUnreachable(_))
    }
}

#[derive(Debug, Clone)]
pub struct PersistConfig {
    pub chunk_size: usize,
    pub retry: RetryPolicy,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkRecord {
    pub index: usize,
    pub rows: usize,
    pub state: ChunkState,
}

#[derive(Debug, Clone, Serialize)]
pub struct InsertReport {
    pub table: String,
    pub rows_attempted: u64,
    pub rows_inserted: u64,
    pub rows_skipped: u64,
    pub rows_deduplicated: u64,
    pub chunks: Vec<ChunkRecord>,
    /// Why the remaining chunks were aborted, if they were.
    pub aborted: Option<String>,
}

impl InsertReport {
    fn new(table: &str, rows: usize) -> Self {
        Self {
            table: table.to_string(),
            rows_attempted: rows as u64,
            rows_inserted: 0,
            rows_skipped: 0,
            rows_deduplicated: 0,
            chunks: Vec::new(),
            aborted: None,
        }
    }

    pub fn chunks_committed(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| matches!(c.state, ChunkState::Committed { .. }))
            .count()
    }

    pub fn chunks_failed(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| matches!(c.state, ChunkState::Failed { .. }))
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.aborted.is_none() && self.chunks_failed() == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub diff: SchemaDiff,
    pub dropped_columns: Vec<String>,
    pub insert: InsertReport,
}

/// One async mutex per table name, created on first use.
#[derive(Default)]
pub struct TableLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TableLocks {
    pub async fn acquire(&self, table: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(table.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

pub struct PersistenceEngine {
    store: Arc<dyn TableStore>,
    config: PersistConfig,
    locks: TableLocks,
}

impl PersistenceEngine {
    pub fn new(store: Arc<dyn TableStore>, config: PersistConfig) -> Self {
        Self {
            store,
            config,
            locks: TableLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    /// Create or additively evolve the table so it can hold rows shaped like `schema`.
    pub async fn ensure_table(&self, schema: &TableSchema) -> Result<SchemaDiff, PersistError> {
        let _guard = self.locks.acquire(&schema.name).await;
        self.ensure_locked(schema).await
    }

    pub async fn insert_batch(
        &self,
        batch: &NormalizedBatch,
        chunk_size: usize,
    ) -> Result<InsertReport, PersistError> {
        let _guard = self.locks.acquire(&batch.schema.name).await;
        self.insert_locked(batch, chunk_size).await
    }

    /// Synthesize, evolve and insert `records` while holding the table lock throughout.
    pub async fn ingest(
        &self,
        table: &str,
        records: &[RawRecord],
        options: &SynthesisOptions,
    ) -> Result<IngestReport, PersistError> {
        let name = clean_identifier(table);
        let _guard = self.locks.acquire(&name).await;

        let batch = synthesize(&name, records, options);
        if !batch.dropped_columns.is_empty() {
            debug!(table = %name, dropped = ?batch.dropped_columns, "dropped all-empty columns");
        }
        let diff = self.ensure_locked(&batch.schema).await?;
        let dropped_columns = batch.dropped_columns.clone();
        let batch = conform(batch, &diff.resulting);
        let insert = self.insert_locked(&batch, self.config.chunk_size).await?;
        Ok(IngestReport {
            diff,
            dropped_columns,
            insert,
        })
    }

    /// Atomically replace every row matching `filter` with `rows`.
    pub async fn replace_rows(
        &self,
        schema: &TableSchema,
        filter: &[(String, CellValue)],
        rows: &[Vec<CellValue>],
    ) -> Result<u64, PersistError> {
        let _guard = self.locks.acquire(&schema.name).await;
        self.ensure_locked(schema).await?;
        match self
            .store
            .replace_rows(&schema.name, filter, &schema.columns, rows)
            .await
        {
            Err(StoreError::ConnectionLost(reason)) => {
                warn!(table = %schema.name, %reason, "connection lost during replace; retrying once");
                self.reconnect().await?;
                Ok(self
                    .store
                    .replace_rows(&schema.name, filter, &schema.columns, rows)
                    .await?)
            }
            other => Ok(other?),
        }
    }

    pub async fn read_rows(&self, table: &str, columns: &[String]) -> Result<Vec<StoredRow>, PersistError> {
        let _guard = self.locks.acquire(table).await;
        match self.store.select_rows(table, columns).await {
            Err(StoreError::ConnectionLost(reason)) => {
                warn!(table, %reason, "connection lost during read; retrying once");
                self.reconnect().await?;
                Ok(self.store.select_rows(table, columns).await?)
            }
            other => Ok(other?),
        }
    }

    /// Index the table's positions spatially when the store can.
    pub async fn ensure_spatial(&self, table: &str) -> Result<SpatialIndexing, PersistError> {
        let _guard = self.locks.acquire(table).await;
        match self.store.ensure_spatial(table).await {
            Err(StoreError::ConnectionLost(reason)) => {
                warn!(table, %reason, "connection lost during spatial ddl; retrying once");
                self.reconnect().await?;
                Ok(self.store.ensure_spatial(table).await?)
            }
            other => Ok(other?),
        }
    }

    pub async fn describe(&self, table: &str) -> Result<Option<TableSchema>, PersistError> {
        match self.store.describe(table).await {
            Err(StoreError::ConnectionLost(reason)) => {
                warn!(table, %reason, "connection lost during describe; retrying once");
                self.reconnect().await?;
                Ok(self.store.describe(table).await?)
            }
            other => Ok(other?),
        }
    }

    pub async fn row_count(&self, table: &str) -> Result<u64, PersistError> {
        Ok(self.store.row_count(table).await?)
    }

    async fn reconnect(&self) -> Result<(), PersistError> {
        self.store.reconnect().await.map_err(|err| {
            error!(backend = self.store.backend(), error = %err, "store unreachable");
            PersistError::StoreUnreachable(err.to_string())
        })
    }

    async fn ensure_locked(&self, schema: &TableSchema) -> Result<SchemaDiff, PersistError> {
        let existing = self.describe(&schema.name).await?;
        let diff = diff_against(existing.as_ref(), schema);
        if diff.is_noop() {
            return Ok(diff);
        }
        info!(
            table = %diff.table,
            create = diff.create,
            added = diff.added.len(),
            widened = diff.widened.len(),
            coerced = diff.coerced.len(),
            "applying schema diff"
        );
        let applied = match self.store.apply_diff(&diff).await {
            Err(StoreError::ConnectionLost(reason)) => {
                warn!(table = %diff.table, %reason, "connection lost during ddl; retrying once");
                self.reconnect().await?;
                self.store.apply_diff(&diff).await
            }
            other => other,
        };
        applied.map_err(|source| PersistError::Schema {
            table: diff.table.clone(),
            source,
        })?;
        Ok(diff)
    }

    async fn insert_locked(
        &self,
        batch: &NormalizedBatch,
        chunk_size: usize,
    ) -> Result<InsertReport, PersistError> {
        let table = batch.schema.name.as_str();
        let chunk_size = chunk_size.max(1);
        let mut report = InsertReport::new(table, batch.rows.len());

        for (index, rows) in batch.rows.chunks(chunk_size).enumerate() {
            if report.aborted.is_some() {
                report.chunks.push(ChunkRecord {
                    index,
                    rows: rows.len(),
                    state: ChunkState::Pending.on(ChunkEvent::Abort, &self.config.retry)?,
                });
                continue;
            }

            let span = info_span!("commit_chunk", table, index, rows = rows.len());
            let state = self
                .commit_chunk(table, &batch.schema.columns, rows, &batch.schema.dedup_key)
                .instrument(span)
                .await?;

            match &state {
                ChunkState::Committed {
                    inserted,
                    skipped,
                    deduplicated,
                } => {
                    report.rows_inserted += inserted;
                    report.rows_skipped += skipped;
                    report.rows_deduplicated += deduplicated;
                }
                ChunkState::Failed { reason } => {
                    error!(table, index, %reason, "chunk failed; aborting remaining chunks");
                    report.aborted = Some(format!("chunk {index} failed: {reason}"));
                }
                _ => {}
            }
            report.chunks.push(ChunkRecord {
                index,
                rows: rows.len(),
                state,
            });
        }

        info!(
            table,
            attempted = report.rows_attempted,
            inserted = report.rows_inserted,
            skipped = report.rows_skipped,
            deduplicated = report.rows_deduplicated,
            chunks = report.chunks.len(),
            failed = report.chunks_failed(),
            "batch persisted"
        );
        Ok(report)
    }

    /// Commit one chunk as a single store transaction. Rejected rows are left out
    /// by the store; a failed chunk leaves nothing behind.
    async fn commit_chunk(
        &self,
        table: &str,
        columns: &[ColumnSpec],
        rows: &[Vec<CellValue>],
        dedup_key: &[String],
    ) -> Result<ChunkState, PersistError> {
        let policy = &self.config.retry;
        let mut state = ChunkState::Pending.on(ChunkEvent::Begin, policy)?;

        loop {
            match self.store.insert_rows(table, columns, rows, dedup_key).await {
                Ok(outcome) => {
                    let skipped = outcome.rejected.len() as u64;
                    if skipped > 0 {
                        warn!(table, rows = ?outcome.rejected, "rows rejected; left out of chunk");
                    }
                    let deduplicated = (rows.len() as u64)
                        .saturating_sub(skipped)
                        .saturating_sub(outcome.written);
                    debug!(table, inserted = outcome.written, "chunk committed");
                    return Ok(state.on(
                        ChunkEvent::Succeeded {
                            inserted: outcome.written,
                            skipped,
                            deduplicated,
                        },
                        policy,
                    )?);
                }
                Err(err) => {
                    let kind = err.kind();
                    state = state.on(
                        ChunkEvent::Failed {
                            kind,
                            reason: err.to_string(),
                        },
                        policy,
                    )?;
                    if !matches!(state, ChunkState::Retrying { .. }) {
                        return Ok(state);
                    }
                    warn!(table, error = %err, "chunk commit failed; retrying");
                    if kind == FailureKind::Connection {
                        self.reconnect().await?;
                    }
                    state = state.on(ChunkEvent::Begin, policy)?;
                }
            }
        }
    }
}
