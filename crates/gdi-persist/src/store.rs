use std::collections::VecDeque;
use std::ops::Range;

use async_trait::async_trait;
use gdi_core::{CellValue, ColumnSpec, TableSchema};
use gdi_schema::SchemaDiff;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Constraint,
    Connection,
    Statement,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Connection | FailureKind::Statement)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("row rejected: {0}")]
    RowRejected(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error("statement failed: {0}")]
    Statement(String),
    #[error("unknown table {0}")]
    UnknownTable(String),
}

impl StoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::RowRejected(_) => FailureKind::Constraint,
            StoreError::ConnectionLost(_) | StoreError::Unreachable(_) => FailureKind::Connection,
            StoreError::Statement(_) | StoreError::UnknownTable(_) => FailureKind::Statement,
        }
    }
}

/// A persisted row read back with its generated id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: i64,
    /// Aligned with the columns requested in `select_rows`.
    pub values: Vec<CellValue>,
}

/// Result of one atomic chunk write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub written: u64,
    /// Positions in the submitted rows that violated a constraint and were left out.
    pub rejected: Vec<usize>,
}

/// What `ensure_spatial` managed to set up on a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SpatialIndexing {
    /// Geometry columns populated from the position columns and GiST-indexed.
    Indexed { point: bool, bbox: bool },
    /// No spatial types on this backend; `lat`/`lon` stay the only positions.
    Unsupported { reason: String },
}

/// Work queue that halves a rejected range until the offending rows stand alone.
///
/// Stores drive it inside a single transaction, so accepted ranges stay
/// invisible until the whole chunk commits.
#[derive(Debug)]
pub(crate) struct Bisection {
    pending: VecDeque<Range<usize>>,
    rejected: Vec<usize>,
}

impl Bisection {
    pub(crate) fn new(len: usize) -> Self {
        let mut pending = VecDeque::new();
        if len > 0 {
            pending.push_back(0..len);
        }
        Self {
            pending,
            rejected: Vec::new(),
        }
    }

    pub(crate) fn next(&self) -> Option<Range<usize>> {
        self.pending.front().cloned()
    }

    pub(crate) fn accept(&mut self) {
        self.pending.pop_front();
    }

    pub(crate) fn reject(&mut self) {
        if let Some(range) = self.pending.pop_front() {
            if range.len() == 1 {
                self.rejected.push(range.start);
            } else {
                let mid = range.start + range.len() / 2;
                self.pending.push_front(mid..range.end);
                self.pending.push_front(range.start..mid);
            }
        }
    }

    pub(crate) fn finish(self) -> Vec<usize> {
        self.rejected
    }
}

/// The relational backend the persistence engine drives.
///
/// Every write call is atomic: either all `rows` become visible or none do.
/// Callers serialize calls per table; implementations need not.
#[async_trait]
pub trait TableStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Current shape of `table`, excluding the generated `id` column.
    async fn describe(&self, table: &str) -> Result<Option<TableSchema>, StoreError>;

    async fn apply_diff(&self, diff: &SchemaDiff) -> Result<(), StoreError>;

    /// Insert `rows` (aligned with `columns`) in one transaction.
    ///
    /// Rows violating a constraint are isolated by bisection inside that
    /// transaction and left out; every other row commits together or not at all.
    /// With a non-empty `dedup_key` rows colliding with an existing key are skipped.
    async fn insert_rows(
        &self,
        table: &str,
        columns: &[ColumnSpec],
        rows: &[Vec<CellValue>],
        dedup_key: &[String],
    ) -> Result<InsertOutcome, StoreError>;

    /// Delete every row matching all `filter` equalities, then insert `rows`,
    /// in one transaction.
    async fn replace_rows(
        &self,
        table: &str,
        filter: &[(String, CellValue)],
        columns: &[ColumnSpec],
        rows: &[Vec<CellValue>],
    ) -> Result<u64, StoreError>;

    async fn select_rows(&self, table: &str, columns: &[String]) -> Result<Vec<StoredRow>, StoreError>;

    async fn row_count(&self, table: &str) -> Result<u64, StoreError>;

    /// Replace the underlying session. `Unreachable` when no new one can be opened.
    async fn reconnect(&self) -> Result<(), StoreError>;

    /// Derive indexed point and bounding-box geometries from `lat`/`lon` and
    /// `bbox_*` where the backend supports spatial types.
    async fn ensure_spatial(&self, _table: &str) -> Result<SpatialIndexing, StoreError> {
        Ok(SpatialIndexing::Unsupported {
            reason: format!("{} backend has no spatial types", self.backend()),
        })
    }
}
