//! In-process `TableStore` used for dry runs and tests.
//!
//! Supports injected connection loss and row rejection so the engine's
//! failure handling can be exercised without PostgreSQL.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use gdi_core::{CellValue, ColumnSpec, TableSchema};
use gdi_schema::SchemaDiff;
use tokio::sync::Mutex;

use crate::store::{Bisection, InsertOutcome, StoreError, StoredRow, TableStore};

/// Returns true when a row must be rejected as a constraint violation.
pub type RowRejector = Arc<dyn Fn(&str, &[ColumnSpec], &[CellValue]) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionFault {
    /// Successful write statements allowed before the connection drops.
    pub after_commits: u64,
    /// Keep failing after a reconnect instead of firing once.
    pub persistent: bool,
}

#[derive(Debug, Default)]
struct MemoryTable {
    schema: Option<TableSchema>,
    rows: Vec<StoredRow>,
    next_id: i64,
}

#[derive(Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    commits: u64,
    disconnected: bool,
    fault: Option<ConnectionFault>,
    fail_reconnect: bool,
    reconnects: u64,
    rejector: Option<RowRejector>,
}

impl MemoryState {
    fn check_connected(&self) -> Result<(), StoreError> {
        if self.disconnected {
            return Err(StoreError::ConnectionLost("session closed".into()));
        }
        Ok(())
    }

    fn trip_fault(&mut self) -> Result<(), StoreError> {
        if let Some(fault) = self.fault {
            if self.commits >= fault.after_commits {
                self.disconnected = true;
                if !fault.persistent {
                    self.fault = None;
                }
                return Err(StoreError::ConnectionLost(format!(
                    "connection reset after {} commits",
                    self.commits
                )));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn inject_connection_fault(&self, fault: ConnectionFault) {
        self.state.lock().await.fault = Some(fault);
    }

    pub async fn fail_reconnects(&self, fail: bool) {
        self.state.lock().await.fail_reconnect = fail;
    }

    pub async fn reject_rows_where(&self, rejector: RowRejector) {
        self.state.lock().await.rejector = Some(rejector);
    }

    pub async fn reconnect_count(&self) -> u64 {
        self.state.lock().await.reconnects
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.state.lock().await.tables.keys().cloned().collect()
    }
}

fn dedup_signature(values: &[CellValue], positions: &[usize]) -> Vec<Option<String>> {
    positions
        .iter()
        .map(|&i| values.get(i).and_then(CellValue::render))
        .collect()
}

/// Map `columns` onto the table's column positions.
fn column_positions(schema: &TableSchema, columns: &[ColumnSpec]) -> Result<Vec<usize>, StoreError> {
    columns
        .iter()
        .map(|c| {
            schema
                .columns
                .iter()
                .position(|t| t.name == c.name)
                .ok_or_else(|| {
                    StoreError::Statement(format!(
                        "column {} of relation {} does not exist",
                        c.name, schema.name
                    ))
                })
        })
        .collect()
}

fn widen_rows(table: &mut MemoryTable, diff: &SchemaDiff) {
    let Some(schema) = table.schema.as_ref() else {
        return;
    };
    for widening in &diff.widened {
        if let Some(pos) = schema.columns.iter().position(|c| c.name == widening.column) {
            for row in &mut table.rows {
                if let Some(value) = row.values.get_mut(pos) {
                    *value = value.coerce_to(widening.to);
                }
            }
        }
    }
}

impl MemoryState {
    fn write_rows(
        &mut self,
        table: &str,
        columns: &[ColumnSpec],
        rows: &[Vec<CellValue>],
        dedup_key: &[String],
        filter: &[(String, CellValue)],
        isolate: bool,
    ) -> Result<InsertOutcome, StoreError> {
        self.check_connected()?;
        self.trip_fault()?;

        let entry = self
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        let schema = entry
            .schema
            .clone()
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        let positions = column_positions(&schema, columns)?;

        let rejected = match &self.rejector {
            None => Vec::new(),
            Some(rejector) if isolate => {
                let mut bisection = Bisection::new(rows.len());
                while let Some(range) = bisection.next() {
                    if rows[range].iter().any(|row| rejector(table, columns, row)) {
                        bisection.reject();
                    } else {
                        bisection.accept();
                    }
                }
                bisection.finish()
            }
            Some(rejector) => {
                if let Some(bad) = rows.iter().position(|row| rejector(table, columns, row)) {
                    return Err(StoreError::RowRejected(format!(
                        "row {bad} violates a constraint on {table}"
                    )));
                }
                Vec::new()
            }
        };
        let skip: HashSet<usize> = rejected.iter().copied().collect();

        let filter_positions = filter
            .iter()
            .map(|(name, value)| {
                schema
                    .columns
                    .iter()
                    .position(|c| c.name == *name)
                    .map(|pos| (pos, value.render()))
                    .ok_or_else(|| StoreError::Statement(format!("column {name} does not exist")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let key_positions: Vec<usize> = dedup_key
            .iter()
            .filter_map(|k| schema.columns.iter().position(|c| c.name == *k))
            .collect();

        let table_entry = self
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;

        if !filter.is_empty() {
            table_entry.rows.retain(|row| {
                !filter_positions
                    .iter()
                    .all(|(pos, expected)| row.values.get(*pos).and_then(CellValue::render) == *expected)
            });
        }

        let mut seen: HashSet<Vec<Option<String>>> = if key_positions.is_empty() {
            HashSet::new()
        } else {
            table_entry
                .rows
                .iter()
                .map(|row| dedup_signature(&row.values, &key_positions))
                .collect()
        };

        let mut written = 0u64;
        for (index, row) in rows.iter().enumerate() {
            if skip.contains(&index) {
                continue;
            }
            let mut values = vec![CellValue::Null; schema.columns.len()];
            for (value, &pos) in row.iter().zip(positions.iter()) {
                values[pos] = value.clone();
            }
            if !key_positions.is_empty() && !seen.insert(dedup_signature(&values, &key_positions)) {
                continue;
            }
            table_entry.next_id += 1;
            table_entry.rows.push(StoredRow {
                id: table_entry.next_id,
                values,
            });
            written += 1;
        }
        self.commits += 1;
        Ok(InsertOutcome { written, rejected })
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn describe(&self, table: &str) -> Result<Option<TableSchema>, StoreError> {
        let state = self.state.lock().await;
        state.check_connected()?;
        Ok(state.tables.get(table).and_then(|t| t.schema.clone()))
    }

    async fn apply_diff(&self, diff: &SchemaDiff) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_connected()?;
        let table = state.tables.entry(diff.table.clone()).or_default();
        widen_rows(table, diff);
        let width = diff.resulting.columns.len();
        for row in &mut table.rows {
            row.values.resize(width, CellValue::Null);
        }
        table.schema = Some(diff.resulting.clone());
        Ok(())
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[ColumnSpec],
        rows: &[Vec<CellValue>],
        dedup_key: &[String],
    ) -> Result<InsertOutcome, StoreError> {
        self.state
            .lock()
            .await
            .write_rows(table, columns, rows, dedup_key, &[], true)
    }

    async fn replace_rows(
        &self,
        table: &str,
        filter: &[(String, CellValue)],
        columns: &[ColumnSpec],
        rows: &[Vec<CellValue>],
    ) -> Result<u64, StoreError> {
        self.state
            .lock()
            .await
            .write_rows(table, columns, rows, &[], filter, false)
            .map(|outcome| outcome.written)
    }

    async fn select_rows(&self, table: &str, columns: &[String]) -> Result<Vec<StoredRow>, StoreError> {
        let state = self.state.lock().await;
        state.check_connected()?;
        let entry = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        let Some(schema) = entry.schema.as_ref() else {
            return Err(StoreError::UnknownTable(table.to_string()));
        };
        let positions: Vec<Option<usize>> = columns
            .iter()
            .map(|name| schema.columns.iter().position(|c| c.name == *name))
            .collect();
        Ok(entry
            .rows
            .iter()
            .map(|row| StoredRow {
                id: row.id,
                values: positions
                    .iter()
                    .map(|pos| pos.and_then(|p| row.values.get(p).cloned()).unwrap_or_default())
                    .collect(),
            })
            .collect())
    }

    async fn row_count(&self, table: &str) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        state.check_connected()?;
        state
            .tables
            .get(table)
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_reconnect {
            return Err(StoreError::Unreachable("memory store refused reconnect".into()));
        }
        state.disconnected = false;
        state.reconnects += 1;
        Ok(())
    }
}
