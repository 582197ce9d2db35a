//! PostgreSQL `TableStore` over a shared sqlx pool.

use std::time::Duration;

use async_trait::async_trait;
use gdi_core::{CellValue, ColumnSpec, SqlType, TableSchema};
use gdi_schema::{clean_identifier, SchemaDiff, MAX_IDENTIFIER_LEN};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::store::{Bisection, InsertOutcome, SpatialIndexing, StoreError, StoredRow, TableStore};

/// PostgreSQL caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = 65_535;

pub struct PgStore {
    url: String,
    max_connections: u32,
    pool: RwLock<PgPool>,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = open_pool(url, max_connections).await?;
        Ok(Self {
            url: url.to_string(),
            max_connections,
            pool: RwLock::new(pool),
        })
    }

    async fn pool(&self) -> PgPool {
        self.pool.read().await.clone()
    }
}

async fn open_pool(url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .map_err(|err| StoreError::Unreachable(err.to_string()))
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

const DEDUP_INDEX_MARKER: &str = "_dedup_";

/// `<table>_dedup_<digest of the key columns>`; a changed key gets a new name.
fn dedup_index_name(table: &str, key: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.join("\u{1f}").as_bytes());
    let digest = hex::encode(hasher.finalize());
    let suffix = format!("{DEDUP_INDEX_MARKER}{}", &digest[..12]);
    let head: String = table
        .chars()
        .take(MAX_IDENTIFIER_LEN.saturating_sub(suffix.len()))
        .collect();
    format!("{head}{suffix}")
}

/// Dedup indexes on `table` as (index name, column) pairs in key order.
async fn dedup_indexes(conn: &mut PgConnection, table: &str) -> Result<Vec<(String, String)>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT c.relname::text AS index_name, a.attname::text AS column_name
          FROM pg_index i
          JOIN pg_class c ON c.oid = i.indexrelid
          JOIN pg_class t ON t.oid = i.indrelid
          JOIN pg_namespace n ON n.oid = t.relnamespace
          JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
         WHERE n.nspname = current_schema()
           AND t.relname = $1
           AND i.indisunique
           AND position($2 in c.relname) > 0
         ORDER BY c.relname, array_position(i.indkey::int2[], a.attnum)
        "#,
    )
    .bind(table)
    .bind(DEDUP_INDEX_MARKER)
    .fetch_all(&mut *conn)
    .await
    .map_err(classify)?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push((
            row.try_get("index_name").map_err(classify)?,
            row.try_get("column_name").map_err(classify)?,
        ));
    }
    Ok(out)
}

pub const POINT_GEOMETRY_COLUMN: &str = "geom";
pub const BBOX_GEOMETRY_COLUMN: &str = "geom_bbox";
const BBOX_COLUMNS: [&str; 4] = ["bbox_west", "bbox_south", "bbox_east", "bbox_north"];

fn as_double(column: &str) -> String {
    format!("NULLIF({}::text, '')::double precision", quote_ident(column))
}

/// DDL and backfill for the PostGIS geometry columns of `table`.
fn spatial_statements(table: &str, point: bool, bbox: bool) -> Vec<String> {
    let quoted = quote_ident(table);
    let mut statements = Vec::new();
    if point {
        let geom = quote_ident(POINT_GEOMETRY_COLUMN);
        statements.push(format!(
            "ALTER TABLE {quoted} ADD COLUMN IF NOT EXISTS {geom} geometry(Point, 4326)"
        ));
        statements.push(format!(
            "UPDATE {quoted} SET {geom} = ST_SetSRID(ST_MakePoint({}, {}), 4326) \
             WHERE {geom} IS NULL AND \"lat\" IS NOT NULL AND \"lon\" IS NOT NULL",
            as_double("lon"),
            as_double("lat")
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {quoted} USING GIST ({geom})",
            quote_ident(&clean_identifier(&format!("{table}_{POINT_GEOMETRY_COLUMN}_gist")))
        ));
    }
    if bbox {
        let geom = quote_ident(BBOX_GEOMETRY_COLUMN);
        let present = BBOX_COLUMNS
            .iter()
            .map(|c| format!("{} IS NOT NULL", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let corners = BBOX_COLUMNS
            .iter()
            .map(|c| as_double(c))
            .collect::<Vec<_>>()
            .join(", ");
        statements.push(format!(
            "ALTER TABLE {quoted} ADD COLUMN IF NOT EXISTS {geom} geometry(Polygon, 4326)"
        ));
        statements.push(format!(
            "UPDATE {quoted} SET {geom} = ST_MakeEnvelope({corners}, 4326) WHERE {geom} IS NULL AND {present}"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {quoted} USING GIST ({geom})",
            quote_ident(&clean_identifier(&format!("{table}_{BBOX_GEOMETRY_COLUMN}_gist")))
        ));
    }
    statements
}

/// Map a sqlx failure onto the engine's failure taxonomy.
pub fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            if code.starts_with("22") || code.starts_with("23") {
                StoreError::RowRejected(format!("{code}: {}", db.message()))
            } else if code.starts_with("08") || code == "57P01" {
                StoreError::ConnectionLost(format!("{code}: {}", db.message()))
            } else {
                StoreError::Statement(format!("{code}: {}", db.message()))
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::ConnectionLost(err.to_string()),
        _ => StoreError::Statement(err.to_string()),
    }
}

fn column_list(columns: &[ColumnSpec]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

async fn insert_in(
    conn: &mut PgConnection,
    table: &str,
    columns: &[ColumnSpec],
    rows: &[Vec<CellValue>],
    on_conflict_skip: bool,
) -> Result<u64, StoreError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut written = 0u64;
    if columns.is_empty() {
        let sql = format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table));
        for _ in rows {
            written += sqlx::query(&sql)
                .execute(&mut *conn)
                .await
                .map_err(classify)?
                .rows_affected();
        }
        return Ok(written);
    }

    let per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);
    let head = format!(
        "INSERT INTO {} ({}) ",
        quote_ident(table),
        column_list(columns)
    );
    for slice in rows.chunks(per_statement) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(head.as_str());
        qb.push_values(slice, |mut b, row| {
            for (spec, value) in columns.iter().zip(row.iter()) {
                match spec.sql_type {
                    SqlType::Integer => b.push_bind(value.as_integer()),
                    SqlType::Numeric => b.push_bind(value.as_numeric()),
                    SqlType::Text => b.push_bind(value.render()),
                };
            }
        });
        if on_conflict_skip {
            qb.push(" ON CONFLICT DO NOTHING");
        }
        written += qb
            .build()
            .execute(&mut *conn)
            .await
            .map_err(classify)?
            .rows_affected();
    }
    Ok(written)
}

#[async_trait]
impl TableStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn describe(&self, table: &str) -> Result<Option<TableSchema>, StoreError> {
        let pool = self.pool().await;
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name, data_type::text AS data_type
              FROM information_schema.columns
             WHERE table_schema = current_schema()
               AND table_name = $1
               AND data_type <> 'USER-DEFINED'
             ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(classify)?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("column_name").map_err(classify)?;
            if name == "id" {
                continue;
            }
            let data_type: String = row.try_get("data_type").map_err(classify)?;
            columns.push(ColumnSpec::nullable(name, SqlType::from_catalog(&data_type)));
        }

        let mut conn = pool.acquire().await.map_err(classify)?;
        let indexes = dedup_indexes(&mut conn, table).await?;
        let dedup_key: Vec<String> = match indexes.first() {
            Some((first, _)) => indexes
                .iter()
                .filter(|(name, _)| name == first)
                .map(|(_, column)| column.clone())
                .collect(),
            None => Vec::new(),
        };

        Ok(Some(TableSchema::new(table, columns).with_dedup_key(dedup_key)))
    }

    async fn apply_diff(&self, diff: &SchemaDiff) -> Result<(), StoreError> {
        let pool = self.pool().await;
        let table = quote_ident(&diff.table);
        let mut statements = Vec::new();

        if diff.create {
            let mut defs = vec!["id BIGSERIAL PRIMARY KEY".to_string()];
            defs.extend(
                diff.added
                    .iter()
                    .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type.ddl())),
            );
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {table} ({})",
                defs.join(", ")
            ));
        } else {
            for column in &diff.added {
                statements.push(format!(
                    "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {} {}",
                    quote_ident(&column.name),
                    column.sql_type.ddl()
                ));
            }
        }
        for widening in &diff.widened {
            let column = quote_ident(&widening.column);
            let ddl = widening.to.ddl();
            statements.push(format!(
                "ALTER TABLE {table} ALTER COLUMN {column} TYPE {ddl} USING {column}::{ddl}"
            ));
        }
        let mut tx = pool.begin().await.map_err(classify)?;
        for sql in &statements {
            debug!(table = %diff.table, sql = %sql, "applying ddl");
            sqlx::query(sql).execute(&mut *tx).await.map_err(classify)?;
        }

        if diff.dedup_changed && !diff.dedup_key.is_empty() {
            let wanted = dedup_index_name(&diff.table, &diff.dedup_key);
            let mut stale: Vec<String> = dedup_indexes(&mut tx, &diff.table)
                .await?
                .into_iter()
                .map(|(name, _)| name)
                .filter(|name| *name != wanted)
                .collect();
            stale.dedup();
            for name in &stale {
                info!(table = %diff.table, index = %name, "dropping superseded dedup index");
                sqlx::query(&format!("DROP INDEX IF EXISTS {}", quote_ident(name)))
                    .execute(&mut *tx)
                    .await
                    .map_err(classify)?;
            }
            let keys = diff
                .dedup_key
                .iter()
                .map(|k| quote_ident(k))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {table} ({keys}) NULLS NOT DISTINCT",
                quote_ident(&wanted)
            );
            debug!(table = %diff.table, sql = %sql, "applying ddl");
            sqlx::query(&sql).execute(&mut *tx).await.map_err(classify)?;
        }
        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[ColumnSpec],
        rows: &[Vec<CellValue>],
        dedup_key: &[String],
    ) -> Result<InsertOutcome, StoreError> {
        let pool = self.pool().await;
        let mut tx = pool.begin().await.map_err(classify)?;
        let mut bisection = Bisection::new(rows.len());
        let mut written = 0u64;
        while let Some(range) = bisection.next() {
            sqlx::query("SAVEPOINT chunk_part")
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
            match insert_in(&mut tx, table, columns, &rows[range.clone()], !dedup_key.is_empty()).await {
                Ok(n) => {
                    sqlx::query("RELEASE SAVEPOINT chunk_part")
                        .execute(&mut *tx)
                        .await
                        .map_err(classify)?;
                    written += n;
                    bisection.accept();
                }
                Err(StoreError::RowRejected(reason)) => {
                    sqlx::query("ROLLBACK TO SAVEPOINT chunk_part")
                        .execute(&mut *tx)
                        .await
                        .map_err(classify)?;
                    if range.len() == 1 {
                        warn!(table, row = range.start, %reason, "row rejected; leaving it out");
                    }
                    bisection.reject();
                }
                Err(other) => return Err(other),
            }
        }
        tx.commit().await.map_err(classify)?;
        Ok(InsertOutcome {
            written,
            rejected: bisection.finish(),
        })
    }

    async fn replace_rows(
        &self,
        table: &str,
        filter: &[(String, CellValue)],
        columns: &[ColumnSpec],
        rows: &[Vec<CellValue>],
    ) -> Result<u64, StoreError> {
        let pool = self.pool().await;
        let mut tx = pool.begin().await.map_err(classify)?;

        let mut delete: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("DELETE FROM {}", quote_ident(table)));
        for (i, (name, value)) in filter.iter().enumerate() {
            delete.push(if i == 0 { " WHERE " } else { " AND " });
            delete.push(quote_ident(name));
            match value {
                CellValue::Null => {
                    delete.push(" IS NULL");
                }
                CellValue::Integer(v) => {
                    delete.push(" = ").push_bind(*v);
                }
                CellValue::Numeric(v) => {
                    delete.push(" = ").push_bind(*v);
                }
                CellValue::Boolean(v) => {
                    delete.push(" = ").push_bind(*v);
                }
                CellValue::Text(v) => {
                    delete.push(" = ").push_bind(v.clone());
                }
            }
        }
        let removed = delete
            .build()
            .execute(&mut *tx)
            .await
            .map_err(classify)?
            .rows_affected();

        let written = insert_in(&mut tx, table, columns, rows, false).await?;
        tx.commit().await.map_err(classify)?;
        debug!(table, removed, written, "replaced rows");
        Ok(written)
    }

    async fn select_rows(&self, table: &str, columns: &[String]) -> Result<Vec<StoredRow>, StoreError> {
        let schema = self
            .describe(table)
            .await?
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        let types: Vec<SqlType> = columns
            .iter()
            .map(|name| schema.column(name).map(|c| c.sql_type).unwrap_or(SqlType::Text))
            .collect();
        let projections = columns
            .iter()
            .map(|name| match schema.column(name) {
                Some(_) => format!("{}::text", quote_ident(name)),
                None => "NULL::text".to_string(),
            })
            .collect::<Vec<_>>();
        let mut sql = String::from("SELECT id");
        for projection in &projections {
            sql.push_str(", ");
            sql.push_str(projection);
        }
        sql.push_str(&format!(" FROM {} ORDER BY id", quote_ident(table)));

        let pool = self.pool().await;
        let rows = sqlx::query(&sql).fetch_all(&pool).await.map_err(classify)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get(0).map_err(classify)?;
            let mut values = Vec::with_capacity(columns.len());
            for (i, sql_type) in types.iter().enumerate() {
                let raw: Option<String> = row.try_get(i + 1).map_err(classify)?;
                values.push(raw.map(CellValue::Text).unwrap_or_default().coerce_to(*sql_type));
            }
            out.push(StoredRow { id, values });
        }
        Ok(out)
    }

    async fn row_count(&self, table: &str) -> Result<u64, StoreError> {
        let pool = self.pool().await;
        let count = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
            .fetch_one(&pool)
            .await
            .map_err(classify)?;
        Ok(count.max(0) as u64)
    }

    async fn ensure_spatial(&self, table: &str) -> Result<SpatialIndexing, StoreError> {
        let pool = self.pool().await;
        let installed = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'postgis')",
        )
        .fetch_one(&pool)
        .await
        .map_err(classify)?;
        if !installed {
            if let Err(err) = sqlx::query("CREATE EXTENSION IF NOT EXISTS postgis")
                .execute(&pool)
                .await
            {
                let err = classify(err);
                if matches!(err, StoreError::ConnectionLost(_)) {
                    return Err(err);
                }
                debug!(table, error = %err, "postgis not available");
                return Ok(SpatialIndexing::Unsupported {
                    reason: err.to_string(),
                });
            }
        }

        let schema = self
            .describe(table)
            .await?
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        let point = schema.column("lat").is_some() && schema.column("lon").is_some();
        let bbox = BBOX_COLUMNS.iter().all(|c| schema.column(c).is_some());

        let mut tx = pool.begin().await.map_err(classify)?;
        for sql in spatial_statements(table, point, bbox) {
            debug!(table, sql = %sql, "applying spatial ddl");
            sqlx::query(&sql).execute(&mut *tx).await.map_err(classify)?;
        }
        tx.commit().await.map_err(classify)?;
        info!(table, point, bbox, "spatial columns ensured");
        Ok(SpatialIndexing::Indexed { point, bbox })
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        let fresh = open_pool(&self.url, self.max_connections).await?;
        let stale = {
            let mut guard = self.pool.write().await;
            std::mem::replace(&mut *guard, fresh)
        };
        stale.close().await;
        info!("postgres pool reconnected");
        Ok(())
    }
}
