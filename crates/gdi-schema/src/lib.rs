//! Schema synthesis and additive schema evolution for drifting record batches.

use std::collections::{HashMap, HashSet};

use gdi_core::{CellValue, ColumnSpec, Partition, RawRecord, SqlType, TableSchema};
use serde::Serialize;
use tracing::warn;

pub const CRATE_NAME: &str = "gdi-schema";

/// PostgreSQL truncates identifiers beyond 63 bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

const FALLBACK_IDENTIFIER: &str = "unnamed_column";

const RESERVED_WORDS: &[&str] = &[
    "all", "alter", "and", "as", "binary", "blob", "boolean", "char", "check", "constraint",
    "create", "database", "date", "decimal", "default", "delete", "double", "drop", "foreign",
    "from", "group", "id", "index", "insert", "integer", "key", "limit", "not", "null", "numeric",
    "offset", "or", "order", "precision", "primary", "real", "references", "schema", "select",
    "serial", "table", "text", "time", "timestamp", "to", "union", "unique", "update", "user",
    "varchar", "view", "where",
];

/// Sanitize an arbitrary label into a PostgreSQL identifier. Idempotent.
pub fn clean_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    let trimmed = out.trim_start_matches(|c: char| c.is_ascii_digit() || c == '_');
    let mut cleaned = trimmed.to_string();
    if cleaned.is_empty() {
        cleaned = FALLBACK_IDENTIFIER.to_string();
    }
    if RESERVED_WORDS.contains(&cleaned.as_str()) {
        cleaned.push_str("_col");
    }
    truncate_identifier(&cleaned, MAX_IDENTIFIER_LEN)
}

fn truncate_identifier(name: &str, limit: usize) -> String {
    // Identifiers are ASCII at this point, so byte slicing is safe.
    let cut = if name.len() > limit { &name[..limit] } else { name };
    cut.trim_end_matches('_').to_string()
}

/// Clean `raw` names position-preserving, suffixing `_1`, `_2`, ... on collisions.
pub fn unique_identifiers<'a, I>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut used = HashSet::new();
    let mut out = Vec::new();
    for name in raw {
        let base = clean_identifier(name);
        let mut candidate = base.clone();
        let mut counter = 1usize;
        while used.contains(&candidate) {
            let suffix = format!("_{counter}");
            let stem = truncate_identifier(&base, MAX_IDENTIFIER_LEN - suffix.len());
            candidate = format!("{stem}{suffix}");
            counter += 1;
        }
        used.insert(candidate.clone());
        out.push(candidate);
    }
    out
}

/// Infer a column type from every non-null value. `None` when all values are null.
pub fn infer_type<'a, I>(values: I) -> Option<SqlType>
where
    I: IntoIterator<Item = &'a CellValue>,
{
    let mut seen_any = false;
    let mut all_integer = true;
    let mut all_numeric = true;
    for value in values {
        if value.is_null() {
            continue;
        }
        seen_any = true;
        if all_integer && value.as_integer().is_none() {
            all_integer = false;
        }
        if all_numeric && value.as_numeric().is_none() {
            all_numeric = false;
        }
        if !all_numeric {
            break;
        }
    }
    match (seen_any, all_integer, all_numeric) {
        (false, _, _) => None,
        (true, true, _) => Some(SqlType::Integer),
        (true, false, true) => Some(SqlType::Numeric),
        _ => Some(SqlType::Text),
    }
}

#[derive(Debug, Clone, Default)]
pub struct SynthesisOptions {
    pub partition: Option<Partition>,
    /// Columns with a declared type that are kept even when empty across the batch.
    pub pinned: Vec<ColumnSpec>,
    /// Cleaned column names forming the dedup key.
    pub dedup_key: Vec<String>,
}

/// A batch normalized to the union of its record keys.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
    pub schema: TableSchema,
    /// One entry per record, aligned with `schema.columns`.
    pub rows: Vec<Vec<CellValue>>,
    /// Columns seen in the batch but dropped because every value was empty.
    pub dropped_columns: Vec<String>,
}

impl NormalizedBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.schema.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Derive the table shape for `records` and normalize every record to it.
pub fn synthesize(table: &str, records: &[RawRecord], options: &SynthesisOptions) -> NormalizedBatch {
    let table_name = clean_identifier(table);

    let mut raw_keys: Vec<&str> = Vec::new();
    let mut seen_keys: HashSet<&str> = HashSet::new();
    for record in records {
        for key in record.keys() {
            if seen_keys.insert(key) {
                raw_keys.push(key);
            }
        }
    }

    let partition_name = options
        .partition
        .as_ref()
        .map(|p| clean_identifier(&p.column));
    let pinned: HashMap<&str, &ColumnSpec> = options
        .pinned
        .iter()
        .map(|c| (c.name.as_str(), c))
        .collect();

    // Raw keys that clean to the partition column are overwritten by the partition value.
    let cleaned = unique_identifiers(raw_keys.iter().copied());
    let mut columns: Vec<(String, Option<&str>)> = Vec::new();
    for (raw, clean) in raw_keys.iter().zip(cleaned.iter()) {
        if partition_name.as_deref() == Some(clean.as_str()) {
            continue;
        }
        columns.push((clean.clone(), Some(*raw)));
    }
    for spec in &options.pinned {
        if !columns.iter().any(|(name, _)| *name == spec.name) {
            columns.push((spec.name.clone(), None));
        }
    }
    for key in &options.dedup_key {
        if !columns.iter().any(|(name, _)| name == key) && partition_name.as_deref() != Some(key.as_str()) {
            columns.push((key.clone(), None));
        }
    }

    let mut specs = Vec::new();
    let mut dropped = Vec::new();
    let mut kept_sources: Vec<Option<&str>> = Vec::new();
    for (name, source) in &columns {
        let source = *source;
        let values = records
            .iter()
            .filter_map(|r| source.and_then(|key| r.get(key)));
        let inferred = infer_type(values);

        let sql_type = match (pinned.get(name.as_str()), inferred) {
            (Some(spec), _) => Some(spec.sql_type),
            (None, Some(t)) => Some(t),
            (None, None) if options.dedup_key.contains(name) => Some(SqlType::Text),
            (None, None) => None,
        };

        match sql_type {
            Some(sql_type) => {
                specs.push(ColumnSpec::nullable(name.clone(), sql_type));
                kept_sources.push(source);
            }
            None => dropped.push(name.clone()),
        }
    }

    let mut partition_value = None;
    if let (Some(partition), Some(name)) = (&options.partition, &partition_name) {
        let sql_type = infer_type(std::iter::once(&partition.value)).unwrap_or(SqlType::Text);
        specs.push(ColumnSpec::nullable(name.clone(), sql_type));
        partition_value = Some(partition.value.coerce_to(sql_type));
    }

    let rows = records
        .iter()
        .map(|record| {
            let mut row: Vec<CellValue> = specs
                .iter()
                .zip(kept_sources.iter())
                .map(|(spec, source)| {
                    source
                        .and_then(|key| record.get(key))
                        .map(|v| v.coerce_to(spec.sql_type))
                        .unwrap_or(CellValue::Null)
                })
                .collect();
            if let Some(value) = &partition_value {
                row.push(value.clone());
            }
            row
        })
        .collect();

    let schema = TableSchema::new(table_name, specs).with_dedup_key(options.dedup_key.clone());
    NormalizedBatch {
        schema,
        rows,
        dropped_columns: dropped,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Widening {
    pub column: String,
    pub from: SqlType,
    pub to: SqlType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Coercion {
    pub column: String,
    pub incoming: SqlType,
    pub stored_as: SqlType,
}

/// Explicit, loggable description of how a table must change to accept a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaDiff {
    pub table: String,
    pub create: bool,
    pub added: Vec<ColumnSpec>,
    pub widened: Vec<Widening>,
    pub coerced: Vec<Coercion>,
    pub dedup_key: Vec<String>,
    /// The dedup unique index has to be (re)created.
    pub dedup_changed: bool,
    /// Table shape once the diff is applied.
    pub resulting: TableSchema,
}

impl SchemaDiff {
    /// True when applying the diff would not touch the store.
    pub fn is_noop(&self) -> bool {
        !self.create && self.added.is_empty() && self.widened.is_empty() && !self.dedup_changed
    }

    pub fn has_conflicts(&self) -> bool {
        !self.widened.is_empty() || !self.coerced.is_empty()
    }
}

fn resolve_conflict(existing: SqlType, incoming: SqlType) -> SqlType {
    match (existing, incoming) {
        (e, i) if e == i => e,
        (SqlType::Text, _) => SqlType::Text,
        (SqlType::Numeric, SqlType::Integer) => SqlType::Numeric,
        (SqlType::Integer, SqlType::Numeric) => SqlType::Numeric,
        _ => SqlType::Text,
    }
}

/// Compute the additive change that lets `existing` accept rows shaped like `incoming`.
pub fn diff_against(existing: Option<&TableSchema>, incoming: &TableSchema) -> SchemaDiff {
    let Some(existing) = existing else {
        return SchemaDiff {
            table: incoming.name.clone(),
            create: true,
            added: incoming.columns.clone(),
            widened: Vec::new(),
            coerced: Vec::new(),
            dedup_key: incoming.dedup_key.clone(),
            dedup_changed: !incoming.dedup_key.is_empty(),
            resulting: incoming.clone(),
        };
    };

    let mut resulting = existing.clone();
    let mut added = Vec::new();
    let mut widened = Vec::new();
    let mut coerced = Vec::new();

    for column in &incoming.columns {
        match resulting.columns.iter_mut().find(|c| c.name == column.name) {
            None => {
                let spec = ColumnSpec::nullable(column.name.clone(), column.sql_type);
                added.push(spec.clone());
                resulting.columns.push(spec);
            }
            Some(current) if current.sql_type == column.sql_type => {}
            Some(current) => {
                let resolved = resolve_conflict(current.sql_type, column.sql_type);
                warn!(
                    table = %existing.name,
                    column = %current.name,
                    existing = %current.sql_type,
                    incoming = %column.sql_type,
                    resolved = %resolved,
                    "schema conflict resolved without failing"
                );
                if resolved != current.sql_type {
                    widened.push(Widening {
                        column: current.name.clone(),
                        from: current.sql_type,
                        to: resolved,
                    });
                    current.sql_type = resolved;
                }
                if resolved != column.sql_type {
                    coerced.push(Coercion {
                        column: current.name.clone(),
                        incoming: column.sql_type,
                        stored_as: resolved,
                    });
                }
            }
        }
    }

    let dedup_changed = !incoming.dedup_key.is_empty() && incoming.dedup_key != existing.dedup_key;
    if dedup_changed {
        resulting.dedup_key = incoming.dedup_key.clone();
    }

    SchemaDiff {
        table: existing.name.clone(),
        create: false,
        added,
        widened,
        coerced,
        dedup_key: resulting.dedup_key.clone(),
        dedup_changed,
        resulting,
    }
}

/// Coerce a batch's values to the column types of `target` and carry over its dedup key.
pub fn conform(mut batch: NormalizedBatch, target: &TableSchema) -> NormalizedBatch {
    batch.schema.dedup_key = target.dedup_key.clone();

    let target_types: Vec<SqlType> = batch
        .schema
        .columns
        .iter()
        .map(|c| target.column(&c.name).map(|t| t.sql_type).unwrap_or(c.sql_type))
        .collect();

    let changed = batch
        .schema
        .columns
        .iter()
        .zip(target_types.iter())
        .any(|(c, t)| c.sql_type != *t);
    if changed {
        for row in &mut batch.rows {
            for (value, sql_type) in row.iter_mut().zip(target_types.iter()) {
                *value = value.coerce_to(*sql_type);
            }
        }
        for (column, sql_type) in batch.schema.columns.iter_mut().zip(target_types) {
            column.sql_type = sql_type;
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(pairs: &[(&str, CellValue)]) -> RawRecord {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn clean_identifier_handles_punctuation_digits_and_case() {
        assert_eq!(clean_identifier("Power station name"), "power_station_name");
        assert_eq!(clean_identifier("Installed capacity (MW)"), "installed_capacity_mw");
        assert_eq!(clean_identifier("2019-20 Revenue $"), "revenue");
        assert_eq!(clean_identifier("__a--b__"), "a_b");
        assert_eq!(clean_identifier("!!!"), "unnamed_column");
        assert_eq!(clean_identifier("Order"), "order_col");
        assert_eq!(clean_identifier("id"), "id_col");
    }

    #[test]
    fn clean_identifier_is_idempotent() {
        let long = "x".repeat(80);
        let long_sep = format!("{}_tail", "ab ".repeat(30));
        let inputs = [
            "Power station name",
            "  Leading spaces",
            "123",
            "1a",
            "_1_a",
            "ÜNÏCÖDE naïve",
            "Order",
            "user",
            "a__b__c",
            "trailing___",
            long.as_str(),
            long_sep.as_str(),
            "",
            "Number of businesses at end of financial year",
        ];
        for input in inputs {
            let once = clean_identifier(input);
            assert_eq!(clean_identifier(&once), once, "input {input:?}");
            assert!(once.len() <= MAX_IDENTIFIER_LEN);
            assert!(!once.ends_with('_'));
        }
    }

    #[test]
    fn truncation_collisions_get_numeric_suffixes() {
        let a = format!("{}alpha", "x".repeat(63));
        let b = format!("{}bravo", "x".repeat(63));
        let names = unique_identifiers([a.as_str(), b.as_str(), "Total", "total"]);
        assert_eq!(names[0], "x".repeat(63));
        assert_eq!(names[1], "x".repeat(61) + "_1");
        assert_eq!(names[2], "total");
        assert_eq!(names[3], "total_1");
        assert!(names.iter().all(|n| n.len() <= MAX_IDENTIFIER_LEN));
    }

    #[test]
    fn type_inference_uses_every_value() {
        let values = vec![
            CellValue::Integer(1),
            CellValue::text("2"),
            CellValue::Null,
            CellValue::text("3.5"),
        ];
        assert_eq!(infer_type(&values), Some(SqlType::Numeric));

        let mut ints = vec![CellValue::Integer(1); 50];
        ints.push(CellValue::text("n/a"));
        assert_eq!(infer_type(&ints), Some(SqlType::Integer));
        ints.push(CellValue::text("Coal"));
        assert_eq!(infer_type(&ints), Some(SqlType::Text));

        assert_eq!(infer_type(&[CellValue::Null, CellValue::text("-")]), None);
    }

    #[test]
    fn synthesized_columns_are_key_union_minus_empty() {
        let records = vec![
            rec(&[("Name", "Alpha".into()), ("Capacity (MW)", CellValue::Integer(10)), ("Notes", "".into())]),
            rec(&[("Name", "Bravo".into()), ("State", "NSW".into()), ("Notes", "-".into())]),
            rec(&[("Capacity (MW)", 2.5.into()), ("State", "VIC".into())]),
        ];
        let batch = synthesize("Facility Registry", &records, &SynthesisOptions::default());

        assert_eq!(batch.schema.name, "facility_registry");
        assert_eq!(
            batch.schema.column_names(),
            vec!["name", "capacity_mw", "state"]
        );
        assert_eq!(batch.dropped_columns, vec!["notes".to_string()]);
        assert_eq!(batch.schema.column("capacity_mw").unwrap().sql_type, SqlType::Numeric);
        assert_eq!(
            batch.rows[1],
            vec![CellValue::text("Bravo"), CellValue::Null, CellValue::text("NSW")]
        );
        assert_eq!(batch.rows[0][1], CellValue::Numeric(10.0));
        assert!(batch.schema.columns.iter().all(|c| c.nullable));
    }

    #[test]
    fn partition_column_is_constant_and_typed() {
        let records = vec![
            rec(&[("Code", CellValue::Integer(1)), ("Label", "NSW".into())]),
            rec(&[("Code", CellValue::Integer(2)), ("Label", "VIC".into())]),
        ];
        let options = SynthesisOptions {
            partition: Some(Partition::geographic_level(1)),
            ..Default::default()
        };
        let batch = synthesize("business_entries", &records, &options);
        let level = batch.schema.column("geographic_level").unwrap();
        assert_eq!(level.sql_type, SqlType::Integer);
        assert!(batch
            .rows
            .iter()
            .all(|r| r.last() == Some(&CellValue::Integer(1))));
    }

    #[test]
    fn pinned_columns_survive_an_all_null_batch() {
        let records = vec![rec(&[("name", "Alpha".into()), ("lat", CellValue::Null)])];
        let options = SynthesisOptions {
            pinned: vec![
                ColumnSpec::nullable("lat", SqlType::Numeric),
                ColumnSpec::nullable("lon", SqlType::Numeric),
            ],
            ..Default::default()
        };
        let batch = synthesize("stations", &records, &options);
        assert_eq!(batch.schema.column_names(), vec!["name", "lat", "lon"]);
        assert!(batch.dropped_columns.is_empty());
    }

    #[test]
    fn successive_partitions_evolve_additively() {
        let year_one = vec![rec(&[("a", CellValue::Integer(1)), ("b", "x".into()), ("c", CellValue::Integer(3))])];
        let year_two = vec![rec(&[("a", CellValue::Integer(2)), ("b", "y".into()), ("d", 4.5.into())])];

        let first = synthesize("nger", &year_one, &SynthesisOptions::default());
        let create = diff_against(None, &first.schema);
        assert!(create.create);

        let second = synthesize("nger", &year_two, &SynthesisOptions::default());
        let evolve = diff_against(Some(&create.resulting), &second.schema);
        assert!(!evolve.create);
        assert_eq!(evolve.added, vec![ColumnSpec::nullable("d", SqlType::Numeric)]);
        assert_eq!(evolve.resulting.column_names(), vec!["a", "b", "c", "d"]);
        assert!(!evolve.has_conflicts());

        let again = diff_against(Some(&evolve.resulting), &second.schema);
        assert!(again.is_noop());
    }

    #[test]
    fn type_conflicts_widen_instead_of_failing() {
        let existing = TableSchema::new(
            "t",
            vec![
                ColumnSpec::nullable("count", SqlType::Integer),
                ColumnSpec::nullable("label", SqlType::Text),
                ColumnSpec::nullable("ratio", SqlType::Numeric),
            ],
        );
        let records = vec![rec(&[
            ("count", "many".into()),
            ("label", CellValue::Integer(7)),
            ("ratio", CellValue::Integer(2)),
        ])];
        let batch = synthesize("t", &records, &SynthesisOptions::default());
        let diff = diff_against(Some(&existing), &batch.schema);

        assert_eq!(
            diff.widened,
            vec![Widening {
                column: "count".into(),
                from: SqlType::Integer,
                to: SqlType::Text
            }]
        );
        assert_eq!(diff.coerced.len(), 2);
        assert!(diff.added.is_empty());

        let conformed = conform(batch, &diff.resulting);
        assert_eq!(
            conformed.rows[0],
            vec![
                CellValue::text("many"),
                CellValue::text("7"),
                CellValue::Numeric(2.0)
            ]
        );
    }

    #[test]
    fn integer_column_widens_to_numeric() {
        let existing = TableSchema::new("t", vec![ColumnSpec::nullable("v", SqlType::Integer)]);
        let batch = synthesize("t", &[rec(&[("v", 1.5.into())])], &SynthesisOptions::default());
        let diff = diff_against(Some(&existing), &batch.schema);
        assert_eq!(diff.widened[0].to, SqlType::Numeric);
        assert!(diff.coerced.is_empty());
    }

    #[test]
    fn dedup_key_columns_are_kept() {
        let records = vec![rec(&[("facility", "A".into()), ("year", CellValue::Null)])];
        let options = SynthesisOptions {
            dedup_key: vec!["facility".into(), "year".into()],
            ..Default::default()
        };
        let batch = synthesize("t", &records, &options);
        assert_eq!(batch.schema.column_names(), vec!["facility", "year"]);
        assert_eq!(batch.schema.dedup_key, vec!["facility", "year"]);
    }

    #[test]
    fn conform_keeps_the_stored_dedup_key() {
        let existing = TableSchema::new(
            "t",
            vec![
                ColumnSpec::nullable("facility", SqlType::Text),
                ColumnSpec::nullable("year", SqlType::Integer),
            ],
        )
        .with_dedup_key(vec!["facility".into(), "year".into()]);
        let batch = synthesize(
            "t",
            &[rec(&[("facility", "A".into()), ("year", CellValue::Integer(2021))])],
            &SynthesisOptions::default(),
        );
        assert!(batch.schema.dedup_key.is_empty());
        let diff = diff_against(Some(&existing), &batch.schema);
        let conformed = conform(batch, &diff.resulting);
        assert_eq!(conformed.schema.dedup_key, vec!["facility", "year"]);
    }
}
