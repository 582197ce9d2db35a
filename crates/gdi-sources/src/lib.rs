//! Source adapter contracts + fixture-bundle adapters for the three collaborator kinds.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use gdi_core::{CellValue, Partition, RawRecord};
use gdi_geocode::QueryPlan;
use gdi_schema::clean_identifier;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gdi-sources";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Spreadsheet topics at state and local-government level.
    EconomicStatistics,
    /// Scraped facility tables, one per approval status.
    FacilityRegistry,
    /// Yearly reporting files with numeric year bounds.
    AnnualReporting,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EconomicStatistics => "economic_statistics",
            Self::FacilityRegistry => "facility_registry",
            Self::AnnualReporting => "annual_reporting",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableLayout {
    #[default]
    PerPartition,
    Unified,
}

/// One `sources.yaml` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub kind: SourceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Bundle path, relative to the workspace root.
    pub bundle: PathBuf,
    pub table_prefix: String,
    #[serde(default)]
    pub table_layout: TableLayout,
    #[serde(default)]
    pub dedup_key: Vec<String>,
    #[serde(default)]
    pub geocode: Option<QueryPlan>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub source_id: String,
    pub kind: SourceKind,
    pub fetched_at: DateTime<Utc>,
    pub partitions: Vec<FixturePartition>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePartition {
    pub label: String,
    #[serde(default)]
    pub geographic_level: Option<i64>,
    #[serde(default)]
    pub start_year: Option<i64>,
    #[serde(default)]
    pub stop_year: Option<i64>,
    pub records: Vec<RawRecord>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("bundle for `{source_id}` is {found:?}, registry says {expected:?}")]
    KindMismatch {
        source_id: String,
        expected: SourceKind,
        found: SourceKind,
    },
    #[error("bundle belongs to `{found}`, registry entry is `{expected}`")]
    SourceMismatch { expected: String, found: String },
    #[error("partition `{label}` of `{source_id}` is missing `{field}`")]
    MissingPartitionField {
        source_id: String,
        label: String,
        field: &'static str,
    },
    #[error("partition `{label}` of `{source_id}`: {reason}")]
    InvalidPartition {
        source_id: String,
        label: String,
        reason: String,
    },
}

/// One independently processable (source, partition) batch bound for one table.
#[derive(Debug, Clone)]
pub struct IngestionUnit {
    pub unit_id: Uuid,
    pub source_id: String,
    pub label: String,
    pub table: String,
    pub partition: Option<Partition>,
    pub records: Vec<RawRecord>,
    pub dedup_key: Vec<String>,
    pub geocode: Option<QueryPlan>,
}

pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn plan_units(
        &self,
        config: &SourceConfig,
        bundle: &FixtureBundle,
    ) -> Result<Vec<IngestionUnit>, SourceError>;
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle, SourceError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).map_err(|source| SourceError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| SourceError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Stable across runs for the same source, table and partition label.
pub fn deterministic_unit_id(source_id: &str, table: &str, label: &str) -> Uuid {
    let key = format!("gdi:{source_id}:{table}:{label}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
}

pub fn table_name(prefix: &str, suffix: &str) -> String {
    clean_identifier(&format!("{prefix}_{suffix}"))
}

fn unit(
    config: &SourceConfig,
    label: &str,
    table: String,
    partition: Option<Partition>,
    records: Vec<RawRecord>,
) -> IngestionUnit {
    IngestionUnit {
        unit_id: deterministic_unit_id(&config.source_id, &table, label),
        source_id: config.source_id.clone(),
        label: label.to_string(),
        table,
        partition,
        records,
        dedup_key: config.dedup_key.clone(),
        geocode: config.geocode.clone(),
    }
}

fn check_bundle(config: &SourceConfig, bundle: &FixtureBundle) -> Result<(), SourceError> {
    if bundle.kind != config.kind {
        return Err(SourceError::KindMismatch {
            source_id: config.source_id.clone(),
            expected: config.kind,
            found: bundle.kind,
        });
    }
    if bundle.source_id != config.source_id {
        return Err(SourceError::SourceMismatch {
            expected: config.source_id.clone(),
            found: bundle.source_id.clone(),
        });
    }
    Ok(())
}

fn non_empty<'a>(bundle: &'a FixtureBundle) -> impl Iterator<Item = &'a FixturePartition> {
    bundle.partitions.iter().filter(|p| {
        if p.records.is_empty() {
            debug!(source = %bundle.source_id, label = %p.label, "skipping empty partition");
        }
        !p.records.is_empty()
    })
}

/// One table per topic; state and local-government rows share it, told apart by `geographic_level`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EconomicStatisticsAdapter;

impl SourceAdapter for EconomicStatisticsAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::EconomicStatistics
    }

    fn plan_units(
        &self,
        config: &SourceConfig,
        bundle: &FixtureBundle,
    ) -> Result<Vec<IngestionUnit>, SourceError> {
        check_bundle(config, bundle)?;
        non_empty(bundle)
            .map(|p| {
                let level = p.geographic_level.ok_or_else(|| SourceError::MissingPartitionField {
                    source_id: config.source_id.clone(),
                    label: p.label.clone(),
                    field: "geographic_level",
                })?;
                if !(0..=1).contains(&level) {
                    return Err(SourceError::InvalidPartition {
                        source_id: config.source_id.clone(),
                        label: p.label.clone(),
                        reason: format!("geographic_level must be 0 or 1, got {level}"),
                    });
                }
                let table = table_name(&config.table_prefix, &p.label);
                let label = format!("{}@{level}", p.label);
                Ok(unit(
                    config,
                    &label,
                    table,
                    Some(Partition::geographic_level(level)),
                    p.records.clone(),
                ))
            })
            .collect()
    }
}

/// One table per approval status.
#[derive(Debug, Clone, Copy, Default)]
pub struct FacilityRegistryAdapter;

impl SourceAdapter for FacilityRegistryAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::FacilityRegistry
    }

    fn plan_units(
        &self,
        config: &SourceConfig,
        bundle: &FixtureBundle,
    ) -> Result<Vec<IngestionUnit>, SourceError> {
        check_bundle(config, bundle)?;
        Ok(non_empty(bundle)
            .map(|p| {
                let table = table_name(&config.table_prefix, &p.label);
                unit(config, &p.label, table, None, p.records.clone())
            })
            .collect())
    }
}

/// One table per reporting year, or a single `<prefix>_unified` table keyed by `year_label`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnualReportingAdapter;

impl SourceAdapter for AnnualReportingAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::AnnualReporting
    }

    fn plan_units(
        &self,
        config: &SourceConfig,
        bundle: &FixtureBundle,
    ) -> Result<Vec<IngestionUnit>, SourceError> {
        check_bundle(config, bundle)?;
        non_empty(bundle)
            .map(|p| {
                if let (Some(start), Some(stop)) = (p.start_year, p.stop_year) {
                    if stop < start {
                        return Err(SourceError::InvalidPartition {
                            source_id: config.source_id.clone(),
                            label: p.label.clone(),
                            reason: format!("stop_year {stop} precedes start_year {start}"),
                        });
                    }
                }
                let records = p
                    .records
                    .iter()
                    .cloned()
                    .map(|mut record| {
                        stamp_if_absent(&mut record, "start_year", p.start_year);
                        stamp_if_absent(&mut record, "stop_year", p.stop_year);
                        record
                    })
                    .collect();
                let (table, partition) = match config.table_layout {
                    TableLayout::PerPartition => (table_name(&config.table_prefix, &p.label), None),
                    TableLayout::Unified => (
                        table_name(&config.table_prefix, "unified"),
                        Some(Partition {
                            column: "year_label".to_string(),
                            value: CellValue::text(p.label.clone()),
                        }),
                    ),
                };
                Ok(unit(config, &p.label, table, partition, records))
            })
            .collect()
    }
}

fn stamp_if_absent(record: &mut RawRecord, field: &str, value: Option<i64>) {
    let present = record.get(field).is_some_and(|v| !v.is_null());
    if let (false, Some(value)) = (present, value) {
        record.insert(field, value);
    }
}

pub fn adapter_for_kind(kind: SourceKind) -> Box<dyn SourceAdapter> {
    match kind {
        SourceKind::EconomicStatistics => Box::new(EconomicStatisticsAdapter),
        SourceKind::FacilityRegistry => Box::new(FacilityRegistryAdapter),
        SourceKind::AnnualReporting => Box::new(AnnualReportingAdapter),
    }
}

/// Load the configured bundle under `root` and split it into ingestion units.
pub fn plan_source(root: &Path, config: &SourceConfig) -> Result<Vec<IngestionUnit>, SourceError> {
    let bundle = load_fixture_bundle(root.join(&config.bundle))?;
    adapter_for_kind(config.kind).plan_units(config, &bundle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: SourceKind, prefix: &str) -> SourceConfig {
        SourceConfig {
            source_id: "test-source".into(),
            kind,
            enabled: true,
            bundle: PathBuf::from("unused.json"),
            table_prefix: prefix.into(),
            table_layout: TableLayout::PerPartition,
            dedup_key: Vec::new(),
            geocode: None,
        }
    }

    fn partition(label: &str, records: Vec<RawRecord>) -> FixturePartition {
        FixturePartition {
            label: label.into(),
            geographic_level: None,
            start_year: None,
            stop_year: None,
            records,
        }
    }

    fn bundle(kind: SourceKind, partitions: Vec<FixturePartition>) -> FixtureBundle {
        FixtureBundle {
            source_id: "test-source".into(),
            kind,
            fetched_at: Utc::now(),
            partitions,
            notes: None,
        }
    }

    #[test]
    fn economic_levels_share_a_topic_table() {
        let mut state = partition("Population & People", vec![RawRecord::new().with("Code", "1")]);
        state.geographic_level = Some(0);
        let mut lga = state.clone();
        lga.geographic_level = Some(1);
        let units = EconomicStatisticsAdapter
            .plan_units(
                &config(SourceKind::EconomicStatistics, "abs"),
                &bundle(SourceKind::EconomicStatistics, vec![state, lga]),
            )
            .unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].table, "abs_population_people");
        assert_eq!(units[0].table, units[1].table);
        assert_eq!(units[1].partition, Some(Partition::geographic_level(1)));
        assert_ne!(units[0].unit_id, units[1].unit_id);
    }

    #[test]
    fn economic_partition_needs_a_level() {
        let err = EconomicStatisticsAdapter
            .plan_units(
                &config(SourceKind::EconomicStatistics, "abs"),
                &bundle(
                    SourceKind::EconomicStatistics,
                    vec![partition("income", vec![RawRecord::new().with("x", 1i64)])],
                ),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SourceError::MissingPartitionField { field: "geographic_level", .. }
        ));
    }

    #[test]
    fn facility_statuses_get_their_own_tables_and_empty_ones_are_skipped() {
        let rows = vec![RawRecord::new().with("Power station name", "Bayswater")];
        let units = FacilityRegistryAdapter
            .plan_units(
                &config(SourceKind::FacilityRegistry, "cer"),
                &bundle(
                    SourceKind::FacilityRegistry,
                    vec![
                        partition("approved_power_stations", rows.clone()),
                        partition("committed_power_stations", Vec::new()),
                        partition("probable_power_stations", rows),
                    ],
                ),
            )
            .unwrap();
        let tables: Vec<&str> = units.iter().map(|u| u.table.as_str()).collect();
        assert_eq!(
            tables,
            vec!["cer_approved_power_stations", "cer_probable_power_stations"]
        );
    }

    #[test]
    fn annual_unified_layout_partitions_by_year_label() {
        let mut year = partition(
            "2022-23",
            vec![
                RawRecord::new().with("Facility name", "Loy Yang A"),
                RawRecord::new()
                    .with("Facility name", "Eraring")
                    .with("start_year", 2021i64),
            ],
        );
        year.start_year = Some(2022);
        year.stop_year = Some(2023);
        let mut cfg = config(SourceKind::AnnualReporting, "nger");
        cfg.table_layout = TableLayout::Unified;

        let units = AnnualReportingAdapter
            .plan_units(&cfg, &bundle(SourceKind::AnnualReporting, vec![year.clone()]))
            .unwrap();
        assert_eq!(units[0].table, "nger_unified");
        let part = units[0].partition.as_ref().unwrap();
        assert_eq!(part.column, "year_label");
        assert_eq!(part.value, CellValue::text("2022-23"));
        assert_eq!(units[0].records[0].get("start_year"), Some(&CellValue::Integer(2022)));
        assert_eq!(units[0].records[1].get("start_year"), Some(&CellValue::Integer(2021)));
        assert_eq!(units[0].records[1].get("stop_year"), Some(&CellValue::Integer(2023)));

        cfg.table_layout = TableLayout::PerPartition;
        let units = AnnualReportingAdapter
            .plan_units(&cfg, &bundle(SourceKind::AnnualReporting, vec![year]))
            .unwrap();
        assert_eq!(units[0].table, "nger_2022_23");
        assert!(units[0].partition.is_none());
    }

    #[test]
    fn bundle_must_match_the_registry_entry() {
        let err = FacilityRegistryAdapter
            .plan_units(
                &config(SourceKind::FacilityRegistry, "cer"),
                &bundle(SourceKind::AnnualReporting, Vec::new()),
            )
            .unwrap_err();
        assert!(matches!(err, SourceError::KindMismatch { .. }));

        let mut other = bundle(SourceKind::FacilityRegistry, Vec::new());
        other.source_id = "someone-else".into();
        let err = FacilityRegistryAdapter
            .plan_units(&config(SourceKind::FacilityRegistry, "cer"), &other)
            .unwrap_err();
        assert!(matches!(err, SourceError::SourceMismatch { .. }));
    }

    #[test]
    fn plan_source_reads_the_bundle_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = bundle(
            SourceKind::FacilityRegistry,
            vec![partition(
                "approved_power_stations",
                vec![RawRecord::new().with("State", "NSW")],
            )],
        );
        b.notes = Some("written by test".into());
        fs::write(dir.path().join("b.json"), serde_json::to_vec(&b).unwrap()).unwrap();

        let mut cfg = config(SourceKind::FacilityRegistry, "cer");
        cfg.bundle = PathBuf::from("b.json");
        let units = plan_source(dir.path(), &cfg).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].records[0].text("State").as_deref(), Some("NSW"));

        cfg.bundle = PathBuf::from("missing.json");
        assert!(matches!(plan_source(dir.path(), &cfg), Err(SourceError::Read { .. })));
    }
}
