use gdi_core::{CellValue, ColumnSpec, RawRecord, SqlType};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::GeocodeService;

/// Columns written onto every enriched record, null on a miss.
pub const GEOCODE_COLUMNS: &[(&str, SqlType)] = &[
    ("lat", SqlType::Numeric),
    ("lon", SqlType::Numeric),
    ("formatted_address", SqlType::Text),
    ("place_id", SqlType::Text),
    ("postcode", SqlType::Text),
    ("bbox_south", SqlType::Numeric),
    ("bbox_north", SqlType::Numeric),
    ("bbox_west", SqlType::Numeric),
    ("bbox_east", SqlType::Numeric),
];

const INVALID_TOKENS: &[&str] = &["n/a", "nan", "none"];

/// Declared types for the enrichment columns, so they survive an all-miss batch.
pub fn geocode_columns() -> Vec<ColumnSpec> {
    GEOCODE_COLUMNS
        .iter()
        .map(|(name, sql_type)| ColumnSpec::nullable(*name, *sql_type))
        .collect()
}

/// How to build ordered query candidates from a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Each group names record fields; it yields a candidate only when every field has a value.
    pub groups: Vec<Vec<String>>,
    /// Appended as the last component of every candidate, e.g. `Australia`.
    #[serde(default)]
    pub suffix: Option<String>,
}

impl QueryPlan {
    pub fn candidates(&self, record: &RawRecord) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for group in &self.groups {
            let parts: Option<Vec<String>> = group
                .iter()
                .map(|field| record.text(field).filter(|v| !v.is_empty()))
                .collect();
            let Some(mut parts) = parts else {
                continue;
            };
            if parts.is_empty() {
                continue;
            }
            if let Some(suffix) = &self.suffix {
                parts.push(suffix.clone());
            }
            let candidate = parts.join(", ");
            if has_invalid_token(&candidate) || out.contains(&candidate) {
                continue;
            }
            out.push(candidate);
        }
        out
    }
}

fn has_invalid_token(candidate: &str) -> bool {
    candidate
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .any(|token| {
            INVALID_TOKENS
                .iter()
                .any(|invalid| token.eq_ignore_ascii_case(invalid))
        })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichSummary {
    pub records: usize,
    pub located: usize,
    pub missed: usize,
}

/// Resolve each record's candidates and append the geocode columns.
pub async fn enrich_records(
    service: &GeocodeService,
    plan: &QueryPlan,
    records: Vec<RawRecord>,
) -> (Vec<RawRecord>, EnrichSummary) {
    let mut summary = EnrichSummary {
        records: records.len(),
        ..Default::default()
    };
    let mut out = Vec::with_capacity(records.len());
    for mut record in records {
        let candidates = plan.candidates(&record);
        let result = service.geocode_first(&candidates).await;
        match &result {
            Some(hit) => {
                summary.located += 1;
                record.insert("lat", hit.latitude);
                record.insert("lon", hit.longitude);
                record.insert("formatted_address", hit.formatted_address.clone());
                record.insert("place_id", hit.place_id.clone());
                record.insert("postcode", hit.postcode.clone());
                record.insert("bbox_south", hit.bbox.map(|b| b.south));
                record.insert("bbox_north", hit.bbox.map(|b| b.north));
                record.insert("bbox_west", hit.bbox.map(|b| b.west));
                record.insert("bbox_east", hit.bbox.map(|b| b.east));
            }
            None => {
                summary.missed += 1;
                debug!(candidates = candidates.len(), "geocode miss for record");
                for (name, _) in GEOCODE_COLUMNS {
                    record.insert(*name, CellValue::Null);
                }
            }
        }
        out.push(record);
    }
    (out, summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> QueryPlan {
        QueryPlan {
            groups: vec![
                vec!["Power station name".into(), "Postcode".into(), "State".into()],
                vec!["Power station name".into(), "State".into()],
                vec!["State".into()],
            ],
            suffix: Some("Australia".into()),
        }
    }

    #[test]
    fn groups_with_missing_fields_are_skipped() {
        let record = RawRecord::new()
            .with("Power station name", "Bayswater")
            .with("State", "NSW")
            .with("Postcode", "-");
        assert_eq!(
            plan().candidates(&record),
            vec!["Bayswater, NSW, Australia", "NSW, Australia"]
        );
    }

    #[test]
    fn invalid_tokens_and_duplicates_are_dropped() {
        let record = RawRecord::new()
            .with("Power station name", "Unit nan")
            .with("State", "NSW")
            .with("Postcode", CellValue::Integer(2333));
        let mut p = plan();
        p.groups.push(vec!["State".into()]);
        assert_eq!(p.candidates(&record), vec!["NSW, Australia"]);

        // Tokens are matched whole, so place names containing them survive.
        let nanango = RawRecord::new().with("State", "Nanango");
        assert_eq!(plan().candidates(&nanango), vec!["Nanango, Australia"]);
    }

    #[test]
    fn pinned_geocode_columns_are_typed() {
        let cols = geocode_columns();
        assert_eq!(cols.len(), 9);
        assert_eq!(cols[0].name, "lat");
        assert_eq!(cols[0].sql_type, SqlType::Numeric);
        assert_eq!(cols[4].sql_type, SqlType::Text);
    }
}
