//! Core data model shared by the GDI ingestion crates.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const CRATE_NAME: &str = "gdi-core";

/// Text values collaborators use to mean "no value".
pub const MISSING_VALUE_INDICATORS: &[&str] = &["", "-", "nan", "none", "null", "n/a"];

pub fn is_missing_text(value: &str) -> bool {
    let trimmed = value.trim();
    MISSING_VALUE_INDICATORS
        .iter()
        .any(|indicator| trimmed.eq_ignore_ascii_case(indicator))
}

/// A single scalar carried by a raw or normalized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Numeric(f64),
    Text(String),
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Numeric(v) => !v.is_finite(),
            Self::Text(s) => is_missing_text(s),
            Self::Boolean(_) | Self::Integer(_) => false,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        if self.is_null() {
            return None;
        }
        match self {
            Self::Integer(v) => Some(*v),
            Self::Text(s) => strip_number_formatting(s).parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn as_numeric(&self) -> Option<f64> {
        if self.is_null() {
            return None;
        }
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Numeric(v) => Some(*v),
            Self::Text(s) => strip_number_formatting(s)
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite()),
            _ => None,
        }
    }

    /// Text rendering used when a value lands in a TEXT column.
    pub fn render(&self) -> Option<String> {
        if self.is_null() {
            return None;
        }
        match self {
            Self::Null => None,
            Self::Boolean(v) => Some(v.to_string()),
            Self::Integer(v) => Some(v.to_string()),
            Self::Numeric(v) => Some(v.to_string()),
            Self::Text(s) => Some(s.trim().to_string()),
        }
    }

    /// Convert into the representation stored in a column of `sql_type`.
    /// Values that cannot be represented become null.
    pub fn coerce_to(&self, sql_type: SqlType) -> CellValue {
        match sql_type {
            SqlType::Integer => self.as_integer().map(CellValue::Integer),
            SqlType::Numeric => self.as_numeric().map(CellValue::Numeric),
            SqlType::Text => self.render().map(CellValue::Text),
        }
        .unwrap_or(CellValue::Null)
    }
}

fn strip_number_formatting(raw: &str) -> String {
    raw.trim().chars().filter(|c| *c != ',').collect()
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Numeric(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(CellValue::Null)
    }
}

/// Source-provided row as field -> value pairs, in the order the source emitted them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawRecord {
    fields: Vec<(String, CellValue)>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a field, keeping the original position on replace.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<CellValue>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&CellValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Non-missing text rendering of a field.
    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key).and_then(CellValue::render)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<CellValue>> FromIterator<(K, V)> for RawRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = RawRecord::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

impl Serialize for RawRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RawRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = RawRecord;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object of scalar fields")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<RawRecord, A::Error> {
                let mut record = RawRecord::new();
                while let Some((key, value)) = access.next_entry::<String, CellValue>()? {
                    record.insert(key, value);
                }
                Ok(record)
            }
        }

        deserializer.deserialize_map(RecordVisitor)
    }
}

/// Column types the schema synthesizer infers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SqlType {
    Integer,
    Numeric,
    Text,
}

impl SqlType {
    /// PostgreSQL DDL spelling. INTEGER maps to BIGINT so i64 values always fit.
    pub fn ddl(&self) -> &'static str {
        match self {
            SqlType::Integer => "BIGINT",
            SqlType::Numeric => "NUMERIC",
            SqlType::Text => "TEXT",
        }
    }

    /// Map an `information_schema.columns.data_type` value back to a synthesized type.
    pub fn from_catalog(data_type: &str) -> Self {
        match data_type.to_ascii_lowercase().as_str() {
            "bigint" | "integer" | "smallint" => SqlType::Integer,
            "numeric" | "double precision" | "real" | "decimal" => SqlType::Numeric,
            _ => SqlType::Text,
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SqlType::Integer => "INTEGER",
            SqlType::Numeric => "NUMERIC",
            SqlType::Text => "TEXT",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn nullable(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: true,
        }
    }
}

/// Ordered column definitions describing a persisted table's current shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub dedup_key: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name: name.into(),
            columns,
            dedup_key: Vec::new(),
        }
    }

    pub fn with_dedup_key(mut self, key: Vec<String>) -> Self {
        self.dedup_key = key;
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Discriminator written as a constant column on every row of a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub column: String,
    pub value: CellValue,
}

impl Partition {
    pub fn geographic_level(level: i64) -> Self {
        Self {
            column: "geographic_level".to_string(),
            value: CellValue::Integer(level),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub south: f64,
    pub north: f64,
    pub west: f64,
    pub east: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    #[default]
    Cache,
    Live,
}

/// Normalized free-text location query; `key` is what the cache is indexed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GeocodeQuery {
    pub raw: String,
    pub key: String,
}

impl GeocodeQuery {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let key = Self::normalize(&raw);
        Self { raw, key }
    }

    pub fn normalize(raw: &str) -> String {
        raw.split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub latitude: f64,
    pub longitude: f64,
    pub formatted_address: String,
    pub place_id: String,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
    #[serde(skip, default)]
    pub provenance: Provenance,
}

impl GeocodeResult {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }
}

/// Fixed label encoding the distance threshold a match set was computed with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchType(String);

impl MatchType {
    /// Whole meters read as `proximity_1km` or `proximity_250m`. Fractional
    /// thresholds keep their exact value so distinct thresholds never share a label.
    pub fn for_threshold(meters: f64) -> Self {
        if meters.fract() != 0.0 || !meters.is_finite() || meters < 0.0 {
            return Self(format!("proximity_{meters}m"));
        }
        let whole = meters as u64;
        if whole >= 1000 && whole % 1000 == 0 {
            Self(format!("proximity_{}km", whole / 1000))
        } else {
            Self(format!("proximity_{whole}m"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An entity read back from a persisted table for proximity matching.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityPoint {
    pub id: i64,
    pub position: Option<GeoPoint>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityMatch {
    pub source_id: i64,
    pub target_id: i64,
    pub match_type: MatchType,
    pub distance_meters: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_indicators_are_null() {
        for raw in ["", " - ", "NaN", "None", "NULL", "n/a", "N/A"] {
            assert!(CellValue::text(raw).is_null(), "{raw:?} should be null");
        }
        assert!(!CellValue::text("0").is_null());
        assert!(!CellValue::Integer(0).is_null());
    }

    #[test]
    fn text_numbers_parse_with_thousands_separators() {
        assert_eq!(CellValue::text(" 1,234 ").as_integer(), Some(1234));
        assert_eq!(CellValue::text("12.5").as_integer(), None);
        assert_eq!(CellValue::text("12.5").as_numeric(), Some(12.5));
        assert_eq!(CellValue::text("inf").as_numeric(), None);
        assert_eq!(CellValue::Integer(7).as_numeric(), Some(7.0));
    }

    #[test]
    fn coercion_to_text_renders_scalars() {
        assert_eq!(
            CellValue::Integer(42).coerce_to(SqlType::Text),
            CellValue::text("42")
        );
        assert_eq!(
            CellValue::text("abc").coerce_to(SqlType::Integer),
            CellValue::Null
        );
        assert_eq!(
            CellValue::Boolean(true).coerce_to(SqlType::Text),
            CellValue::text("true")
        );
    }

    #[test]
    fn raw_record_keeps_source_field_order() {
        let record: RawRecord =
            serde_json::from_str(r#"{"zeta": 1, "alpha": "x", "mid": null, "f": 2.5}"#).unwrap();
        let keys = record.keys().collect::<Vec<_>>();
        assert_eq!(keys, vec!["zeta", "alpha", "mid", "f"]);
        assert_eq!(record.get("zeta"), Some(&CellValue::Integer(1)));
        assert_eq!(record.get("f"), Some(&CellValue::Numeric(2.5)));
        assert_eq!(record.get("mid"), Some(&CellValue::Null));
    }

    #[test]
    fn geocode_query_normalization_collapses_whitespace() {
        let q = GeocodeQuery::new("  Bayswater   Power Station,\tNSW  ");
        assert_eq!(q.key, "bayswater power station, nsw");
        assert_eq!(q.raw, "  Bayswater   Power Station,\tNSW  ");
    }

    #[test]
    fn match_type_labels_encode_threshold() {
        assert_eq!(MatchType::for_threshold(1000.0).as_str(), "proximity_1km");
        assert_eq!(MatchType::for_threshold(5000.0).as_str(), "proximity_5km");
        assert_eq!(MatchType::for_threshold(100.0).as_str(), "proximity_100m");
        assert_eq!(MatchType::for_threshold(1500.0).as_str(), "proximity_1500m");
        assert_eq!(MatchType::for_threshold(100.4).as_str(), "proximity_100.4m");
        assert_ne!(MatchType::for_threshold(100.4), MatchType::for_threshold(100.0));
        assert_ne!(MatchType::for_threshold(999.5), MatchType::for_threshold(1000.0));
    }

    #[test]
    fn catalog_types_map_back() {
        assert_eq!(SqlType::from_catalog("bigint"), SqlType::Integer);
        assert_eq!(SqlType::from_catalog("numeric"), SqlType::Numeric);
        assert_eq!(SqlType::from_catalog("character varying"), SqlType::Text);
    }
}
