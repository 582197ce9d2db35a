//! Durable snapshot of successful geocode resolutions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use gdi_core::{BoundingBox, GeocodeQuery, GeocodeResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub query: String,
    pub result: GeocodeResult,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub saved_at: DateTime<Utc>,
    pub entries: BTreeMap<String, SnapshotEntry>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("reading geocode snapshot {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("geocode snapshot is not valid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported geocode snapshot format_version {0}")]
    UnsupportedVersion(u64),
    #[error("writing geocode snapshot: {0:#}")]
    Write(#[source] anyhow::Error),
}

/// Flat result layout written by older tooling (`lat`/`lon`, `bbox_*`).
#[derive(Debug, Deserialize)]
struct LegacyResult {
    lat: f64,
    lon: f64,
    #[serde(default)]
    formatted_address: Option<String>,
    #[serde(default)]
    place_id: Option<String>,
    #[serde(default)]
    postcode: Option<String>,
    #[serde(default)]
    bbox_south: Option<f64>,
    #[serde(default)]
    bbox_north: Option<f64>,
    #[serde(default)]
    bbox_west: Option<f64>,
    #[serde(default)]
    bbox_east: Option<f64>,
}

impl From<LegacyResult> for GeocodeResult {
    fn from(legacy: LegacyResult) -> Self {
        let bbox = match (
            legacy.bbox_south,
            legacy.bbox_north,
            legacy.bbox_west,
            legacy.bbox_east,
        ) {
            (Some(south), Some(north), Some(west), Some(east)) => Some(BoundingBox {
                south,
                north,
                west,
                east,
            }),
            _ => None,
        };
        GeocodeResult {
            latitude: legacy.lat,
            longitude: legacy.lon,
            formatted_address: legacy.formatted_address.unwrap_or_default(),
            place_id: legacy.place_id.unwrap_or_default(),
            postcode: legacy.postcode.filter(|p| !p.trim().is_empty()),
            bbox,
            provenance: Default::default(),
        }
    }
}

fn decode_result(value: &Value) -> Option<GeocodeResult> {
    if value.is_null() {
        return None;
    }
    if value.get("latitude").is_some() {
        return serde_json::from_value(value.clone()).ok();
    }
    serde_json::from_value::<LegacyResult>(value.clone())
        .ok()
        .map(GeocodeResult::from)
}

fn decode_timestamp(value: Option<&Value>) -> DateTime<Utc> {
    match value {
        Some(Value::Number(n)) => n
            .as_f64()
            .and_then(|secs| DateTime::from_timestamp(secs.trunc() as i64, (secs.fract() * 1e9) as u32))
            .unwrap_or_else(Utc::now),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        _ => Utc::now(),
    }
}

/// Re-key a version-less map. Values are either `{query, result, cached_at}`
/// envelopes or bare results; null results were cached misses and are dropped.
fn migrate_legacy(map: serde_json::Map<String, Value>) -> BTreeMap<String, SnapshotEntry> {
    let mut entries = BTreeMap::new();
    for (key, value) in map {
        let (query, result, cached_at) = match value.get("result") {
            Some(result) => (
                value
                    .get("query")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| key.clone()),
                decode_result(result),
                decode_timestamp(value.get("cached_at")),
            ),
            None => (key.clone(), decode_result(&value), Utc::now()),
        };
        let Some(result) = result else {
            continue;
        };
        let normalized = GeocodeQuery::normalize(&query);
        if normalized.is_empty() {
            continue;
        }
        entries.insert(
            normalized,
            SnapshotEntry {
                query,
                result,
                cached_at,
            },
        );
    }
    entries
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<BTreeMap<String, SnapshotEntry>, SnapshotError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(map) = value else {
        return Err(SnapshotError::Parse(serde::de::Error::custom(
            "snapshot root must be an object",
        )));
    };
    match map.get("format_version").map(|v| v.as_u64()) {
        Some(Some(v)) if v == u64::from(SNAPSHOT_FORMAT_VERSION) => {
            let snapshot: Snapshot = serde_json::from_value(Value::Object(map))?;
            Ok(snapshot.entries)
        }
        Some(Some(v)) => Err(SnapshotError::UnsupportedVersion(v)),
        _ => Ok(migrate_legacy(map)),
    }
}

pub fn encode_snapshot(entries: &BTreeMap<String, SnapshotEntry>) -> Result<Vec<u8>, SnapshotError> {
    let snapshot = Snapshot {
        format_version: SNAPSHOT_FORMAT_VERSION,
        saved_at: Utc::now(),
        entries: entries.clone(),
    };
    Ok(serde_json::to_vec_pretty(&snapshot)?)
}

/// Load the snapshot at `path`. Missing files are empty; undecodable ones are
/// logged and treated as empty so a bad checkpoint never blocks a run.
pub async fn load_snapshot(path: &Path) -> Result<BTreeMap<String, SnapshotEntry>, SnapshotError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no geocode snapshot yet; starting empty");
            return Ok(BTreeMap::new());
        }
        Err(source) => {
            return Err(SnapshotError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    match decode_snapshot(&bytes) {
        Ok(entries) => {
            info!(path = %path.display(), entries = entries.len(), "geocode snapshot loaded");
            Ok(entries)
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "geocode snapshot unreadable; starting empty");
            Ok(BTreeMap::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_envelopes_are_migrated_and_misses_dropped() {
        let legacy = br#"{
          "5f2b1c": {
            "query": "Bayswater Power Station,  NSW, Australia",
            "result": {
              "lat": -32.3953, "lon": 150.9497,
              "formatted_address": "Bayswater NSW 2333, Australia",
              "place_id": "ChIJbayswater", "postcode": "2333",
              "bbox_south": -32.41, "bbox_north": -32.38,
              "bbox_west": 150.93, "bbox_east": 150.96
            },
            "cached_at": 1700000000.25,
            "cache_key": "5f2b1c"
          },
          "9a9a9a": {"query": "Nowhere", "result": null, "cached_at": 1700000000.0}
        }"#;
        let entries = decode_snapshot(legacy).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries["bayswater power station, nsw, australia"];
        assert_eq!(entry.result.postcode.as_deref(), Some("2333"));
        assert!(entry.result.bbox.is_some());
        assert_eq!(entry.cached_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn bare_result_maps_use_the_key_as_query() {
        let legacy = br#"{"Sydney NSW": {"lat": -33.8688, "lon": 151.2093}}"#;
        let entries = decode_snapshot(legacy).unwrap();
        assert_eq!(entries["sydney nsw"].result.latitude, -33.8688);
    }

    #[test]
    fn current_format_round_trips_and_newer_versions_are_refused() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "sydney".to_string(),
            SnapshotEntry {
                query: "Sydney".into(),
                result: GeocodeResult {
                    latitude: -33.8688,
                    longitude: 151.2093,
                    formatted_address: "Sydney NSW, Australia".into(),
                    place_id: "p1".into(),
                    postcode: None,
                    bbox: None,
                    provenance: Default::default(),
                },
                cached_at: Utc::now(),
            },
        );
        let bytes = encode_snapshot(&entries).unwrap();
        assert_eq!(decode_snapshot(&bytes).unwrap(), entries);

        let err = decode_snapshot(br#"{"format_version": 9, "entries": {}}"#).unwrap_err();
        assert!(matches!(err, SnapshotError::UnsupportedVersion(9)));
    }

    #[tokio::test]
    async fn corrupt_snapshot_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geocode_cache.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(load_snapshot(&path).await.unwrap().is_empty());
        assert!(load_snapshot(&dir.path().join("missing.json")).await.unwrap().is_empty());
    }
}
