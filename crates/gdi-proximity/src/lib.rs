//! Many-to-many great-circle proximity matching between two persisted point sets.

use std::collections::HashMap;
use std::f64::consts::PI;

use gdi_core::{CellValue, ColumnSpec, EntityPoint, GeoPoint, MatchType, ProximityMatch, SqlType, TableSchema};
use gdi_persist::{PersistError, PersistenceEngine};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, Instrument};

pub const CRATE_NAME: &str = "gdi-proximity";

/// Mean Earth radius (IUGG), metres.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

pub const DEFAULT_THRESHOLD_M: f64 = 1_000.0;

pub const MATCH_TABLE: &str = "proximity_matches";

pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();
    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub threshold_meters: f64,
    /// Only pair points whose group values are equal.
    pub require_same_group: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold_meters: DEFAULT_THRESHOLD_M,
            require_same_group: false,
        }
    }
}

impl MatchConfig {
    pub fn match_type(&self) -> MatchType {
        MatchType::for_threshold(self.threshold_meters)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchOutcome {
    pub matches: Vec<ProximityMatch>,
    /// Points without a usable position, per side.
    pub excluded_source: usize,
    pub excluded_target: usize,
    pub comparisons: u64,
}

fn usable(points: &[EntityPoint]) -> (Vec<(usize, GeoPoint)>, usize) {
    let mut kept = Vec::with_capacity(points.len());
    let mut excluded = 0;
    for (i, p) in points.iter().enumerate() {
        match p.position {
            Some(pos) if pos.is_valid() => kept.push((i, pos)),
            _ => excluded += 1,
        }
    }
    (kept, excluded)
}

fn same_group(a: &EntityPoint, b: &EntityPoint) -> bool {
    match (&a.group, &b.group) {
        (Some(x), Some(y)) => x.trim().eq_ignore_ascii_case(y.trim()),
        _ => false,
    }
}

fn pair(
    a: &EntityPoint,
    pa: GeoPoint,
    b: &EntityPoint,
    pb: GeoPoint,
    config: &MatchConfig,
    match_type: &MatchType,
) -> Option<ProximityMatch> {
    if config.require_same_group && !same_group(a, b) {
        return None;
    }
    let distance = haversine_meters(pa, pb);
    (distance <= config.threshold_meters).then(|| ProximityMatch {
        source_id: a.id,
        target_id: b.id,
        match_type: match_type.clone(),
        distance_meters: distance,
    })
}

/// Compare every pair. Matches are ordered by source position, then target position.
pub fn match_points(source: &[EntityPoint], target: &[EntityPoint], config: &MatchConfig) -> MatchOutcome {
    let (a_pts, excluded_source) = usable(source);
    let (b_pts, excluded_target) = usable(target);
    let match_type = config.match_type();
    let mut matches = Vec::new();
    let mut comparisons = 0u64;
    for &(ai, pa) in &a_pts {
        for &(bi, pb) in &b_pts {
            comparisons += 1;
            if let Some(m) = pair(&source[ai], pa, &target[bi], pb, config, &match_type) {
                matches.push(m);
            }
        }
    }
    MatchOutcome {
        matches,
        excluded_source,
        excluded_target,
        comparisons,
    }
}

/// Same result as `match_points`, comparing only points in neighbouring grid cells.
///
/// Cell height is the threshold as a latitude arc. Cell width is widened by
/// `pi / (2 cos(phi_max))` so any pair within the threshold lands in adjacent
/// cells at every latitude present in the inputs; longitude cells wrap at the
/// antimeridian. Inputs too close to a pole fall back to the full comparison.
pub fn match_points_grid(source: &[EntityPoint], target: &[EntityPoint], config: &MatchConfig) -> MatchOutcome {
    let (a_pts, excluded_source) = usable(source);
    let (b_pts, excluded_target) = usable(target);

    let lat_step = (config.threshold_meters / EARTH_RADIUS_M).to_degrees() * 1.0001;
    let phi_max = a_pts
        .iter()
        .chain(b_pts.iter())
        .map(|(_, p)| p.latitude.abs())
        .fold(0.0_f64, f64::max)
        .to_radians();
    let lon_step = lat_step * (PI / 2.0) / phi_max.cos() * 1.0001;
    if lat_step <= 0.0 || !lon_step.is_finite() || lon_step >= 90.0 {
        return match_points(source, target, config);
    }
    let lon_cells = (360.0 / lon_step).floor() as i64;

    let cell_of = |p: GeoPoint| -> (i64, i64) {
        let row = ((p.latitude + 90.0) / lat_step).floor() as i64;
        let col = (((p.longitude + 180.0) / lon_step).floor() as i64).clamp(0, lon_cells - 1);
        (row, col)
    };

    let mut grid: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
    for (slot, &(_, pb)) in b_pts.iter().enumerate() {
        grid.entry(cell_of(pb)).or_default().push(slot);
    }

    let match_type = config.match_type();
    let mut matches = Vec::new();
    let mut comparisons = 0u64;
    let mut candidates: Vec<usize> = Vec::new();
    for &(ai, pa) in &a_pts {
        let (row, col) = cell_of(pa);
        candidates.clear();
        for dr in -1..=1 {
            for dc in -1..=1 {
                let key = (row + dr, (col + dc).rem_euclid(lon_cells));
                if let Some(slots) = grid.get(&key) {
                    candidates.extend_from_slice(slots);
                }
            }
        }
        candidates.sort_unstable();
        for &slot in &candidates {
            let (bi, pb) = b_pts[slot];
            comparisons += 1;
            if let Some(m) = pair(&source[ai], pa, &target[bi], pb, config, &match_type) {
                matches.push(m);
            }
        }
    }

    MatchOutcome {
        matches,
        excluded_source,
        excluded_target,
        comparisons,
    }
}

pub fn match_table_schema() -> TableSchema {
    TableSchema::new(
        MATCH_TABLE,
        vec![
            ColumnSpec::nullable("source_table", SqlType::Text),
            ColumnSpec::nullable("source_id", SqlType::Integer),
            ColumnSpec::nullable("target_table", SqlType::Text),
            ColumnSpec::nullable("target_id", SqlType::Integer),
            ColumnSpec::nullable("match_type", SqlType::Text),
            ColumnSpec::nullable("distance_meters", SqlType::Numeric),
        ],
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityRequest {
    pub source_table: String,
    pub target_table: String,
    #[serde(flatten)]
    pub config: MatchConfig,
    /// Column holding the group value when `require_same_group` is set.
    #[serde(default)]
    pub group_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchReport {
    pub source_table: String,
    pub target_table: String,
    pub match_type: String,
    pub source_points: usize,
    pub target_points: usize,
    pub excluded_source: usize,
    pub excluded_target: usize,
    pub matches: usize,
    pub comparisons: u64,
}

/// Read `lat`/`lon` (and the group column) back from a persisted table.
pub async fn load_points(
    engine: &PersistenceEngine,
    table: &str,
    group_column: Option<&str>,
) -> Result<Vec<EntityPoint>, PersistError> {
    let mut columns = vec!["lat".to_string(), "lon".to_string()];
    if let Some(group) = group_column {
        columns.push(group.to_string());
    }
    let rows = engine.read_rows(table, &columns).await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let lat = row.values.first().and_then(CellValue::as_numeric);
            let lon = row.values.get(1).and_then(CellValue::as_numeric);
            EntityPoint {
                id: row.id,
                position: lat.zip(lon).map(|(lat, lon)| GeoPoint::new(lat, lon)),
                group: row.values.get(2).and_then(CellValue::render),
            }
        })
        .collect())
}

/// Recompute one match set and replace its rows in the match table.
pub async fn run_proximity(
    engine: &PersistenceEngine,
    request: &ProximityRequest,
) -> Result<MatchReport, PersistError> {
    let span = info_span!(
        "proximity",
        source = %request.source_table,
        target = %request.target_table
    );
    async {
        let group_column = request
            .group_column
            .as_deref()
            .filter(|_| request.config.require_same_group);
        let source = load_points(engine, &request.source_table, group_column).await?;
        let target = load_points(engine, &request.target_table, group_column).await?;
        let outcome = match_points_grid(&source, &target, &request.config);
        let match_type = request.config.match_type();

        let rows: Vec<Vec<CellValue>> = outcome
            .matches
            .iter()
            .map(|m| {
                vec![
                    CellValue::text(request.source_table.clone()),
                    CellValue::Integer(m.source_id),
                    CellValue::text(request.target_table.clone()),
                    CellValue::Integer(m.target_id),
                    CellValue::text(m.match_type.as_str()),
                    CellValue::Numeric(m.distance_meters),
                ]
            })
            .collect();
        let filter = vec![
            ("source_table".to_string(), CellValue::text(request.source_table.clone())),
            ("target_table".to_string(), CellValue::text(request.target_table.clone())),
            ("match_type".to_string(), CellValue::text(match_type.as_str())),
        ];
        engine
            .replace_rows(&match_table_schema(), &filter, &rows)
            .await?;

        let report = MatchReport {
            source_table: request.source_table.clone(),
            target_table: request.target_table.clone(),
            match_type: match_type.to_string(),
            source_points: source.len(),
            target_points: target.len(),
            excluded_source: outcome.excluded_source,
            excluded_target: outcome.excluded_target,
            matches: outcome.matches.len(),
            comparisons: outcome.comparisons,
        };
        info!(
            match_type = %report.match_type,
            matches = report.matches,
            excluded_source = report.excluded_source,
            excluded_target = report.excluded_target,
            "proximity matches replaced"
        );
        Ok(report)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use gdi_core::RawRecord;
    use gdi_persist::{MemoryStore, PersistConfig, TableStore};
    use gdi_schema::SynthesisOptions;

    fn point(id: i64, lat: f64, lon: f64) -> EntityPoint {
        EntityPoint {
            id,
            position: Some(GeoPoint::new(lat, lon)),
            group: None,
        }
    }

    /// Deterministic pseudo-random points around a centre, no external rng.
    fn scatter(seed: u64, n: usize, lat0: f64, lon0: f64, spread: f64) -> Vec<EntityPoint> {
        let mut state = seed;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 11) as f64) / ((1u64 << 53) as f64)
        };
        (0..n)
            .map(|i| point(i as i64 + 1, lat0 + (next() - 0.5) * spread, lon0 + (next() - 0.5) * spread))
            .collect()
    }

    #[test]
    fn sydney_pair_is_about_423_metres() {
        let d = haversine_meters(GeoPoint::new(-33.8688, 151.2093), GeoPoint::new(-33.8650, 151.2094));
        assert!((d - 423.0).abs() < 2.0, "distance was {d}");
    }

    #[test]
    fn threshold_decides_the_match() {
        let a = vec![point(1, -33.8688, 151.2093)];
        let b = vec![point(7, -33.8650, 151.2094)];

        let km = match_points(&a, &b, &MatchConfig::default());
        assert_eq!(km.matches.len(), 1);
        assert_eq!(km.matches[0].match_type.as_str(), "proximity_1km");
        assert_eq!((km.matches[0].source_id, km.matches[0].target_id), (1, 7));

        let tight = MatchConfig {
            threshold_meters: 100.0,
            ..Default::default()
        };
        assert!(match_points(&a, &b, &tight).matches.is_empty());
    }

    #[test]
    fn missing_positions_are_excluded_and_counted() {
        let mut a = vec![point(1, -33.8688, 151.2093)];
        a.push(EntityPoint {
            id: 2,
            position: None,
            group: None,
        });
        a.push(point(3, 123.0, 0.0));
        let b = vec![point(7, -33.8650, 151.2094)];
        let outcome = match_points(&a, &b, &MatchConfig::default());
        assert_eq!(outcome.excluded_source, 2);
        assert_eq!(outcome.excluded_target, 0);
        assert_eq!(outcome.matches.len(), 1);
    }

    #[test]
    fn group_constraint_filters_cross_group_pairs() {
        let mut a = point(1, -33.8688, 151.2093);
        a.group = Some("NSW".into());
        let mut b1 = point(7, -33.8650, 151.2094);
        b1.group = Some("nsw ".into());
        let mut b2 = point(8, -33.8651, 151.2094);
        b2.group = Some("VIC".into());
        let config = MatchConfig {
            require_same_group: true,
            ..Default::default()
        };
        let outcome = match_points(&[a], &[b1, b2], &config);
        let targets: Vec<i64> = outcome.matches.iter().map(|m| m.target_id).collect();
        assert_eq!(targets, vec![7]);
    }

    #[test]
    fn grid_matches_equal_naive_matches() {
        let a = scatter(7, 300, -33.87, 151.21, 0.2);
        let b = scatter(11, 300, -33.87, 151.21, 0.2);
        for threshold in [250.0, 1_000.0, 5_000.0] {
            let config = MatchConfig {
                threshold_meters: threshold,
                ..Default::default()
            };
            let naive = match_points(&a, &b, &config);
            let grid = match_points_grid(&a, &b, &config);
            assert!(!naive.matches.is_empty());
            assert_eq!(naive.matches, grid.matches, "threshold {threshold}");
            assert!(grid.comparisons <= naive.comparisons);
        }
    }

    #[test]
    fn grid_handles_the_antimeridian_and_high_latitudes() {
        let a = vec![point(1, -16.5, 179.999), point(2, 70.0, 20.0)];
        let b = vec![point(10, -16.5, -179.999), point(11, 70.001, 20.02)];
        let config = MatchConfig::default();
        assert_eq!(
            match_points(&a, &b, &config).matches,
            match_points_grid(&a, &b, &config).matches
        );
        assert_eq!(match_points_grid(&a, &b, &config).matches.len(), 2);

        let polar = vec![point(1, 89.9999, 0.0)];
        let polar_b = vec![point(2, 89.9999, 180.0)];
        assert_eq!(
            match_points(&polar, &polar_b, &config).matches,
            match_points_grid(&polar, &polar_b, &config).matches
        );
    }

    #[tokio::test]
    async fn run_replaces_the_match_set_for_its_type() {
        let store = Arc::new(MemoryStore::new());
        let engine = PersistenceEngine::new(store.clone(), PersistConfig::default());

        let stations = vec![
            RawRecord::new().with("name", "A").with("lat", -33.8688).with("lon", 151.2093),
            RawRecord::new().with("name", "B").with("lat", CellValue::Null).with("lon", CellValue::Null),
        ];
        let facilities = vec![
            RawRecord::new().with("facility", "X").with("lat", -33.8650).with("lon", 151.2094),
            RawRecord::new().with("facility", "Y").with("lat", -37.8136).with("lon", 144.9631),
        ];
        let options = SynthesisOptions::default();
        engine.ingest("stations", &stations, &options).await.unwrap();
        engine.ingest("facilities", &facilities, &options).await.unwrap();

        let request = ProximityRequest {
            source_table: "stations".into(),
            target_table: "facilities".into(),
            config: MatchConfig::default(),
            group_column: None,
        };
        let first = run_proximity(&engine, &request).await.unwrap();
        assert_eq!(first.matches, 1);
        assert_eq!(first.excluded_source, 1);
        let second = run_proximity(&engine, &request).await.unwrap();
        assert_eq!(second.matches, 1);
        assert_eq!(store.row_count(MATCH_TABLE).await.unwrap(), 1);

        let wide = ProximityRequest {
            config: MatchConfig {
                threshold_meters: 1_000_000.0,
                ..Default::default()
            },
            ..request.clone()
        };
        run_proximity(&engine, &wide).await.unwrap();
        assert_eq!(store.row_count(MATCH_TABLE).await.unwrap(), 3);

        let fractional = ProximityRequest {
            config: MatchConfig {
                threshold_meters: 1000.4,
                ..Default::default()
            },
            ..request.clone()
        };
        let report = run_proximity(&engine, &fractional).await.unwrap();
        assert_eq!(report.match_type, "proximity_1000.4m");
        assert_eq!(store.row_count(MATCH_TABLE).await.unwrap(), 4);
    }
}
