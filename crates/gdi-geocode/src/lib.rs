//! Rate-limited, dual-layer geocoding cache.

mod plan;
mod provider;
mod snapshot;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use gdi_core::{GeocodeQuery, GeocodeResult, Provenance};
use gdi_storage::{replace_file_atomically, GateError, RateGate, RateGateConfig, ReplacedFile};
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};

pub use plan::{enrich_records, geocode_columns, EnrichSummary, QueryPlan, GEOCODE_COLUMNS};
pub use provider::{
    parse_google_response, GeocodeError, GeocodeProvider, GoogleGeocoder, GoogleGeocoderConfig,
    StaticProvider, GOOGLE_GEOCODE_ENDPOINT,
};
pub use snapshot::{
    decode_snapshot, encode_snapshot, load_snapshot, Snapshot, SnapshotEntry, SnapshotError,
    SNAPSHOT_FORMAT_VERSION,
};

pub const CRATE_NAME: &str = "gdi-geocode";

#[derive(Debug, Clone)]
pub struct GeocodeConfig {
    pub snapshot_path: PathBuf,
    pub gate: RateGateConfig,
    /// Extra live attempts after a retryable failure. Each one passes the gate again.
    pub max_retries: usize,
}

pub const DEFAULT_LIVE_RETRIES: usize = 2;

impl GeocodeConfig {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
            gate: RateGateConfig::default(),
            max_retries: DEFAULT_LIVE_RETRIES,
        }
    }
}

#[derive(Debug, Clone)]
enum Resolution {
    Hit(GeocodeResult),
    Miss,
}

#[derive(Debug, Default)]
struct Counters {
    queries: AtomicU64,
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    inflight_waits: AtomicU64,
    live_calls: AtomicU64,
    misses: AtomicU64,
    quota_skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GeocodeStats {
    pub queries: u64,
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub inflight_waits: u64,
    pub live_calls: u64,
    pub misses: u64,
    pub quota_skipped: u64,
    pub cached_entries: u64,
}

#[derive(Debug, Clone)]
pub struct SaveReport {
    pub entries: usize,
    pub file: ReplacedFile,
}

type MemoryLayer = HashMap<String, Arc<OnceCell<Resolution>>>;

/// The one geocoding entry point for a process.
///
/// Lookups go memory, then the loaded snapshot, then a live call through the
/// shared rate gate. Concurrent callers for the same key share one in-flight
/// resolution. Successful live results are staged in the persistent layer and
/// reach disk only on `save`.
pub struct GeocodeService {
    provider: Arc<dyn GeocodeProvider>,
    gate: RateGate,
    max_retries: usize,
    snapshot_path: PathBuf,
    memory: RwLock<MemoryLayer>,
    persistent: RwLock<BTreeMap<String, SnapshotEntry>>,
    save_lock: Mutex<()>,
    counters: Counters,
}

impl GeocodeService {
    /// Build the service and load the snapshot once.
    pub async fn open(
        provider: Arc<dyn GeocodeProvider>,
        config: GeocodeConfig,
    ) -> Result<Self, SnapshotError> {
        let entries = load_snapshot(&config.snapshot_path).await?;
        Ok(Self {
            provider,
            gate: RateGate::new(config.gate),
            max_retries: config.max_retries,
            snapshot_path: config.snapshot_path,
            memory: RwLock::new(HashMap::new()),
            persistent: RwLock::new(entries),
            save_lock: Mutex::new(()),
            counters: Counters::default(),
        })
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub async fn geocode(&self, raw: &str) -> Option<GeocodeResult> {
        let query = GeocodeQuery::new(raw);
        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        if query.key.is_empty() {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let cell = self.cell_for(&query.key).await;
        let result = if let Some(resolution) = cell.get() {
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            debug!(query = %query.key, "geocode memory hit");
            into_result(resolution, Some(Provenance::Cache))
        } else {
            let mut resolved_here = false;
            let flag = &mut resolved_here;
            let q = &query;
            let resolution = cell
                .get_or_init(|| async move {
                    *flag = true;
                    self.resolve(q).await
                })
                .await;
            if resolved_here {
                into_result(resolution, None)
            } else {
                self.counters.inflight_waits.fetch_add(1, Ordering::Relaxed);
                into_result(resolution, Some(Provenance::Cache))
            }
        };

        if result.is_none() {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Try candidates in order and stop at the first hit.
    pub async fn geocode_first<S: AsRef<str>>(&self, candidates: &[S]) -> Option<GeocodeResult> {
        for candidate in candidates {
            if let Some(hit) = self.geocode(candidate.as_ref()).await {
                return Some(hit);
            }
        }
        None
    }

    async fn cell_for(&self, key: &str) -> Arc<OnceCell<Resolution>> {
        if let Some(cell) = self.memory.read().await.get(key) {
            return cell.clone();
        }
        self.memory
            .write()
            .await
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    async fn resolve(&self, query: &GeocodeQuery) -> Resolution {
        if let Some(entry) = self.persistent.read().await.get(&query.key) {
            self.counters.persistent_hits.fetch_add(1, Ordering::Relaxed);
            debug!(query = %query.key, "geocode persistent hit");
            return Resolution::Hit(entry.result.clone().with_provenance(Provenance::Cache));
        }

        let mut attempt = 0usize;
        loop {
            if let Err(GateError::QuotaExhausted { limit, date }) = self.gate.acquire().await {
                self.counters.quota_skipped.fetch_add(1, Ordering::Relaxed);
                warn!(query = %query.key, limit, %date, "geocode quota exhausted; skipping live lookup");
                return Resolution::Miss;
            }

            self.counters.live_calls.fetch_add(1, Ordering::Relaxed);
            let span = info_span!(
                "geocode_live",
                provider = self.provider.name(),
                query = %query.key,
                attempt
            );
            match self.provider.lookup(query).instrument(span).await {
                Ok(Some(result)) if result.point().is_valid() => {
                    info!(query = %query.key, address = %result.formatted_address, "geocoded");
                    self.persistent.write().await.insert(
                        query.key.clone(),
                        SnapshotEntry {
                            query: query.raw.trim().to_string(),
                            result: result.clone().with_provenance(Provenance::Cache),
                            cached_at: Utc::now(),
                        },
                    );
                    return Resolution::Hit(result.with_provenance(Provenance::Live));
                }
                Ok(Some(result)) => {
                    warn!(
                        query = %query.key,
                        lat = result.latitude,
                        lon = result.longitude,
                        "geocode result out of range; treating as miss"
                    );
                    return Resolution::Miss;
                }
                Ok(None) => {
                    debug!(query = %query.key, "geocode returned no results");
                    return Resolution::Miss;
                }
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(query = %query.key, error = %err, attempt, "geocode lookup failed; retrying");
                }
                Err(err) => {
                    warn!(query = %query.key, error = %err, "geocode lookup failed");
                    return Resolution::Miss;
                }
            }
        }
    }

    /// Write the persistent layer as a full replacement snapshot. Saves are serialized.
    pub async fn save(&self) -> Result<SaveReport, SnapshotError> {
        let _guard = self.save_lock.lock().await;
        let entries = self.persistent.read().await.clone();
        let bytes = encode_snapshot(&entries)?;
        let file = replace_file_atomically(&self.snapshot_path, &bytes)
            .await
            .map_err(SnapshotError::Write)?;
        info!(
            path = %file.path.display(),
            entries = entries.len(),
            bytes = file.byte_size,
            "geocode snapshot saved"
        );
        Ok(SaveReport {
            entries: entries.len(),
            file,
        })
    }

    pub async fn cached_entries(&self) -> usize {
        self.persistent.read().await.len()
    }

    pub async fn stats(&self) -> GeocodeStats {
        let c = &self.counters;
        GeocodeStats {
            queries: c.queries.load(Ordering::Relaxed),
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            persistent_hits: c.persistent_hits.load(Ordering::Relaxed),
            inflight_waits: c.inflight_waits.load(Ordering::Relaxed),
            live_calls: c.live_calls.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            quota_skipped: c.quota_skipped.load(Ordering::Relaxed),
            cached_entries: self.cached_entries().await as u64,
        }
    }
}

fn into_result(resolution: &Resolution, provenance: Option<Provenance>) -> Option<GeocodeResult> {
    match resolution {
        Resolution::Hit(result) => Some(match provenance {
            Some(p) => result.clone().with_provenance(p),
            None => result.clone(),
        }),
        Resolution::Miss => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sydney() -> GeocodeResult {
        GeocodeResult {
            latitude: -33.8688,
            longitude: 151.2093,
            formatted_address: "Sydney NSW, Australia".into(),
            place_id: "ChIJsydney".into(),
            postcode: Some("2000".into()),
            bbox: None,
            provenance: Provenance::Live,
        }
    }

    fn fast_gate() -> RateGateConfig {
        RateGateConfig {
            min_interval: Duration::from_millis(1100),
            daily_limit: None,
        }
    }

    async fn service(provider: Arc<StaticProvider>, path: &Path) -> GeocodeService {
        let config = GeocodeConfig {
            snapshot_path: path.to_path_buf(),
            gate: fast_gate(),
            max_retries: DEFAULT_LIVE_RETRIES,
        };
        GeocodeService::open(provider, config).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn same_normalized_query_makes_one_live_call() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StaticProvider::new().with_entry("Sydney NSW", sydney()));
        let svc = service(provider.clone(), &dir.path().join("cache.json")).await;

        let first = svc.geocode("Sydney NSW").await.unwrap();
        assert_eq!(first.provenance, Provenance::Live);
        let second = svc.geocode("  sydney   nsw ").await.unwrap();
        assert_eq!(second.provenance, Provenance::Cache);
        assert_eq!(provider.calls(), 1);

        let stats = svc.stats().await;
        assert_eq!(stats.live_calls, 1);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.cached_entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_in_flight_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            StaticProvider::new()
                .with_entry("Sydney NSW", sydney())
                .with_delay(Duration::from_millis(200)),
        );
        let svc = Arc::new(service(provider.clone(), &dir.path().join("cache.json")).await);

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let svc = svc.clone();
            set.spawn(async move { svc.geocode("SYDNEY NSW").await });
        }
        while let Some(joined) = set.join_next().await {
            assert!(joined.unwrap().is_some());
        }
        assert_eq!(provider.calls(), 1);
        let stats = svc.stats().await;
        assert_eq!(stats.queries, 8);
        assert_eq!(stats.live_calls, 1);
        assert_eq!(stats.memory_hits + stats.inflight_waits, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn reloaded_snapshot_needs_no_live_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let provider = Arc::new(StaticProvider::new().with_entry("Sydney NSW", sydney()));
        let svc = service(provider.clone(), &path).await;
        svc.geocode("Sydney NSW").await.unwrap();
        let report = svc.save().await.unwrap();
        assert_eq!(report.entries, 1);
        drop(svc);

        let restarted = Arc::new(StaticProvider::new().with_entry("Sydney NSW", sydney()));
        let svc = service(restarted.clone(), &path).await;
        let hit = svc.geocode("sydney nsw").await.unwrap();
        assert_eq!(hit.provenance, Provenance::Cache);
        assert_eq!(hit.postcode.as_deref(), Some("2000"));
        assert_eq!(restarted.calls(), 0);
        assert_eq!(svc.stats().await.persistent_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn misses_are_memoized_but_never_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let provider = Arc::new(StaticProvider::new().with_failure("Broken Hill", "timeout"));
        let svc = service(provider.clone(), &path).await;

        assert!(svc.geocode("Nowhere Special").await.is_none());
        assert!(svc.geocode("Nowhere Special").await.is_none());
        assert!(svc.geocode("Broken Hill").await.is_none());
        assert_eq!(provider.calls(), 2);
        assert_eq!(svc.stats().await.misses, 3);

        svc.save().await.unwrap();
        let bytes = tokio::fs::read(&path).await.unwrap();
        assert!(decode_snapshot(&bytes).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_gate_spaces_live_calls_only() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            StaticProvider::new()
                .with_entry("a", sydney())
                .with_entry("b", sydney())
                .with_entry("c", sydney()),
        );
        let svc = service(provider.clone(), &dir.path().join("cache.json")).await;

        let start = tokio::time::Instant::now();
        for q in ["a", "b", "c"] {
            svc.geocode(q).await.unwrap();
        }
        let live_elapsed = start.elapsed();
        assert!(live_elapsed >= Duration::from_millis(2200));

        let cached_start = tokio::time::Instant::now();
        for q in ["a", "b", "c", "a"] {
            svc.geocode(q).await.unwrap();
        }
        assert!(cached_start.elapsed() < Duration::from_millis(1100));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_quota_is_a_counted_miss() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            StaticProvider::new()
                .with_entry("a", sydney())
                .with_entry("b", sydney()),
        );
        let config = GeocodeConfig {
            snapshot_path: dir.path().join("cache.json"),
            gate: RateGateConfig {
                min_interval: Duration::ZERO,
                daily_limit: Some(1),
            },
            max_retries: DEFAULT_LIVE_RETRIES,
        };
        let svc = GeocodeService::open(provider.clone(), config).await.unwrap();
        assert!(svc.geocode("a").await.is_some());
        assert!(svc.geocode("b").await.is_none());
        assert_eq!(provider.calls(), 1);
        assert_eq!(svc.stats().await.quota_skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn every_retry_passes_the_rate_gate() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            StaticProvider::new()
                .with_entry("Bayswater NSW", sydney())
                .with_transient_failures("Bayswater NSW", 2),
        );
        let svc = service(provider.clone(), &dir.path().join("cache.json")).await;

        let start = tokio::time::Instant::now();
        let hit = svc.geocode("Bayswater NSW").await;
        assert!(hit.is_some());
        assert_eq!(provider.calls(), 3);
        assert_eq!(svc.gate.used_today().await, 3);
        assert_eq!(svc.stats().await.live_calls, 3);
        assert!(start.elapsed() >= Duration::from_millis(2200));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_the_limit_and_count_against_quota() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            StaticProvider::new()
                .with_entry("Bayswater NSW", sydney())
                .with_transient_failures("Bayswater NSW", 10),
        );
        let svc = service(provider.clone(), &dir.path().join("cache.json")).await;

        assert!(svc.geocode("Bayswater NSW").await.is_none());
        assert_eq!(provider.calls(), DEFAULT_LIVE_RETRIES + 1);
        assert_eq!(svc.gate.used_today().await as usize, DEFAULT_LIVE_RETRIES + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_candidate_hit_wins() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(StaticProvider::new().with_entry("NSW, Australia", sydney()));
        let svc = service(provider.clone(), &dir.path().join("cache.json")).await;
        let hit = svc
            .geocode_first(&["Bayswater, NSW, Australia", "NSW, Australia", "Australia"])
            .await;
        assert!(hit.is_some());
        assert_eq!(provider.calls(), 2);
    }
}
