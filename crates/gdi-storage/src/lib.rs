//! Durable file replacement, rate gating, and HTTP fetch utilities for GDI.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gdi-storage";

#[derive(Debug, Clone)]
pub struct ReplacedFile {
    pub path: PathBuf,
    pub byte_size: usize,
    pub replaced_at: DateTime<Utc>,
}

/// Replace `path` with `bytes` using a sibling temp file and an atomic rename.
/// Readers see either the previous contents or the new contents, never a mix.
pub async fn replace_file_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<ReplacedFile> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "snapshot".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let write_result = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
        anyhow::Ok(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    match fs::rename(&temp_path, path).await {
        Ok(()) => {
            sync_dir(parent).await?;
            Ok(ReplacedFile {
                path: path.to_path_buf(),
                byte_size: bytes.len(),
                replaced_at: Utc::now(),
            })
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

/// Flush the directory entry so a completed rename survives a crash.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> anyhow::Result<()> {
    let handle = fs::File::open(dir)
        .await
        .with_context(|| format!("opening directory {}", dir.display()))?;
    handle
        .sync_all()
        .await
        .with_context(|| format!("syncing directory {}", dir.display()))
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> anyhow::Result<()> {
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct RateGateConfig {
    pub min_interval: Duration,
    pub daily_limit: Option<u32>,
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1100),
            daily_limit: Some(10_000),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("daily quota of {limit} calls exhausted for {date}")]
    QuotaExhausted { limit: u32, date: NaiveDate },
}

#[derive(Debug)]
struct GateState {
    last_pass: Option<Instant>,
    quota_date: NaiveDate,
    used_today: u32,
}

/// Shared time gate: at most one pass per `min_interval`, across every caller.
///
/// The lock is held while sleeping so waiters queue up in arrival order and
/// each one gets its own slot.
#[derive(Debug)]
pub struct RateGate {
    config: RateGateConfig,
    state: Mutex<GateState>,
}

impl RateGate {
    pub fn new(config: RateGateConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GateState {
                last_pass: None,
                quota_date: Utc::now().date_naive(),
                used_today: 0,
            }),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.config.min_interval
    }

    pub async fn acquire(&self) -> Result<(), GateError> {
        let mut state = self.state.lock().await;

        let today = Utc::now().date_naive();
        if today != state.quota_date {
            state.quota_date = today;
            state.used_today = 0;
        }
        if let Some(limit) = self.config.daily_limit {
            if state.used_today >= limit {
                return Err(GateError::QuotaExhausted { limit, date: today });
            }
        }

        if let Some(last) = state.last_pass {
            let ready_at = last + self.config.min_interval;
            let now = Instant::now();
            if ready_at > now {
                let wait = ready_at - now;
                debug!(wait_ms = wait.as_millis() as u64, "rate gate waiting");
                tokio::time::sleep(wait).await;
            }
        }

        state.last_pass = Some(Instant::now());
        state.used_today += 1;
        Ok(())
    }

    pub async fn used_today(&self) -> u32 {
        self.state.lock().await.used_today
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// `classify_status` for a bare status code carried in an error.
pub fn classify_status_code(status: u16) -> RetryDisposition {
    StatusCode::from_u16(status)
        .map(classify_status)
        .unwrap_or(RetryDisposition::NonRetryable)
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET `url` with `params` appended as a query string, retrying transient failures.
    /// `label` is what gets logged in place of the URL, which may carry credentials.
    pub async fn get_with_query(
        &self,
        label: &str,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        self.fetch_with_retries(url, params)
            .instrument(info_span!("http_fetch", label))
            .await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).query(params).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().path().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
