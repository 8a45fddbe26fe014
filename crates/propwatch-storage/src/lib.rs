//! Durable listing history + retrying HTTP fetch layer for propwatch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use chrono::{DateTime, Utc};
use propwatch_core::HistoryEntry;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "propwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("history file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Durable mapping from listing id to last-known state.
///
/// The whole map lives in memory and is written back as one JSON document
/// via an atomic temp-file rename, once per cycle. Entries are never
/// removed automatically; deleting the file is the only way to force
/// re-detection.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    entries: HashMap<String, HistoryEntry>,
}

impl HistoryStore {
    /// Load an existing history file, or start empty if none exists.
    /// An unreadable or unparseable file is fatal; silently starting over
    /// would re-notify every known listing.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt {
                path: path.clone(),
                reason: err.to_string(),
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                return Err(StoreError::Io {
                    path,
                    source: err,
                })
            }
        };
        info!(path = %path.display(), entries = entries.len(), "history store opened");
        Ok(Self { path, entries })
    }

    pub fn get(&self, id: &str) -> Option<&HistoryEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// An empty store at startup means cold start: the first cycle only
    /// records a baseline.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Record one observation of an id. Creates the entry with
    /// `first_seen_at = observed_at` on first sight, otherwise updates
    /// `last_price` and `last_seen_at` whether or not the price changed.
    pub fn upsert(&mut self, id: &str, price: u64, observed_at: DateTime<Utc>) {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.last_price = price;
                entry.last_seen_at = observed_at;
            }
            None => {
                self.entries.insert(
                    id.to_string(),
                    HistoryEntry {
                        id: id.to_string(),
                        last_price: price,
                        first_seen_at: observed_at,
                        last_seen_at: observed_at,
                    },
                );
            }
        }
    }

    /// Write the full map to disk: temp file in the same directory, fsync,
    /// atomic rename over the live file. Called once per cycle, after all
    /// upserts; a crash before this loses at most the current cycle.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.entries).map_err(|err| StoreError::Corrupt {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|err| StoreError::Io {
                    path: parent.to_path_buf(),
                    source: err,
                })?;
            }
        }

        let temp_path = self
            .path
            .with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        let temp_io = |source: std::io::Error| StoreError::Io {
            path: temp_path.clone(),
            source,
        };

        let mut file = fs::File::create(&temp_path).await.map_err(temp_io)?;
        file.write_all(&bytes).await.map_err(temp_io)?;
        file.sync_all().await.map_err(temp_io)?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                path: self.path.clone(),
                source: err,
            });
        }
        debug!(path = %self.path.display(), entries = self.entries.len(), "history flushed");
        Ok(())
    }

    /// Copy the live file into `backups/` next to it, then evict backups
    /// older than the retention window.
    pub async fn backup(&self, retention: Duration) -> Result<PathBuf, StoreError> {
        let backup_dir = self
            .path
            .parent()
            .map(|p| p.join("backups"))
            .unwrap_or_else(|| PathBuf::from("backups"));
        fs::create_dir_all(&backup_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: backup_dir.clone(),
                source,
            })?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let backup_path = backup_dir.join(format!("history_{stamp}.json"));
        fs::copy(&self.path, &backup_path)
            .await
            .map_err(|source| StoreError::Io {
                path: backup_path.clone(),
                source,
            })?;
        info!(path = %backup_path.display(), "backup created");

        self.evict_old_backups(&backup_dir, retention).await?;
        Ok(backup_path)
    }

    async fn evict_old_backups(
        &self,
        backup_dir: &Path,
        retention: Duration,
    ) -> Result<(), StoreError> {
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut dir = fs::read_dir(backup_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: backup_dir.to_path_buf(),
                source,
            })?;
        while let Ok(Some(entry)) = dir.next_entry().await.map_err(|source| StoreError::Io {
            path: backup_dir.to_path_buf(),
            source,
        }) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if modified < cutoff {
                let _ = fs::remove_file(&path).await;
                debug!(path = %path.display(), "old backup evicted");
            }
        }
        Ok(())
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
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// HTTP page fetcher with bounded retries and exponential backoff.
/// Exhausted retries surface as [`FetchError`]; the caller decides whether
/// the cycle survives.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl PageFetcher {
    pub fn new(policy: FetchPolicy) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(policy.timeout);
        if let Some(user_agent) = &policy.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: policy.backoff,
        })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("page_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.text().await?;
                        debug!(status = status.as_u16(), bytes = body.len(), "page fetched");
                        return Ok(body);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
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
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let dir = tempdir().expect("tempdir");
        let mut store = HistoryStore::open(dir.path().join("history.json"))
            .await
            .expect("open");

        let first = ts("2026-08-01T10:00:00Z");
        let second = ts("2026-08-01T10:15:00Z");

        store.upsert("hz-1", 9_000, first);
        let entry = store.get("hz-1").expect("entry").clone();
        assert_eq!(entry.last_price, 9_000);
        assert_eq!(entry.first_seen_at, first);
        assert_eq!(entry.last_seen_at, first);

        store.upsert("hz-1", 8_000, second);
        let entry = store.get("hz-1").expect("entry");
        assert_eq!(entry.last_price, 8_000);
        assert_eq!(entry.first_seen_at, first, "first_seen_at is set once");
        assert_eq!(entry.last_seen_at, second);
    }

    #[tokio::test]
    async fn flush_then_reopen_preserves_entries() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("history.json");

        let mut store = HistoryStore::open(&path).await.expect("open");
        store.upsert("hz-1", 9_000, ts("2026-08-01T10:00:00Z"));
        store.upsert("hz-2", 7_500, ts("2026-08-01T10:00:00Z"));
        store.flush().await.expect("flush");

        let reopened = HistoryStore::open(&path).await.expect("reopen");
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get("hz-1").expect("hz-1").last_price, 9_000);
        assert_eq!(reopened.get("hz-2").expect("hz-2").last_price, 7_500);
    }

    #[tokio::test]
    async fn corrupt_history_file_is_fatal() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        fs::write(&path, b"{not json").await.expect("write");

        match HistoryStore::open(&path).await {
            Err(StoreError::Corrupt { .. }) => {}
            other => panic!("expected corrupt error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::open(dir.path().join("history.json"))
            .await
            .expect("open");
        assert!(store.is_empty());
        assert_eq!(store.ids().count(), 0);
    }

    #[tokio::test]
    async fn backup_copies_and_evicts_stale_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        let mut store = HistoryStore::open(&path).await.expect("open");
        store.upsert("hz-1", 9_000, ts("2026-08-01T10:00:00Z"));
        store.flush().await.expect("flush");

        let stale = dir.path().join("backups").join("history_20200101_000000.json");
        fs::create_dir_all(stale.parent().expect("parent"))
            .await
            .expect("mkdir");
        fs::write(&stale, b"{}").await.expect("write stale");
        let old = SystemTime::now() - Duration::from_secs(30 * 24 * 3600);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&stale)
            .expect("open stale");
        file.set_times(std::fs::FileTimes::new().set_modified(old))
            .expect("set mtime");
        drop(file);

        let backup_path = store
            .backup(Duration::from_secs(7 * 24 * 3600))
            .await
            .expect("backup");
        assert!(backup_path.exists());
        assert!(!stale.exists(), "stale backup should be evicted");
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(2));
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
