//! Fetch capability with retry/backoff, plus last-seen state persistence.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use annwatch_core::AnnouncementRecord;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "annwatch-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(String),
}

impl FetchError {
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
            // A body cut off mid-stream reports as a body or decode error.
            FetchError::Connect(err.to_string())
        } else {
            FetchError::Request(err.to_string())
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Timeout(_) | FetchError::Connect(_) => RetryDisposition::Retryable,
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Request(_) => RetryDisposition::NonRetryable,
        }
    }

    /// Timeouts, connection failures and 5xx responses.
    pub fn is_transient(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

/// Attempt budget and exponential backoff shared by every network call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub retryable: fn(&FetchError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(60),
            retryable: FetchError::is_transient,
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the failed attempt `attempt_index` (zero based).
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = self.multiplier.max(1).checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the attempt budget
    /// is spent. The closure receives the zero-based attempt index.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if (self.retryable)(&err) && attempt + 1 < attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient fetch failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Capability: GET a URL, already wrapped in the retry policy.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(
        &self,
        source_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
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
            retry: config.retry,
        })
    }

    async fn attempt(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        let mut builder = self.client.get(&request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&e))?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(&e))?
            .to_vec();
        Ok(FetchedResponse {
            status: status.as_u16(),
            final_url,
            body,
        })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(
        &self,
        source_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url = %request.url);
        async {
            let resp = self.retry.run(|_| self.attempt(request)).await?;
            debug!(status = resp.status, bytes = resp.body.len(), "fetched");
            Ok(resp)
        }
        .instrument(span)
        .await
    }
}

/// Capability: load/save the last-known announcement.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Missing or unreadable state is reported as `None`.
    async fn load(&self) -> Option<AnnouncementRecord>;
    async fn save(&self, record: &AnnouncementRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn decode(text: &str) -> Option<AnnouncementRecord> {
        let value: JsonValue = serde_json::from_str(text).ok()?;
        let value = match value {
            JsonValue::Array(items) => items.into_iter().next()?,
            other => other,
        };
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self) -> Option<AnnouncementRecord> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no prior state");
                return None;
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "state unreadable, treating as empty");
                return None;
            }
        };
        let decoded = Self::decode(&text);
        if decoded.is_none() && !text.trim().is_empty() {
            warn!(path = %self.path.display(), "state corrupt, treating as empty");
        }
        decoded
    }

    /// Writes through a temp file and rename so a killed run never leaves half a record.
    async fn save(&self, record: &AnnouncementRecord) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(record).context("serializing state record")?;
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating state directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.state.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp state {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn instant_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(5),
            retryable: FetchError::is_transient,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn only_server_errors_and_network_failures_are_transient() {
        let server = FetchError::HttpStatus { status: 503, url: "u".into() };
        let client = FetchError::HttpStatus { status: 404, url: "u".into() };
        let throttled = FetchError::HttpStatus { status: 429, url: "u".into() };
        assert!(server.is_transient());
        assert!(!client.is_transient());
        assert!(!throttled.is_transient());
        assert!(FetchError::Timeout("t".into()).is_transient());
        assert!(FetchError::Connect("reset".into()).is_transient());
        assert!(!FetchError::Request("bad url".into()).is_transient());
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicUsize::new(0);
        let result = instant_policy(5)
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(FetchError::HttpStatus { status: 502, url: "u".into() })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = instant_policy(5)
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::HttpStatus { status: 403, url: "u".into() }) }
            })
            .await;
        assert!(matches!(result, Err(FetchError::HttpStatus { status: 403, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_budget() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = instant_policy(5)
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::Timeout("slow".into())) }
            })
            .await;
        assert!(matches!(result, Err(FetchError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn request_builder_keeps_query_and_headers() {
        let req = FetchRequest::get("https://example.test/api")
            .query("pageno", "1")
            .header("Accept", "application/json");
        assert_eq!(req.query, vec![("pageno".to_string(), "1".to_string())]);
        assert_eq!(req.header_value("accept"), Some("application/json"));
    }

    #[tokio::test]
    async fn state_round_trips_non_ascii() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStateStore::new(dir.path().join("last_seen.json"));
        let record = AnnouncementRecord::new("28 Jan 2026", "ACME", "Test 🚀 Emoji", "");

        store.save(&record).await.expect("save");
        let raw = std::fs::read(store.path()).expect("raw bytes");
        let needle = "🚀".as_bytes();
        assert!(raw.windows(needle.len()).any(|w| w == needle));

        assert_eq!(store.load().await, Some(record));
    }

    #[tokio::test]
    async fn missing_or_corrupt_state_is_empty() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStateStore::new(dir.path().join("last_seen.json"));
        assert_eq!(store.load().await, None);

        std::fs::write(store.path(), b"{not json").expect("write");
        assert_eq!(store.load().await, None);

        std::fs::write(store.path(), b"42").expect("write");
        assert_eq!(store.load().await, None);
    }

    #[tokio::test]
    async fn list_shaped_state_uses_first_entry() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStateStore::new(dir.path().join("last_seen.json"));
        std::fs::write(
            store.path(),
            r#"[{"date":"d1","scrip":"IDEA","title":"t1","pdf":""},{"date":"d2","scrip":"BLS","title":"t2","pdf":""}]"#,
        )
        .expect("write");
        let loaded = store.load().await.expect("record");
        assert_eq!(loaded.entity_id, "IDEA");

        std::fs::write(store.path(), b"[]").expect("write");
        assert_eq!(store.load().await, None);
    }

    #[tokio::test]
    async fn save_overwrites_previous_state() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStateStore::new(dir.path().join("nested").join("state.json"));
        store
            .save(&AnnouncementRecord::new("a", "b", "c", "d"))
            .await
            .expect("first save");
        let second = AnnouncementRecord::new("e", "f", "g", "");
        store.save(&second).await.expect("second save");
        assert_eq!(store.load().await, Some(second));
    }
}
