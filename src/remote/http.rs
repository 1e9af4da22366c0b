//! HTTP implementation of the remote backend.
//!
//! Talks to a PostgREST-style tabular service: equality and containment
//! filters in the query string, JSON row payloads, delete by id list. The
//! change feed is implemented by polling snapshots and diffing on id and
//! `updated_at`, behind the same `RemoteBackend` seam a push transport
//! would use.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{header, Client, StatusCode};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::WireRecord;

use super::backend::{ChangeEvent, ChangeFeed, ChangeKind, RemoteBackend};
use super::RemoteError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
/// 1 second is polite to the server while not making users wait too long.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Buffer size for the change-feed channel.
/// 64 covers a full polling diff burst without blocking the poller.
const FEED_BUFFER_SIZE: usize = 64;

/// Consecutive poll failures tolerated before the feed is closed and the
/// ingestion pipeline takes over with its reconnect policy.
const MAX_POLL_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Service root, e.g. `https://example.supabase.co`.
    pub base_url: String,
    /// API key sent as both `apikey` and bearer token.
    pub api_key: Option<String>,
    pub table: String,
    pub poll_interval_ms: u64,
}

impl HttpBackendConfig {
    /// Build a backend config from the engine configuration plus the
    /// connection details the engine config deliberately does not store.
    pub fn from_engine_config(
        config: &crate::config::EngineConfig,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            table: config.table.clone(),
            poll_interval_ms: config.poll_interval_ms,
        }
    }
}

/// Remote backend over HTTP.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    config: HttpBackendConfig,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, config })
    }

    fn table_url(&self) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.table
        )
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, RemoteError> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref key) = self.config.api_key {
            let bearer = header::HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
            let apikey = header::HeaderValue::from_str(key)
                .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
            headers.insert(header::AUTHORIZATION, bearer);
            headers.insert("apikey", apikey);
        }
        Ok(headers)
    }

    /// Send a request, retrying rate-limited responses with exponential
    /// backoff. Any other non-success status maps through `from_status`.
    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response, RemoteError>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build()
                .headers(self.auth_headers()?)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        RemoteError::Timeout
                    } else {
                        RemoteError::Network(e)
                    }
                })?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(RemoteError::RateLimited);
                }
                warn!(retry = retries, backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2; // Exponential backoff
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status, &body));
        }
    }

    async fn select(&self, query: &str) -> Result<Vec<WireRecord>, RemoteError> {
        let url = format!("{}?{}", self.table_url(), query);
        let response = self
            .send_with_retry(|| self.client.get(&url))
            .await?;
        response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }
}

#[async_trait::async_trait]
impl RemoteBackend for HttpBackend {
    async fn select_by_id(&self, id: &str) -> Result<Option<WireRecord>, RemoteError> {
        let rows = self.select(&format!("id=eq.{}&limit=1", id)).await?;
        Ok(rows.into_iter().next())
    }

    async fn select_all(&self) -> Result<Vec<WireRecord>, RemoteError> {
        self.select("order=date.asc").await
    }

    async fn select_by_worker(&self, worker_id: &str) -> Result<Vec<WireRecord>, RemoteError> {
        // PostgREST containment filter on the worker-list column
        self.select(&format!("worker_ids=cs.{{{}}}&order=date.asc", worker_id))
            .await
    }

    async fn insert(&self, record: WireRecord) -> Result<(), RemoteError> {
        let url = self.table_url();
        let rows = [record];
        self.send_with_retry(|| {
            self.client
                .post(&url)
                .header("Prefer", "return=minimal")
                .json(&rows)
        })
        .await?;
        Ok(())
    }

    async fn update(&self, id: &str, record: WireRecord) -> Result<(), RemoteError> {
        let url = format!("{}?id=eq.{}", self.table_url(), id);
        self.send_with_retry(|| {
            self.client
                .patch(&url)
                .header("Prefer", "return=minimal")
                .json(&record)
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), RemoteError> {
        if ids.is_empty() {
            return Ok(());
        }
        let url = format!("{}?id=in.({})", self.table_url(), ids.join(","));
        self.send_with_retry(|| self.client.delete(&url)).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<ChangeFeed, RemoteError> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER_SIZE);

        // Baseline snapshot: existing rows are the initial reconciliation's
        // job, not feed events.
        let baseline = self.select_all().await?;
        let mut known: HashMap<String, WireRecord> = baseline
            .into_iter()
            .filter(|r| !r.id.is_empty())
            .map(|r| (r.id.clone(), r))
            .collect();

        let backend = self.clone();
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                tokio::time::sleep(interval).await;

                let rows = match backend.select_all().await {
                    Ok(rows) => {
                        failures = 0;
                        rows
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(error = %e, failures, "Change-feed poll failed");
                        if failures >= MAX_POLL_FAILURES {
                            // Dropping tx closes the feed; the pipeline's
                            // reconnect policy takes it from here.
                            return;
                        }
                        continue;
                    }
                };

                let mut current: HashMap<String, WireRecord> = HashMap::new();
                for row in rows {
                    if row.id.is_empty() {
                        continue;
                    }
                    current.insert(row.id.clone(), row);
                }

                let mut events = Vec::new();
                for (id, row) in &current {
                    match known.get(id) {
                        None => events.push(ChangeEvent {
                            kind: ChangeKind::Insert,
                            old: None,
                            new: Some(row.clone()),
                        }),
                        Some(prev) if prev.updated_at != row.updated_at => {
                            events.push(ChangeEvent {
                                kind: ChangeKind::Update,
                                old: Some(prev.clone()),
                                new: Some(row.clone()),
                            })
                        }
                        Some(_) => {}
                    }
                }
                for (id, row) in &known {
                    if !current.contains_key(id) {
                        events.push(ChangeEvent {
                            kind: ChangeKind::Delete,
                            old: Some(row.clone()),
                            new: None,
                        });
                    }
                }

                if !events.is_empty() {
                    debug!(count = events.len(), "Change-feed poll found changes");
                }
                for event in events {
                    if tx.send(event).await.is_err() {
                        // Subscriber went away; stop polling.
                        return;
                    }
                }
                known = current;
            }
        });

        Ok(rx)
    }
}
