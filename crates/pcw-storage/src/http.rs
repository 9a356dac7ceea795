//! Rate-limited JSON client shared by the platform adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

/// Exponential backoff between attempts, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// A longer `Retry-After` from the API wins over our own backoff; both stay under the cap.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let own = self.backoff(attempt);
        retry_after.map_or(own, |asked| asked.max(own)).min(self.max_delay)
    }
}

/// At most `requests` calls per `per` for one API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: u32,
    pub per: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_api: usize,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 16,
            max_in_flight_per_api: 4,
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Fixed-window request quota.
#[derive(Debug)]
struct Quota {
    limit: RateLimit,
    window: Mutex<(Instant, u32)>,
}

impl Quota {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit: RateLimit {
                requests: limit.requests.max(1),
                per: limit.per,
            },
            window: Mutex::new((Instant::now(), 0)),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let (started, used) = &mut *window;
                if started.elapsed() >= self.limit.per {
                    *started = Instant::now();
                    *used = 0;
                }
                if *used < self.limit.requests {
                    *used += 1;
                    return;
                }
                self.limit.per.saturating_sub(started.elapsed())
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Concurrency cap and quota for one API.
#[derive(Debug)]
struct Lane {
    permits: Semaphore,
    quota: Option<Quota>,
}

/// Bearer token or query-string API key attached to a request.
#[derive(Debug, Clone)]
pub enum ApiAuth {
    None,
    Bearer(String),
    QueryKey { param: &'static str, value: String },
}

impl ApiAuth {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::None => request,
            Self::Bearer(token) => request.bearer_auth(token),
            Self::QueryKey { param, value } => request.query(&[(*param, value.as_str())]),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 404, .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One failed attempt and whether another is worth making.
struct Failure {
    retryable: bool,
    retry_after: Option<Duration>,
    error: FetchError,
}

impl Failure {
    fn fatal(error: FetchError) -> Self {
        Self {
            retryable: false,
            retry_after: None,
            error,
        }
    }
}

fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// `Retry-After` in delta-seconds form; HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    per_api: usize,
    rate_limit: Option<RateLimit>,
    lanes: Mutex<HashMap<String, Arc<Lane>>>,
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

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            per_api: config.max_in_flight_per_api.max(1),
            rate_limit: config.rate_limit,
            lanes: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn lane(&self, api: &str) -> Arc<Lane> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry(api.to_string())
            .or_insert_with(|| {
                Arc::new(Lane {
                    permits: Semaphore::new(self.per_api),
                    quota: self.rate_limit.map(Quota::new),
                })
            })
            .clone()
    }

    /// GET `url` with `query` under `api`'s limits, retrying transient failures.
    pub async fn get_json(
        &self,
        api: &str,
        url: &str,
        query: &[(&str, String)],
        auth: &ApiAuth,
    ) -> Result<JsonValue, FetchError> {
        let _slot = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let lane = self.lane(api).await;
        let _lane_slot = lane.permits.acquire().await.map_err(|_| FetchError::Closed)?;

        async {
            let mut attempt = 0u32;
            loop {
                if let Some(quota) = &lane.quota {
                    quota.acquire().await;
                }
                let failure = match self.send_once(url, query, auth).await {
                    Ok(body) => return Ok(body),
                    Err(failure) => failure,
                };
                if !failure.retryable || attempt >= self.retry.max_retries {
                    return Err(failure.error);
                }
                let delay = self.retry.delay(attempt, failure.retry_after);
                debug!(attempt, ?delay, error = %failure.error, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
        .instrument(info_span!("http_fetch", api, url))
        .await
    }

    async fn send_once(&self, url: &str, query: &[(&str, String)], auth: &ApiAuth) -> Result<JsonValue, Failure> {
        let response = auth
            .apply(self.client.get(url).query(query))
            .send()
            .await
            .map_err(|err| Failure {
                retryable: retryable_transport(&err),
                retry_after: None,
                error: FetchError::Request(err),
            })?;

        let status = response.status();
        let path = response.url().path().to_string();
        if status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|err| Failure::fatal(FetchError::Request(err)))?;
            return serde_json::from_slice(&body)
                .map_err(|source| Failure::fatal(FetchError::Decode { url: path, source }));
        }

        let retry_after = retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(Failure {
            retryable: retryable_status(status),
            retry_after,
            error: FetchError::HttpStatus {
                status: status.as_u16(),
                url: path,
                body: truncate(&body, 200),
            },
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_only_lengthens_the_wait() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(policy.delay(1, Some(Duration::from_secs(1))), Duration::from_secs(2));
        assert_eq!(policy.delay(0, Some(Duration::from_secs(5))), Duration::from_secs(5));
        assert_eq!(policy.delay(0, Some(Duration::from_secs(600))), Duration::from_secs(10));
    }

    #[test]
    fn quota_and_server_errors_are_retryable() {
        assert!(retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!retryable_status(StatusCode::FORBIDDEN));
        assert!(!retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn retry_after_reads_delta_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_waits_for_the_next_window() {
        let quota = Quota::new(RateLimit {
            requests: 2,
            per: Duration::from_secs(1),
        });
        let start = Instant::now();
        quota.acquire().await;
        quota.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));
        quota.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn status_errors_expose_their_code() {
        let err = FetchError::HttpStatus {
            status: 404,
            url: "/youtube/v3/videos".into(),
            body: String::new(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.status(), Some(404));
        assert_eq!(FetchError::Closed.status(), None);
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("ééééé", 2), "éé...");
    }
}
