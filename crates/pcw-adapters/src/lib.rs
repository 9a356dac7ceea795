//! Platform fetch contracts, live API clients and fixture-backed adapters.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use pcw_core::{AccountDraft, CommentDraft, CommentThread, ContentDraft, Platform};
use pcw_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod fixture;
pub mod twitter;
pub mod youtube;

pub use fixture::{load_fixture_bundles, FixtureAccount, FixtureAdapter, FixtureBundle};
pub use twitter::{extract_tweet_id, TwitterClient};
pub use youtube::{looks_like_channel_id, YouTubeClient};

pub const CRATE_NAME: &str = "pcw-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("no adapter registered for {0}")]
    Unsupported(Platform),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// How many comment threads to pull: `max_results` per page, up to `pages` pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommentPaging {
    pub max_results: u32,
    pub pages: u32,
}

impl Default for CommentPaging {
    fn default() -> Self {
        Self {
            max_results: 20,
            pages: 1,
        }
    }
}

impl CommentPaging {
    pub fn new(max_results: Option<u32>, pages: Option<u32>) -> Self {
        let defaults = Self::default();
        Self {
            max_results: max_results.unwrap_or(defaults.max_results).clamp(1, 100),
            pages: pages.unwrap_or(defaults.pages).clamp(1, 50),
        }
    }

    pub fn total(&self) -> usize {
        (self.max_results as usize) * (self.pages as usize)
    }
}

/// Fetch contract for one platform.
///
/// `Ok(None)` and empty vectors mean the platform has no such record; `Err`
/// means the upstream call itself failed.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    async fn fetch_account(&self, identifier: &str) -> Result<Option<AccountDraft>, AdapterError>;

    async fn fetch_content(&self, content_id: &str) -> Result<Option<ContentDraft>, AdapterError>;

    /// Most recently published items of an account, newest first.
    async fn fetch_recent_content(
        &self,
        account_external_id: &str,
        limit: usize,
    ) -> Result<Vec<ContentDraft>, AdapterError>;

    async fn fetch_comment_threads(
        &self,
        content_id: &str,
        paging: CommentPaging,
    ) -> Result<Vec<CommentThread>, AdapterError>;

    async fn fetch_replies(
        &self,
        comment_external_id: &str,
        max_results: u32,
    ) -> Result<Vec<CommentDraft>, AdapterError>;
}

/// API credentials for the live clients; a missing credential leaves that platform unregistered.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub youtube_api_key: Option<String>,
    pub twitter_bearer_token: Option<String>,
}

/// Adapter lookup by platform.
#[derive(Clone, Default)]
pub struct Adapters {
    by_platform: BTreeMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl fmt::Debug for Adapters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapters")
            .field("platforms", &self.by_platform.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Adapters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.by_platform.insert(adapter.platform(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn PlatformAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, platform: Platform) -> Result<Arc<dyn PlatformAdapter>, AdapterError> {
        self.by_platform
            .get(&platform)
            .cloned()
            .ok_or(AdapterError::Unsupported(platform))
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.by_platform.keys().copied().collect()
    }

    pub fn live(http: Arc<HttpFetcher>, credentials: &Credentials) -> Self {
        let mut adapters = Self::new();
        if let Some(key) = &credentials.youtube_api_key {
            adapters.register(Arc::new(YouTubeClient::new(Arc::clone(&http), key.clone())));
        }
        if let Some(token) = &credentials.twitter_bearer_token {
            adapters.register(Arc::new(TwitterClient::new(Arc::clone(&http), token.clone())));
        }
        adapters
    }

    /// Registry backed by the fixture bundles in `path`, one adapter per bundle platform.
    pub fn from_fixture_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut adapters = Self::new();
        for bundle in load_fixture_bundles(path)? {
            adapters.register(Arc::new(FixtureAdapter::new(bundle)));
        }
        Ok(adapters)
    }
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_string(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_at(value, path)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Counters arrive as JSON numbers or as decimal strings depending on the API.
fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
