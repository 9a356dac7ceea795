//! Fixture-backed adapters that serve drafts from JSON bundles.
//!
//! The bundle can be mutated in process (new uploads, injected failures,
//! added latency), which is how the watch loop and reconciler are exercised
//! without network access.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pcw_core::{AccountDraft, CommentDraft, CommentThread, ContentDraft, Platform};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{AdapterError, CommentPaging, PlatformAdapter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureAccount {
    #[serde(flatten)]
    pub draft: AccountDraft,
    /// Extra identifiers (handles, vanity names) that resolve to this account.
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub platform: Platform,
    #[serde(default)]
    pub accounts: Vec<FixtureAccount>,
    /// Newest first.
    #[serde(default)]
    pub content: Vec<ContentDraft>,
    /// Comment threads keyed by content external id.
    #[serde(default)]
    pub comment_threads: BTreeMap<String, Vec<CommentThread>>,
}

impl FixtureBundle {
    pub fn empty(platform: Platform) -> Self {
        Self {
            platform,
            accounts: Vec::new(),
            content: Vec::new(),
            comment_threads: BTreeMap::new(),
        }
    }
}

/// Read a JSON array of bundles.
pub fn load_fixture_bundles(path: impl AsRef<Path>) -> Result<Vec<FixtureBundle>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug)]
struct FixtureState {
    bundle: FixtureBundle,
    failing: HashSet<String>,
    fail_all: bool,
    latency: Option<Duration>,
    calls: usize,
}

#[derive(Debug)]
pub struct FixtureAdapter {
    platform: Platform,
    state: Mutex<FixtureState>,
}

impl FixtureAdapter {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self {
            platform: bundle.platform,
            state: Mutex::new(FixtureState {
                bundle,
                failing: HashSet::new(),
                fail_all: false,
                latency: None,
                calls: 0,
            }),
        }
    }

    pub fn empty(platform: Platform) -> Self {
        Self::new(FixtureBundle::empty(platform))
    }

    pub async fn add_account(&self, draft: AccountDraft) {
        let mut state = self.state.lock().await;
        state
            .bundle
            .accounts
            .retain(|a| a.draft.external_id != draft.external_id);
        state.bundle.accounts.push(FixtureAccount {
            draft,
            aliases: Vec::new(),
        });
    }

    /// Make `draft` the newest item, replacing any earlier copy with the same id.
    pub async fn publish_content(&self, draft: ContentDraft) {
        let mut state = self.state.lock().await;
        state
            .bundle
            .content
            .retain(|c| c.external_id != draft.external_id);
        state.bundle.content.insert(0, draft);
    }

    pub async fn add_comment_thread(&self, content_id: &str, thread: CommentThread) {
        let mut state = self.state.lock().await;
        state
            .bundle
            .comment_threads
            .entry(content_id.to_string())
            .or_default()
            .push(thread);
    }

    /// Every call naming `identifier` fails until cleared.
    pub async fn fail_for(&self, identifier: &str) {
        let key = self.platform.normalize_account_id(identifier);
        self.state.lock().await.failing.insert(key);
    }

    pub async fn fail_all(&self, enabled: bool) {
        self.state.lock().await.fail_all = enabled;
    }

    pub async fn clear_failures(&self) {
        let mut state = self.state.lock().await;
        state.failing.clear();
        state.fail_all = false;
    }

    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    /// Number of fetch calls served so far, failed ones included.
    pub async fn calls(&self) -> usize {
        self.state.lock().await.calls
    }

    /// Count the call, apply injected latency, then read the bundle or fail.
    async fn serve<T>(
        &self,
        identifier: &str,
        read: impl FnOnce(&FixtureBundle) -> T,
    ) -> Result<T, AdapterError> {
        let latency = {
            let mut state = self.state.lock().await;
            state.calls += 1;
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let state = self.state.lock().await;
        let key = self.platform.normalize_account_id(identifier);
        if state.fail_all || state.failing.contains(&key) {
            return Err(AdapterError::Message(format!(
                "injected {} failure for {identifier}",
                self.platform
            )));
        }
        Ok(read(&state.bundle))
    }
}

fn matches_account(platform: Platform, account: &FixtureAccount, identifier: &str) -> bool {
    let wanted = platform.normalize_account_id(identifier);
    let candidates = std::iter::once(&account.draft.external_id)
        .chain(account.draft.handle.iter())
        .chain(account.aliases.iter());
    candidates.into_iter().any(|candidate| {
        platform
            .normalize_account_id(candidate)
            .trim_start_matches('@')
            .eq_ignore_ascii_case(wanted.trim_start_matches('@'))
    })
}

#[async_trait]
impl PlatformAdapter for FixtureAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn fetch_account(&self, identifier: &str) -> Result<Option<AccountDraft>, AdapterError> {
        let platform = self.platform;
        self.serve(identifier, |bundle| {
            bundle
                .accounts
                .iter()
                .find(|account| matches_account(platform, account, identifier))
                .map(|account| account.draft.clone())
        })
        .await
    }

    async fn fetch_content(&self, content_id: &str) -> Result<Option<ContentDraft>, AdapterError> {
        self.serve(content_id, |bundle| {
            bundle
                .content
                .iter()
                .find(|c| c.external_id == content_id.trim())
                .cloned()
        })
        .await
    }

    async fn fetch_recent_content(
        &self,
        account_external_id: &str,
        limit: usize,
    ) -> Result<Vec<ContentDraft>, AdapterError> {
        let wanted = self.platform.normalize_account_id(account_external_id);
        self.serve(account_external_id, |bundle| {
            bundle
                .content
                .iter()
                .filter(|c| c.account_external_id.as_deref() == Some(wanted.as_str()))
                .take(limit)
                .cloned()
                .collect::<Vec<_>>()
        })
        .await
    }

    async fn fetch_comment_threads(
        &self,
        content_id: &str,
        paging: CommentPaging,
    ) -> Result<Vec<CommentThread>, AdapterError> {
        self.serve(content_id, |bundle| {
            bundle
                .comment_threads
                .get(content_id.trim())
                .map(|threads| threads.iter().take(paging.total()).cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        })
        .await
    }

    async fn fetch_replies(
        &self,
        comment_external_id: &str,
        max_results: u32,
    ) -> Result<Vec<CommentDraft>, AdapterError> {
        self.serve(comment_external_id, |bundle| {
            bundle
                .comment_threads
                .values()
                .flatten()
                .find(|thread| thread.comment.external_id == comment_external_id)
                .map(|thread| {
                    thread
                        .replies
                        .iter()
                        .take(max_results as usize)
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        })
        .await
    }
}
