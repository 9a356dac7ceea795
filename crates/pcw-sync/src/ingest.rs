//! On-demand fetch-then-reconcile operations behind the scrape endpoints.

use pcw_adapters::{extract_tweet_id, AdapterError, Adapters, CommentPaging, PlatformAdapter};
use pcw_core::{parse_platform_timestamp, CommentDraft, ContentDraft, Platform};
use pcw_storage::{Account, Comment, ContentItem};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::reconcile::{AccountTags, ParentRef, Reconciler};

/// Videos reconciled alongside a channel scrape.
pub const ACCOUNT_RECENT_CONTENT: usize = 10;
/// Threads scanned when looking for a comment by author.
const AUTHOR_SEARCH_PAGING: CommentPaging = CommentPaging {
    max_results: 100,
    pages: 5,
};
const MAX_REPLIES: u32 = 100;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("upstream fetch failed: {0}")]
    Upstream(#[source] AdapterError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl IngestError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Upstream(_) | Self::Invalid(_) => 400,
            Self::NotFound(_) => 404,
            Self::Store(_) => 500,
        }
    }
}

impl From<AdapterError> for IngestError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Unsupported(platform) => {
                Self::Invalid(format!("{platform} ingestion is not configured"))
            }
            other => Self::Upstream(other),
        }
    }
}

/// Which top-level comment to follow when scraping replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorMatch {
    Name(String),
    ExternalId(String),
}

impl AuthorMatch {
    pub fn matches(&self, comment: &CommentDraft) -> bool {
        match self {
            Self::Name(name) => comment
                .author_name
                .as_deref()
                .is_some_and(|author| same_author_name(author, name)),
            Self::ExternalId(id) => comment.author_external_id.as_deref() == Some(id.trim()),
        }
    }
}

fn same_author_name(a: &str, b: &str) -> bool {
    a.trim()
        .trim_start_matches('@')
        .eq_ignore_ascii_case(b.trim().trim_start_matches('@'))
}

#[derive(Debug, Clone, Serialize)]
pub struct RepliesOutcome {
    pub comment: Comment,
    pub replies: usize,
}

#[derive(Clone)]
pub struct Ingestor {
    reconciler: Reconciler,
    adapters: Adapters,
}

impl Ingestor {
    pub fn new(reconciler: Reconciler, adapters: Adapters) -> Self {
        Self {
            reconciler,
            adapters,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Fetch and reconcile one account. Video accounts also get their most
    /// recent uploads reconciled and linked.
    pub async fn scrape_account(
        &self,
        platform: Platform,
        identifier: &str,
        tags: AccountTags,
    ) -> Result<Account, IngestError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(IngestError::Invalid("account identifier is empty".into()));
        }
        let adapter = self.adapters.get(platform)?;
        let draft = adapter
            .fetch_account(identifier)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("{platform} account {identifier} not found")))?;

        let recent = match platform {
            Platform::YouTube => {
                adapter
                    .fetch_recent_content(&draft.external_id, ACCOUNT_RECENT_CONTENT)
                    .await?
            }
            Platform::Twitter => Vec::new(),
        };
        let latest_published = recent
            .iter()
            .filter_map(|c| c.published_at.as_deref().and_then(parse_platform_timestamp))
            .max();

        let account = self
            .reconciler
            .reconcile_account_with_latest(&draft, &tags, latest_published)
            .await?;
        for item in &recent {
            self.reconciler
                .reconcile_content(item, ParentRef::Resolved(account.id))
                .await?;
        }
        info!(%platform, external_id = %account.external_id, videos = recent.len(), "scraped account");
        Ok(account)
    }

    /// Fetch and reconcile one content item, creating its owner when needed.
    pub async fn scrape_content(&self, platform: Platform, content_id: &str) -> Result<ContentItem, IngestError> {
        let content_id = normalize_content_id(platform, content_id)?;
        let adapter = self.adapters.get(platform)?;
        let draft = adapter
            .fetch_content(&content_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("{platform} item {content_id} not found")))?;

        let account_id = self.resolve_owner(adapter.as_ref(), &draft).await?;
        let item = self
            .reconciler
            .reconcile_content(&draft, ParentRef::Resolved(account_id))
            .await?;
        info!(%platform, external_id = %item.external_id, "scraped content item");
        Ok(item)
    }

    async fn resolve_owner(&self, adapter: &dyn PlatformAdapter, draft: &ContentDraft) -> Result<i64, IngestError> {
        let Some(ParentRef::External {
            external_id,
            display_name,
        }) = ParentRef::from_draft(draft)
        else {
            return Err(IngestError::Invalid(format!(
                "{} item {} has no owning account",
                draft.platform, draft.external_id
            )));
        };

        let account_id = self
            .reconciler
            .ensure_account_with(draft.platform, &external_id, display_name.as_deref(), || async {
                match adapter.fetch_account(&external_id).await {
                    Ok(found) => found,
                    Err(err) => {
                        warn!(error = %err, %external_id, "owner profile fetch failed; storing stub");
                        None
                    }
                }
            })
            .await?;
        Ok(account_id)
    }

    async fn stored_or_scraped_item(&self, platform: Platform, content_id: &str) -> Result<ContentItem, IngestError> {
        let content_id = normalize_content_id(platform, content_id)?;
        match self
            .reconciler
            .store()
            .find_content_item(platform, &content_id)
            .await?
        {
            Some(item) => Ok(item),
            None => self.scrape_content(platform, &content_id).await,
        }
    }

    /// Reconcile a page of comment threads (top-level comments and inlined
    /// replies). Each comment commits on its own.
    pub async fn scrape_comments(
        &self,
        platform: Platform,
        content_id: &str,
        paging: CommentPaging,
    ) -> Result<usize, IngestError> {
        let item = self.stored_or_scraped_item(platform, content_id).await?;
        let adapter = self.adapters.get(platform)?;
        let threads = adapter.fetch_comment_threads(&item.external_id, paging).await?;

        let mut count = 0usize;
        for thread in &threads {
            let top = self
                .reconciler
                .reconcile_comment(&thread.comment, item.id, None)
                .await?;
            count += 1;
            for reply in &thread.replies {
                self.reconciler
                    .reconcile_comment(reply, item.id, Some(top.id))
                    .await?;
                count += 1;
            }
        }
        info!(%platform, external_id = %item.external_id, count, "scraped comments");
        Ok(count)
    }

    /// Find a top-level comment by author and reconcile it with its replies.
    pub async fn scrape_replies(
        &self,
        platform: Platform,
        content_id: &str,
        author: &AuthorMatch,
    ) -> Result<RepliesOutcome, IngestError> {
        let item = self.stored_or_scraped_item(platform, content_id).await?;
        let adapter = self.adapters.get(platform)?;
        let threads = adapter
            .fetch_comment_threads(&item.external_id, AUTHOR_SEARCH_PAGING)
            .await?;
        let thread = threads
            .into_iter()
            .find(|t| author.matches(&t.comment))
            .ok_or_else(|| {
                IngestError::NotFound(format!(
                    "no top-level comment by {author:?} on {platform} item {}",
                    item.external_id
                ))
            })?;

        let fetched = adapter
            .fetch_replies(&thread.comment.external_id, MAX_REPLIES)
            .await?;
        let replies = if fetched.is_empty() { thread.replies } else { fetched };

        let comment = self
            .reconciler
            .reconcile_comment(&thread.comment, item.id, None)
            .await?;
        for reply in &replies {
            self.reconciler
                .reconcile_comment(reply, item.id, Some(comment.id))
                .await?;
        }
        info!(%platform, comment = %comment.external_id, replies = replies.len(), "scraped replies");
        Ok(RepliesOutcome {
            comment,
            replies: replies.len(),
        })
    }
}

fn normalize_content_id(platform: Platform, raw: &str) -> Result<String, IngestError> {
    let id = match platform {
        Platform::Twitter => extract_tweet_id(raw),
        Platform::YouTube => raw.trim().to_string(),
    };
    if id.is_empty() {
        return Err(IngestError::Invalid("content identifier is empty".into()));
    }
    Ok(id)
}
