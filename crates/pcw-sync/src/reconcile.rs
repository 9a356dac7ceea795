//! Merge freshly fetched drafts into the store.
//!
//! Each entity is written with a single conflict-resolving upsert, and the
//! lookup-then-create window around lazy parent creation is serialized per
//! external identifier with [`KeyedLocks`].

use std::future::Future;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use pcw_core::{parse_platform_timestamp, AccountDraft, CommentDraft, ContentDraft, Platform};
use pcw_storage::{
    Account, AccountUpsert, Comment, CommentUpsert, ContentItem, ContentUpsert, KeyedLocks, Store,
};
use tracing::debug;

/// Operator-supplied classification tags; `None` leaves stored tags alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountTags {
    pub channel_type: Option<String>,
    pub ideology: Option<String>,
}

/// How a content item finds its owning account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentRef {
    /// Local surrogate key of an account known to exist.
    Resolved(i64),
    /// External identifier of an account that may not be stored yet.
    External {
        external_id: String,
        display_name: Option<String>,
    },
}

impl ParentRef {
    /// The owner named by the draft itself, if the platform reported a non-blank one.
    pub fn from_draft(draft: &ContentDraft) -> Option<Self> {
        let external_id = draft.platform.normalize_account_id(draft.account_external_id.as_deref()?);
        if external_id.is_empty() {
            return None;
        }
        Some(Self::External {
            external_id,
            display_name: draft.account_display_name.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    store: Store,
    locks: KeyedLocks,
}

impl Reconciler {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn reconcile_account(&self, draft: &AccountDraft, tags: &AccountTags) -> Result<Account> {
        let external_id = draft.platform.normalize_account_id(&draft.external_id);
        let _guard = self.locks.lock(account_key(draft.platform, &external_id)).await;
        self.write_account(draft, tags, None).await
    }

    /// Like [`Self::reconcile_account`], also recording when the account last published.
    pub async fn reconcile_account_with_latest(
        &self,
        draft: &AccountDraft,
        tags: &AccountTags,
        last_content_published_at: Option<DateTime<Utc>>,
    ) -> Result<Account> {
        let external_id = draft.platform.normalize_account_id(&draft.external_id);
        let _guard = self.locks.lock(account_key(draft.platform, &external_id)).await;
        self.write_account(draft, tags, last_content_published_at).await
    }

    async fn write_account(
        &self,
        draft: &AccountDraft,
        tags: &AccountTags,
        last_content_published_at: Option<DateTime<Utc>>,
    ) -> Result<Account> {
        let row = account_upsert(draft, tags, last_content_published_at, Utc::now());
        let account = self.store.upsert_account(&row).await?;
        debug!(platform = %account.platform, external_id = %account.external_id, id = account.id, "reconciled account");
        Ok(account)
    }

    /// Surrogate key of the account, creating a minimal stub when it is not stored yet.
    pub async fn ensure_account(
        &self,
        platform: Platform,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Result<i64> {
        self.ensure_account_with(platform, external_id, display_name, || async { None })
            .await
    }

    /// Surrogate key of the account; when absent, `fetch` is awaited once for a
    /// full profile and a stub is written only if it yields nothing.
    ///
    /// Concurrent callers for the same account wait on each other, so `fetch`
    /// runs at most once per missing account.
    pub async fn ensure_account_with<F, Fut>(
        &self,
        platform: Platform,
        external_id: &str,
        display_name: Option<&str>,
        fetch: F,
    ) -> Result<i64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<AccountDraft>>,
    {
        let external_id = platform.normalize_account_id(external_id);
        if external_id.is_empty() {
            bail!("cannot resolve a {platform} account without an identifier");
        }
        let _guard = self.locks.lock(account_key(platform, &external_id)).await;

        if let Some(existing) = self.store.find_account(platform, &external_id).await? {
            return Ok(existing.id);
        }

        match fetch().await {
            Some(draft) if platform.normalize_account_id(&draft.external_id) == external_id => {
                Ok(self.write_account(&draft, &AccountTags::default(), None).await?.id)
            }
            _ => {
                debug!(%platform, %external_id, "creating account stub");
                self.store
                    .ensure_account_stub(platform, &external_id, display_name)
                    .await
            }
        }
    }

    pub async fn reconcile_content(&self, draft: &ContentDraft, parent: ParentRef) -> Result<ContentItem> {
        let _guard = self
            .locks
            .lock(format!("content:{}:{}", draft.platform, draft.external_id))
            .await;

        let account_id = match parent {
            ParentRef::Resolved(id) => id,
            ParentRef::External {
                external_id,
                display_name,
            } => {
                self.ensure_account(draft.platform, &external_id, display_name.as_deref())
                    .await?
            }
        };

        let row = content_upsert(draft, account_id, Utc::now());
        let item = self.store.upsert_content_item(&row).await?;
        debug!(platform = %item.platform, external_id = %item.external_id, id = item.id, "reconciled content item");
        Ok(item)
    }

    pub async fn reconcile_comment(
        &self,
        draft: &CommentDraft,
        content_item_id: i64,
        parent_comment_id: Option<i64>,
    ) -> Result<Comment> {
        let _guard = self
            .locks
            .lock(format!("comment:{}:{}", draft.platform, draft.external_id))
            .await;
        let row = comment_upsert(draft, content_item_id, parent_comment_id, Utc::now());
        self.store.upsert_comment(&row).await
    }
}

fn account_key(platform: Platform, external_id: &str) -> String {
    format!("account:{platform}:{external_id}")
}

fn parse_optional_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(parse_platform_timestamp)
}

pub fn account_upsert(
    draft: &AccountDraft,
    tags: &AccountTags,
    last_content_published_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> AccountUpsert {
    AccountUpsert {
        platform: draft.platform,
        external_id: draft.platform.normalize_account_id(&draft.external_id),
        display_name: draft.display_name.clone(),
        handle: draft.handle.clone(),
        description: draft.description.clone(),
        avatar_url: draft.avatar_url.clone(),
        follower_count: draft.follower_count,
        content_count: draft.content_count,
        view_count: draft.view_count,
        published_at: parse_optional_timestamp(draft.published_at.as_deref()),
        location: draft.location.clone(),
        links: draft.links.clone(),
        channel_type: tags.channel_type.clone(),
        ideology: tags.ideology.clone(),
        last_content_published_at,
        scraped_at: now,
    }
}

pub fn content_upsert(draft: &ContentDraft, account_id: i64, now: DateTime<Utc>) -> ContentUpsert {
    ContentUpsert {
        platform: draft.platform,
        external_id: draft.external_id.clone(),
        account_id: Some(account_id),
        title: draft.title.clone(),
        description: draft.description.clone(),
        view_count: draft.view_count,
        like_count: draft.like_count,
        comment_count: draft.comment_count,
        repost_count: draft.repost_count,
        live_status: draft.live_status.clone(),
        duration: draft.duration.clone(),
        published_at: parse_optional_timestamp(draft.published_at.as_deref()),
        scraped_at: now,
    }
}

pub fn comment_upsert(
    draft: &CommentDraft,
    content_item_id: i64,
    parent_comment_id: Option<i64>,
    now: DateTime<Utc>,
) -> CommentUpsert {
    CommentUpsert {
        platform: draft.platform,
        external_id: draft.external_id.clone(),
        content_item_id,
        parent_comment_id,
        text: draft.text.clone(),
        author_name: draft.author_name.clone(),
        author_external_id: draft.author_external_id.clone(),
        like_count: draft.like_count,
        reply_count: draft.reply_count,
        published_at: parse_optional_timestamp(draft.published_at.as_deref()),
        scraped_at: now,
    }
}
