//! SQLite persistence for accounts, content, comments and the watch list.
//!
//! Every write that can race on an external identifier is a single
//! `INSERT .. ON CONFLICT .. DO UPDATE .. RETURNING` statement, so the unique
//! `(platform, external_id)` constraint is what prevents duplicate rows.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pcw_core::{DetectionStatus, Platform};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

/// Row cap for unfiltered comment listings.
pub const UNFILTERED_COMMENT_LIMIT: i64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub platform: Platform,
    pub external_id: String,
    pub display_name: Option<String>,
    pub handle: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub follower_count: Option<i64>,
    pub content_count: Option<i64>,
    pub view_count: Option<i64>,
    pub published_at: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub links: Option<String>,
    pub channel_type: Option<String>,
    pub ideology: Option<String>,
    pub last_content_published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub scraped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ContentItem {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub platform: Platform,
    pub external_id: String,
    pub account_id: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub repost_count: Option<i64>,
    pub live_status: Option<String>,
    pub duration: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
}

/// A content item joined with the fields of its owning account used for filtering.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ContentListing {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub item: ContentItem,
    pub account_external_id: Option<String>,
    pub account_name: Option<String>,
    pub channel_type: Option<String>,
    pub ideology: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Comment {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub platform: Platform,
    pub external_id: String,
    pub content_item_id: i64,
    pub parent_comment_id: Option<i64>,
    pub text: Option<String>,
    pub author_name: Option<String>,
    pub author_external_id: Option<String>,
    pub like_count: Option<i64>,
    pub reply_count: Option<i64>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct WatchedAccount {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub platform: Platform,
    pub account_external_id: String,
    pub display_name: Option<String>,
    pub trigger_text: String,
    pub is_active: bool,
    pub last_seen_item_id: Option<String>,
    pub channel_type: Option<String>,
    pub ideology: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DetectionEvent {
    pub id: i64,
    pub watched_account_id: i64,
    #[sqlx(try_from = "String")]
    pub platform: Platform,
    pub account_external_id: String,
    pub item_id: String,
    pub item_title: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: DetectionStatus,
    pub trigger_text: String,
    pub created_at: DateTime<Utc>,
}

/// Normalized account fields to merge; `None` keeps the stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountUpsert {
    pub platform: Platform,
    pub external_id: String,
    pub display_name: Option<String>,
    pub handle: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub follower_count: Option<i64>,
    pub content_count: Option<i64>,
    pub view_count: Option<i64>,
    pub published_at: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub links: Option<String>,
    pub channel_type: Option<String>,
    pub ideology: Option<String>,
    pub last_content_published_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentUpsert {
    pub platform: Platform,
    pub external_id: String,
    pub account_id: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub repost_count: Option<i64>,
    pub live_status: Option<String>,
    pub duration: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommentUpsert {
    pub platform: Platform,
    pub external_id: String,
    pub content_item_id: i64,
    pub parent_comment_id: Option<i64>,
    pub text: Option<String>,
    pub author_name: Option<String>,
    pub author_external_id: Option<String>,
    pub like_count: Option<i64>,
    pub reply_count: Option<i64>,
    pub published_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchUpsert {
    pub platform: Platform,
    pub account_external_id: String,
    pub display_name: Option<String>,
    pub trigger_text: String,
    pub channel_type: Option<String>,
    pub ideology: Option<String>,
    /// Cursor to seed; `None` keeps whatever cursor the row already has.
    pub seed_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDetectionEvent {
    pub watched_account_id: i64,
    pub platform: Platform,
    pub account_external_id: String,
    pub item_id: String,
    pub item_title: Option<String>,
    pub status: DetectionStatus,
    pub trigger_text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountFilter {
    pub platform: Option<Platform>,
    pub channel_type: Option<String>,
    pub ideology: Option<String>,
}

/// Case-insensitive substring filters over the owning account, combined with AND.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentFilter {
    pub platform: Option<Platform>,
    pub channel_type: Option<String>,
    pub ideology: Option<String>,
    pub channel_name: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentLevel {
    TopLevel,
    Replies,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommentFilter {
    pub platform: Platform,
    pub level: CommentLevel,
    pub content_item_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database at `database_url` and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // each in-memory connection is its own database
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("applying migrations")
    }

    // ===== Accounts =====

    pub async fn upsert_account(&self, row: &AccountUpsert) -> Result<Account> {
        sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (
                platform, external_id, display_name, handle, description, avatar_url,
                follower_count, content_count, view_count, published_at, location, links,
                channel_type, ideology, last_content_published_at, created_at, scraped_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
            ON CONFLICT (platform, external_id) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, accounts.display_name),
                handle = COALESCE(excluded.handle, accounts.handle),
                description = COALESCE(excluded.description, accounts.description),
                avatar_url = COALESCE(excluded.avatar_url, accounts.avatar_url),
                follower_count = COALESCE(excluded.follower_count, accounts.follower_count),
                content_count = COALESCE(excluded.content_count, accounts.content_count),
                view_count = COALESCE(excluded.view_count, accounts.view_count),
                published_at = COALESCE(excluded.published_at, accounts.published_at),
                location = COALESCE(excluded.location, accounts.location),
                links = COALESCE(excluded.links, accounts.links),
                channel_type = COALESCE(excluded.channel_type, accounts.channel_type),
                ideology = COALESCE(excluded.ideology, accounts.ideology),
                last_content_published_at = COALESCE(excluded.last_content_published_at, accounts.last_content_published_at),
                scraped_at = excluded.scraped_at
            RETURNING *
            "#,
        )
        .bind(row.platform.as_str())
        .bind(&row.external_id)
        .bind(&row.display_name)
        .bind(&row.handle)
        .bind(&row.description)
        .bind(&row.avatar_url)
        .bind(row.follower_count)
        .bind(row.content_count)
        .bind(row.view_count)
        .bind(row.published_at)
        .bind(&row.location)
        .bind(&row.links)
        .bind(&row.channel_type)
        .bind(&row.ideology)
        .bind(row.last_content_published_at)
        .bind(row.scraped_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upserting account {}:{}", row.platform, row.external_id))
    }

    /// Insert-or-fetch a minimal account row and return its surrogate key.
    ///
    /// An existing row is left untouched except that a missing display name is filled in.
    pub async fn ensure_account_stub(
        &self,
        platform: Platform,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO accounts (platform, external_id, display_name, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (platform, external_id) DO UPDATE SET
                display_name = COALESCE(accounts.display_name, excluded.display_name)
            RETURNING id
            "#,
        )
        .bind(platform.as_str())
        .bind(external_id)
        .bind(display_name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("ensuring account {platform}:{external_id}"))
    }

    pub async fn set_account_tags(
        &self,
        platform: Platform,
        external_id: &str,
        channel_type: Option<&str>,
        ideology: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
               SET channel_type = COALESCE(?3, channel_type),
                   ideology = COALESCE(?4, ideology)
             WHERE platform = ?1 AND external_id = ?2
            "#,
        )
        .bind(platform.as_str())
        .bind(external_id)
        .bind(channel_type)
        .bind(ideology)
        .execute(&self.pool)
        .await
        .context("updating account tags")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_account(&self, platform: Platform, external_id: &str) -> Result<Option<Account>> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE platform = ? AND external_id = ?")
            .bind(platform.as_str())
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching account")
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching account by id")
    }

    /// Accounts, most recently scraped first; never-scraped stubs last.
    pub async fn list_accounts(&self, filter: &AccountFilter) -> Result<Vec<Account>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM accounts WHERE 1 = 1");
        if let Some(platform) = filter.platform {
            qb.push(" AND platform = ").push_bind(platform.as_str());
        }
        if let Some(channel_type) = &filter.channel_type {
            qb.push(" AND channel_type = ").push_bind(channel_type.clone());
        }
        if let Some(ideology) = &filter.ideology {
            qb.push(" AND ideology = ").push_bind(ideology.clone());
        }
        qb.push(" ORDER BY scraped_at IS NULL, scraped_at DESC, id DESC");
        qb.build_query_as::<Account>()
            .fetch_all(&self.pool)
            .await
            .context("listing accounts")
    }

    pub async fn count_accounts(&self, platform: Platform) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM accounts WHERE platform = ?")
            .bind(platform.as_str())
            .fetch_one(&self.pool)
            .await
            .context("counting accounts")
    }

    // ===== Content items =====

    pub async fn upsert_content_item(&self, row: &ContentUpsert) -> Result<ContentItem> {
        sqlx::query_as::<_, ContentItem>(
            r#"
            INSERT INTO content_items (
                platform, external_id, account_id, title, description, view_count, like_count,
                comment_count, repost_count, live_status, duration, published_at, created_at, scraped_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            ON CONFLICT (platform, external_id) DO UPDATE SET
                account_id = COALESCE(excluded.account_id, content_items.account_id),
                title = COALESCE(excluded.title, content_items.title),
                description = COALESCE(excluded.description, content_items.description),
                view_count = COALESCE(excluded.view_count, content_items.view_count),
                like_count = COALESCE(excluded.like_count, content_items.like_count),
                comment_count = COALESCE(excluded.comment_count, content_items.comment_count),
                repost_count = COALESCE(excluded.repost_count, content_items.repost_count),
                live_status = COALESCE(excluded.live_status, content_items.live_status),
                duration = COALESCE(excluded.duration, content_items.duration),
                published_at = COALESCE(excluded.published_at, content_items.published_at),
                scraped_at = excluded.scraped_at
            RETURNING *
            "#,
        )
        .bind(row.platform.as_str())
        .bind(&row.external_id)
        .bind(row.account_id)
        .bind(&row.title)
        .bind(&row.description)
        .bind(row.view_count)
        .bind(row.like_count)
        .bind(row.comment_count)
        .bind(row.repost_count)
        .bind(&row.live_status)
        .bind(&row.duration)
        .bind(row.published_at)
        .bind(row.scraped_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upserting content item {}:{}", row.platform, row.external_id))
    }

    pub async fn find_content_item(
        &self,
        platform: Platform,
        external_id: &str,
    ) -> Result<Option<ContentItem>> {
        sqlx::query_as::<_, ContentItem>(
            "SELECT * FROM content_items WHERE platform = ? AND external_id = ?",
        )
        .bind(platform.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching content item")
    }

    /// Items of one account, newest published first.
    pub async fn list_items_for_account(&self, account_id: i64) -> Result<Vec<ContentItem>> {
        sqlx::query_as::<_, ContentItem>(
            r#"
            SELECT * FROM content_items
             WHERE account_id = ?
             ORDER BY published_at IS NULL, published_at DESC, id DESC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("listing content items for account")
    }

    pub async fn list_content_items(&self, filter: &ContentFilter) -> Result<Vec<ContentListing>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT c.*,
                   a.external_id AS account_external_id,
                   a.display_name AS account_name,
                   a.channel_type AS channel_type,
                   a.ideology AS ideology
              FROM content_items c
              LEFT JOIN accounts a ON a.id = c.account_id
             WHERE 1 = 1
            "#,
        );
        if let Some(platform) = filter.platform {
            qb.push(" AND c.platform = ").push_bind(platform.as_str());
        }
        if let Some(channel_type) = &filter.channel_type {
            qb.push(" AND a.channel_type LIKE ")
                .push_bind(like_pattern(channel_type))
                .push(LIKE_ESCAPE);
        }
        if let Some(ideology) = &filter.ideology {
            qb.push(" AND a.ideology LIKE ")
                .push_bind(like_pattern(ideology))
                .push(LIKE_ESCAPE);
        }
        if let Some(channel_name) = &filter.channel_name {
            qb.push(" AND a.display_name LIKE ")
                .push_bind(like_pattern(channel_name))
                .push(LIKE_ESCAPE);
        }
        qb.push(" ORDER BY c.published_at IS NULL, c.published_at DESC, c.id DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(500).clamp(1, 5000));
        qb.build_query_as::<ContentListing>()
            .fetch_all(&self.pool)
            .await
            .context("listing content items")
    }

    pub async fn count_content_items(&self, platform: Platform) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM content_items WHERE platform = ?")
            .bind(platform.as_str())
            .fetch_one(&self.pool)
            .await
            .context("counting content items")
    }

    // ===== Comments =====

    pub async fn upsert_comment(&self, row: &CommentUpsert) -> Result<Comment> {
        sqlx::query_as::<_, Comment>(
            r#"
            INSERT INTO comments (
                platform, external_id, content_item_id, parent_comment_id, text, author_name,
                author_external_id, like_count, reply_count, published_at, created_at, scraped_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
            ON CONFLICT (platform, external_id) DO UPDATE SET
                content_item_id = excluded.content_item_id,
                parent_comment_id = COALESCE(excluded.parent_comment_id, comments.parent_comment_id),
                text = COALESCE(excluded.text, comments.text),
                author_name = COALESCE(excluded.author_name, comments.author_name),
                author_external_id = COALESCE(excluded.author_external_id, comments.author_external_id),
                like_count = COALESCE(excluded.like_count, comments.like_count),
                reply_count = COALESCE(excluded.reply_count, comments.reply_count),
                published_at = COALESCE(excluded.published_at, comments.published_at),
                scraped_at = excluded.scraped_at
            RETURNING *
            "#,
        )
        .bind(row.platform.as_str())
        .bind(&row.external_id)
        .bind(row.content_item_id)
        .bind(row.parent_comment_id)
        .bind(&row.text)
        .bind(&row.author_name)
        .bind(&row.author_external_id)
        .bind(row.like_count)
        .bind(row.reply_count)
        .bind(row.published_at)
        .bind(row.scraped_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upserting comment {}:{}", row.platform, row.external_id))
    }

    /// Both levels of comments on one item, oldest first so replies follow their parents.
    pub async fn list_comments_for_item(&self, content_item_id: i64) -> Result<Vec<Comment>> {
        sqlx::query_as::<_, Comment>(
            r#"
            SELECT * FROM comments
             WHERE content_item_id = ?
             ORDER BY published_at IS NULL, published_at ASC, id ASC
            "#,
        )
        .bind(content_item_id)
        .fetch_all(&self.pool)
        .await
        .context("listing comments for item")
    }

    /// Comments of one level, newest first; capped when not filtered by item.
    pub async fn list_comments(&self, filter: &CommentFilter) -> Result<Vec<Comment>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM comments WHERE platform = ");
        qb.push_bind(filter.platform.as_str());
        match filter.level {
            CommentLevel::TopLevel => qb.push(" AND parent_comment_id IS NULL"),
            CommentLevel::Replies => qb.push(" AND parent_comment_id IS NOT NULL"),
        };
        if let Some(item_id) = filter.content_item_id {
            qb.push(" AND content_item_id = ").push_bind(item_id);
        }
        qb.push(" ORDER BY published_at IS NULL, published_at DESC, id DESC");
        if filter.content_item_id.is_none() {
            qb.push(" LIMIT ").push_bind(UNFILTERED_COMMENT_LIMIT);
        }
        qb.build_query_as::<Comment>()
            .fetch_all(&self.pool)
            .await
            .context("listing comments")
    }

    pub async fn count_comments(&self, platform: Platform) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM comments WHERE platform = ?")
            .bind(platform.as_str())
            .fetch_one(&self.pool)
            .await
            .context("counting comments")
    }

    // ===== Watch list =====

    /// Create or reactivate a watched account.
    pub async fn upsert_watched(&self, row: &WatchUpsert) -> Result<WatchedAccount> {
        let now = Utc::now();
        sqlx::query_as::<_, WatchedAccount>(
            r#"
            INSERT INTO watched_accounts (
                platform, account_external_id, display_name, trigger_text, is_active,
                last_seen_item_id, channel_type, ideology, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8, ?8)
            ON CONFLICT (platform, account_external_id) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, watched_accounts.display_name),
                trigger_text = excluded.trigger_text,
                is_active = 1,
                last_seen_item_id = COALESCE(excluded.last_seen_item_id, watched_accounts.last_seen_item_id),
                channel_type = COALESCE(excluded.channel_type, watched_accounts.channel_type),
                ideology = COALESCE(excluded.ideology, watched_accounts.ideology),
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(row.platform.as_str())
        .bind(&row.account_external_id)
        .bind(&row.display_name)
        .bind(&row.trigger_text)
        .bind(&row.seed_cursor)
        .bind(&row.channel_type)
        .bind(&row.ideology)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .with_context(|| {
            format!(
                "upserting watched account {}:{}",
                row.platform, row.account_external_id
            )
        })
    }

    pub async fn get_watched(&self, id: i64) -> Result<Option<WatchedAccount>> {
        sqlx::query_as::<_, WatchedAccount>("SELECT * FROM watched_accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching watched account")
    }

    pub async fn list_watched(&self) -> Result<Vec<WatchedAccount>> {
        sqlx::query_as::<_, WatchedAccount>(
            "SELECT * FROM watched_accounts ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing watched accounts")
    }

    /// Active rows, least recently checked first.
    pub async fn list_active_watched(&self) -> Result<Vec<WatchedAccount>> {
        sqlx::query_as::<_, WatchedAccount>(
            r#"
            SELECT * FROM watched_accounts
             WHERE is_active = 1
             ORDER BY last_checked_at IS NOT NULL, last_checked_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing active watched accounts")
    }

    pub async fn set_watch_active(&self, id: i64, active: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE watched_accounts SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(active)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("updating watched account status")?;
        Ok(result.rows_affected() > 0)
    }

    /// Hard delete; detection events go with it.
    pub async fn delete_watched(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM watched_accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting watched account")?;
        Ok(result.rows_affected() > 0)
    }

    // ===== Detection events =====

    /// Most recent events first, optionally only those created at or after `since`.
    pub async fn list_detection_events(
        &self,
        limit: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DetectionEvent>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM detection_events WHERE 1 = 1");
        if let Some(since) = since {
            qb.push(" AND created_at >= ").push_bind(since);
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit.max(1));
        qb.build_query_as::<DetectionEvent>()
            .fetch_all(&self.pool)
            .await
            .context("listing detection events")
    }

    pub async fn events_for_watched(&self, watched_account_id: i64) -> Result<Vec<DetectionEvent>> {
        sqlx::query_as::<_, DetectionEvent>(
            "SELECT * FROM detection_events WHERE watched_account_id = ? ORDER BY id ASC",
        )
        .bind(watched_account_id)
        .fetch_all(&self.pool)
        .await
        .context("listing detection events for watched account")
    }
}

/// Compare-and-set the cursor of an active watched account.
///
/// Returns `false` when the stored cursor no longer equals `expected` (another
/// writer advanced or reseeded it) or the row was deactivated.
pub async fn advance_cursor<'e, E>(
    executor: E,
    watched_account_id: i64,
    expected: Option<&str>,
    next: &str,
    now: DateTime<Utc>,
) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE watched_accounts
           SET last_seen_item_id = ?1, last_checked_at = ?2, updated_at = ?2
         WHERE id = ?3 AND is_active = 1 AND last_seen_item_id IS ?4
        "#,
    )
    .bind(next)
    .bind(now)
    .bind(watched_account_id)
    .bind(expected)
    .execute(executor)
    .await
    .context("advancing watch cursor")?;
    Ok(result.rows_affected() == 1)
}

pub async fn touch_watch_checked<'e, E>(
    executor: E,
    watched_account_id: i64,
    now: DateTime<Utc>,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE watched_accounts SET last_checked_at = ?1 WHERE id = ?2")
        .bind(now)
        .bind(watched_account_id)
        .execute(executor)
        .await
        .context("stamping watched account check time")?;
    Ok(())
}

pub async fn insert_detection_event<'e, E>(
    executor: E,
    event: &NewDetectionEvent,
) -> Result<DetectionEvent>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, DetectionEvent>(
        r#"
        INSERT INTO detection_events (
            watched_account_id, platform, account_external_id, item_id, item_title,
            status, trigger_text, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        RETURNING *
        "#,
    )
    .bind(event.watched_account_id)
    .bind(event.platform.as_str())
    .bind(&event.account_external_id)
    .bind(&event.item_id)
    .bind(&event.item_title)
    .bind(event.status.as_str())
    .bind(&event.trigger_text)
    .bind(Utc::now())
    .fetch_one(executor)
    .await
    .context("inserting detection event")
}

const LIKE_ESCAPE: &str = r" ESCAPE '\'";

/// Substring pattern with `%`, `_` and `\` in the needle matched literally.
fn like_pattern(needle: &str) -> String {
    let mut pattern = String::from("%");
    for c in needle.trim().chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_row(external_id: &str, name: &str) -> AccountUpsert {
        AccountUpsert {
            platform: Platform::YouTube,
            external_id: external_id.to_string(),
            display_name: Some(name.to_string()),
            handle: None,
            description: Some("about".into()),
            avatar_url: None,
            follower_count: Some(10),
            content_count: Some(3),
            view_count: None,
            published_at: None,
            location: None,
            links: None,
            channel_type: None,
            ideology: None,
            last_content_published_at: None,
            scraped_at: Utc::now(),
        }
    }

    fn content_row(external_id: &str, account_id: i64) -> ContentUpsert {
        ContentUpsert {
            platform: Platform::YouTube,
            external_id: external_id.to_string(),
            account_id: Some(account_id),
            title: Some(format!("video {external_id}")),
            description: None,
            view_count: Some(100),
            like_count: Some(5),
            comment_count: Some(1),
            repost_count: None,
            live_status: Some("none".into()),
            duration: Some("PT5M".into()),
            published_at: Some(Utc::now()),
            scraped_at: Utc::now(),
        }
    }

    fn watch_row(external_id: &str) -> WatchUpsert {
        WatchUpsert {
            platform: Platform::YouTube,
            account_external_id: external_id.to_string(),
            display_name: Some("Channel".into()),
            trigger_text: "first!".into(),
            channel_type: None,
            ideology: None,
            seed_cursor: None,
        }
    }

    #[tokio::test]
    async fn account_upsert_updates_in_place_and_keeps_absent_fields() {
        let store = Store::in_memory().await.unwrap();
        let first = store.upsert_account(&account_row("UC1", "One")).await.unwrap();

        let mut second_row = account_row("UC1", "One Renamed");
        second_row.description = None;
        second_row.follower_count = Some(7);
        let second = store.upsert_account(&second_row).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.display_name.as_deref(), Some("One Renamed"));
        assert_eq!(second.description.as_deref(), Some("about"));
        assert_eq!(second.follower_count, Some(7));
        assert_eq!(store.count_accounts(Platform::YouTube).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn account_stub_is_insert_or_fetch() {
        let store = Store::in_memory().await.unwrap();
        let a = store
            .ensure_account_stub(Platform::Twitter, "nasa", Some("NASA"))
            .await
            .unwrap();
        let b = store
            .ensure_account_stub(Platform::Twitter, "nasa", Some("Other"))
            .await
            .unwrap();
        assert_eq!(a, b);
        let account = store.find_account(Platform::Twitter, "nasa").await.unwrap().unwrap();
        assert_eq!(account.display_name.as_deref(), Some("NASA"));
        assert_eq!(account.scraped_at, None);
    }

    #[tokio::test]
    async fn deleting_a_watched_account_cascades_to_its_events() {
        let store = Store::in_memory().await.unwrap();
        let watched = store.upsert_watched(&watch_row("UC1")).await.unwrap();
        let other = store.upsert_watched(&watch_row("UC2")).await.unwrap();

        for w in [&watched, &other] {
            insert_detection_event(
                store.pool(),
                &NewDetectionEvent {
                    watched_account_id: w.id,
                    platform: w.platform,
                    account_external_id: w.account_external_id.clone(),
                    item_id: "v1".into(),
                    item_title: None,
                    status: DetectionStatus::Pending,
                    trigger_text: w.trigger_text.clone(),
                },
            )
            .await
            .unwrap();
        }

        assert!(store.delete_watched(watched.id).await.unwrap());
        assert!(store.events_for_watched(watched.id).await.unwrap().is_empty());
        assert_eq!(store.events_for_watched(other.id).await.unwrap().len(), 1);
        assert!(!store.delete_watched(watched.id).await.unwrap());
    }

    #[tokio::test]
    async fn cursor_compare_and_set_rejects_stale_expectations() {
        let store = Store::in_memory().await.unwrap();
        let watched = store.upsert_watched(&watch_row("UC1")).await.unwrap();

        assert!(advance_cursor(store.pool(), watched.id, None, "v1", Utc::now()).await.unwrap());
        assert!(!advance_cursor(store.pool(), watched.id, None, "v2", Utc::now()).await.unwrap());
        assert!(advance_cursor(store.pool(), watched.id, Some("v1"), "v2", Utc::now()).await.unwrap());

        store.set_watch_active(watched.id, false).await.unwrap();
        assert!(!advance_cursor(store.pool(), watched.id, Some("v2"), "v3", Utc::now()).await.unwrap());

        let row = store.get_watched(watched.id).await.unwrap().unwrap();
        assert_eq!(row.last_seen_item_id.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn reactivation_keeps_cursor_unless_reseeded() {
        let store = Store::in_memory().await.unwrap();
        let mut row = watch_row("UC1");
        row.seed_cursor = Some("v1".into());
        let created = store.upsert_watched(&row).await.unwrap();
        store.set_watch_active(created.id, false).await.unwrap();

        row.seed_cursor = None;
        row.trigger_text = "new text".into();
        let again = store.upsert_watched(&row).await.unwrap();
        assert_eq!(again.id, created.id);
        assert!(again.is_active);
        assert_eq!(again.trigger_text, "new text");
        assert_eq!(again.last_seen_item_id.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn content_filters_compose_with_and() {
        let store = Store::in_memory().await.unwrap();
        let news = store.upsert_account(&account_row("UC1", "Daily News")).await.unwrap();
        let tech = store.upsert_account(&account_row("UC2", "Tech News")).await.unwrap();
        let other = store.upsert_account(&account_row("UC3", "Daily Vlog")).await.unwrap();
        store.set_account_tags(Platform::YouTube, "UC1", Some("news"), Some("left")).await.unwrap();
        store.set_account_tags(Platform::YouTube, "UC2", Some("news"), Some("right")).await.unwrap();
        store.set_account_tags(Platform::YouTube, "UC3", Some("vlog"), Some("left")).await.unwrap();

        for (vid, account) in [("a", &news), ("b", &tech), ("c", &other)] {
            store.upsert_content_item(&content_row(vid, account.id)).await.unwrap();
        }

        let filter = ContentFilter {
            platform: Some(Platform::YouTube),
            channel_type: Some("NEW".into()),
            ideology: Some("left".into()),
            ..Default::default()
        };
        let rows = store.list_content_items(&filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item.external_id, "a");
        assert_eq!(rows[0].account_name.as_deref(), Some("Daily News"));

        let by_name = ContentFilter {
            channel_name: Some("daily".into()),
            ..Default::default()
        };
        let mut ids: Vec<_> = store
            .list_content_items(&by_name)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.item.external_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn like_wildcards_in_needles_are_escaped() {
        assert_eq!(like_pattern(" news "), "%news%");
        assert_eq!(like_pattern("50%"), r"%50\%%");
        assert_eq!(like_pattern(r"a_b\c"), r"%a\_b\\c%");
    }

    #[tokio::test]
    async fn name_filter_treats_percent_and_underscore_literally() {
        let store = Store::in_memory().await.unwrap();
        let percent = store.upsert_account(&account_row("UC1", "Fifty 50% Off")).await.unwrap();
        let plain = store.upsert_account(&account_row("UC2", "Top 500 Hits")).await.unwrap();
        let underscore = store.upsert_account(&account_row("UC3", "dev_log")).await.unwrap();
        let lookalike = store.upsert_account(&account_row("UC4", "devXlogX")).await.unwrap();
        for (vid, account) in [("a", &percent), ("b", &plain), ("c", &underscore), ("d", &lookalike)] {
            store.upsert_content_item(&content_row(vid, account.id)).await.unwrap();
        }

        let names = |needle: &str| ContentFilter {
            channel_name: Some(needle.into()),
            ..Default::default()
        };
        let rows = store.list_content_items(&names("50%")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item.external_id, "a");

        let rows = store.list_content_items(&names("DEV_")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item.external_id, "c");
    }

    #[tokio::test]
    async fn unfiltered_comment_listing_is_capped() {
        let store = Store::in_memory().await.unwrap();
        let account = store.upsert_account(&account_row("UC1", "One")).await.unwrap();
        let item = store.upsert_content_item(&content_row("v1", account.id)).await.unwrap();
        for n in 0..(UNFILTERED_COMMENT_LIMIT + 5) {
            store
                .upsert_comment(&CommentUpsert {
                    platform: Platform::YouTube,
                    external_id: format!("c{n}"),
                    content_item_id: item.id,
                    parent_comment_id: None,
                    text: Some("hi".into()),
                    author_name: None,
                    author_external_id: None,
                    like_count: Some(0),
                    reply_count: None,
                    published_at: None,
                    scraped_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let unfiltered = store
            .list_comments(&CommentFilter {
                platform: Platform::YouTube,
                level: CommentLevel::TopLevel,
                content_item_id: None,
            })
            .await
            .unwrap();
        assert_eq!(unfiltered.len() as i64, UNFILTERED_COMMENT_LIMIT);

        let filtered = store
            .list_comments(&CommentFilter {
                platform: Platform::YouTube,
                level: CommentLevel::TopLevel,
                content_item_id: Some(item.id),
            })
            .await
            .unwrap();
        assert_eq!(filtered.len() as i64, UNFILTERED_COMMENT_LIMIT + 5);
    }

    #[tokio::test]
    async fn file_backed_store_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("pcw.db").display());
        {
            let store = Store::connect(&url).await.unwrap();
            store.upsert_account(&account_row("UC1", "One")).await.unwrap();
            store.pool().close().await;
        }
        let store = Store::connect(&url).await.unwrap();
        assert_eq!(store.count_accounts(Platform::YouTube).await.unwrap(), 1);
    }
}
