//! YouTube Data API v3 client.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pcw_core::{AccountDraft, CommentDraft, CommentThread, ContentDraft, Platform};
use pcw_storage::{ApiAuth, FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{json_at, json_i64, json_string, AdapterError, CommentPaging, PlatformAdapter};

pub const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const SOURCE_ID: &str = "youtube";
/// `playlistItems` and `videos` both cap a page at 50.
const MAX_PAGE: usize = 50;

/// Channel ids are 24 characters and start with `UC`; anything else is a handle or name.
pub fn looks_like_channel_id(identifier: &str) -> bool {
    identifier.starts_with("UC") && identifier.len() == 24
}

#[derive(Debug, Clone)]
pub struct YouTubeClient {
    http: Arc<HttpFetcher>,
    auth: ApiAuth,
    base_url: String,
}

impl YouTubeClient {
    pub fn new(http: Arc<HttpFetcher>, api_key: String) -> Self {
        Self {
            http,
            auth: ApiAuth::QueryKey {
                param: "key",
                value: api_key,
            },
            base_url: YOUTUBE_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn get(&self, resource: &str, query: &[(&str, String)]) -> Result<JsonValue, AdapterError> {
        let url = format!("{}/{resource}", self.base_url);
        Ok(self.http.get_json(SOURCE_ID, &url, query, &self.auth).await?)
    }

    async fn search_channel(&self, q: &str) -> Result<Option<String>, AdapterError> {
        let response = self
            .get(
                "search",
                &[
                    ("part", "id".into()),
                    ("type", "channel".into()),
                    ("maxResults", "1".into()),
                    ("q", q.to_string()),
                ],
            )
            .await?;
        Ok(first_item(&response).and_then(|item| json_string(item, &["id", "channelId"])))
    }

    /// Resolve a channel id, trying the handle with a leading `@` before the bare text.
    pub async fn resolve_channel_id(&self, identifier: &str) -> Result<Option<String>, AdapterError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Ok(None);
        }
        if looks_like_channel_id(identifier) {
            return Ok(Some(identifier.to_string()));
        }

        let handle = if identifier.starts_with('@') {
            identifier.to_string()
        } else {
            format!("@{identifier}")
        };
        if let Some(id) = self.search_channel(&handle).await? {
            return Ok(Some(id));
        }
        debug!(identifier, "handle search found nothing, retrying as plain query");
        self.search_channel(identifier.trim_start_matches('@')).await
    }

    async fn channel_resource(&self, channel_id: &str, part: &str) -> Result<Option<JsonValue>, AdapterError> {
        let response = self
            .get("channels", &[("part", part.to_string()), ("id", channel_id.to_string())])
            .await?;
        Ok(first_item(&response).cloned())
    }

    async fn videos(&self, ids: &[String]) -> Result<Vec<ContentDraft>, AdapterError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .get(
                "videos",
                &[
                    ("part", "snippet,statistics,contentDetails".into()),
                    ("id", ids.join(",")),
                ],
            )
            .await?;
        Ok(items(&response).filter_map(parse_video).collect())
    }

    async fn comment_thread_pages(
        &self,
        video_id: &str,
        paging: CommentPaging,
    ) -> Result<Vec<CommentThread>, AdapterError> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        for _ in 0..paging.pages {
            let mut query = vec![
                ("part", "snippet,replies".to_string()),
                ("videoId", video_id.to_string()),
                ("maxResults", paging.max_results.to_string()),
                ("textFormat", "plainText".to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let response = self.get("commentThreads", &query).await?;
            out.extend(items(&response).filter_map(parse_comment_thread));

            page_token = json_string(&response, &["nextPageToken"]);
            if page_token.is_none() {
                break;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl PlatformAdapter for YouTubeClient {
    fn platform(&self) -> Platform {
        Platform::YouTube
    }

    async fn fetch_account(&self, identifier: &str) -> Result<Option<AccountDraft>, AdapterError> {
        let Some(channel_id) = self.resolve_channel_id(identifier).await? else {
            return Ok(None);
        };
        let item = self
            .channel_resource(&channel_id, "snippet,statistics,contentDetails,brandingSettings")
            .await?;
        Ok(item.as_ref().and_then(parse_channel))
    }

    async fn fetch_content(&self, content_id: &str) -> Result<Option<ContentDraft>, AdapterError> {
        let mut videos = self.videos(&[content_id.trim().to_string()]).await?;
        Ok(videos.pop())
    }

    async fn fetch_recent_content(
        &self,
        account_external_id: &str,
        limit: usize,
    ) -> Result<Vec<ContentDraft>, AdapterError> {
        let Some(channel) = self.channel_resource(account_external_id, "contentDetails").await? else {
            return Ok(Vec::new());
        };
        let Some(playlist_id) = uploads_playlist_id(&channel) else {
            return Ok(Vec::new());
        };

        let playlist = self
            .get(
                "playlistItems",
                &[
                    ("part", "contentDetails".into()),
                    ("playlistId", playlist_id),
                    ("maxResults", limit.clamp(1, MAX_PAGE).to_string()),
                ],
            )
            .await?;
        let ids: Vec<String> = items(&playlist)
            .filter_map(|item| json_string(item, &["contentDetails", "videoId"]))
            .collect();

        let position: HashMap<&str, usize> =
            ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        let mut videos = self.videos(&ids).await?;
        videos.sort_by_key(|v| position.get(v.external_id.as_str()).copied().unwrap_or(usize::MAX));
        sort_newest_first(&mut videos);
        videos.truncate(limit);
        Ok(videos)
    }

    async fn fetch_comment_threads(
        &self,
        content_id: &str,
        paging: CommentPaging,
    ) -> Result<Vec<CommentThread>, AdapterError> {
        match self.comment_thread_pages(content_id, paging).await {
            // comments disabled on the video
            Err(AdapterError::Fetch(FetchError::HttpStatus { status: 403, .. })) => Ok(Vec::new()),
            other => other,
        }
    }

    async fn fetch_replies(
        &self,
        comment_external_id: &str,
        max_results: u32,
    ) -> Result<Vec<CommentDraft>, AdapterError> {
        let response = self
            .get(
                "comments",
                &[
                    ("part", "snippet".into()),
                    ("parentId", comment_external_id.to_string()),
                    ("maxResults", max_results.clamp(1, 100).to_string()),
                    ("textFormat", "plainText".into()),
                ],
            )
            .await?;
        Ok(items(&response).filter_map(parse_comment).collect())
    }
}

fn items<'a>(response: &'a JsonValue) -> impl Iterator<Item = &'a JsonValue> + 'a {
    response
        .get("items")
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten()
}

fn first_item(response: &JsonValue) -> Option<&JsonValue> {
    items(response).next()
}

fn published(draft: &ContentDraft) -> Option<DateTime<Utc>> {
    let raw = draft.published_at.as_deref()?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// Newest `publishedAt` first. Stable, so undated or tied videos keep their
/// incoming order and undated ones sort last.
pub fn sort_newest_first(videos: &mut [ContentDraft]) {
    videos.sort_by_key(|video| Reverse(published(video)));
}

pub fn uploads_playlist_id(channel: &JsonValue) -> Option<String> {
    json_string(channel, &["contentDetails", "relatedPlaylists", "uploads"])
}

pub fn parse_channel(item: &JsonValue) -> Option<AccountDraft> {
    let id = json_string(item, &["id"])?;
    let mut draft = AccountDraft::new(Platform::YouTube, id);
    draft.display_name = json_string(item, &["snippet", "title"]);
    draft.handle = json_string(item, &["snippet", "customUrl"]);
    draft.description = json_string(item, &["snippet", "description"]);
    draft.avatar_url = json_string(item, &["snippet", "thumbnails", "high", "url"])
        .or_else(|| json_string(item, &["snippet", "thumbnails", "default", "url"]));
    draft.published_at = json_string(item, &["snippet", "publishedAt"]);
    draft.location = json_string(item, &["snippet", "country"]);
    draft.follower_count = json_i64(item, &["statistics", "subscriberCount"]);
    draft.view_count = json_i64(item, &["statistics", "viewCount"]);
    draft.content_count = json_i64(item, &["statistics", "videoCount"]);
    draft.links = json_string(item, &["brandingSettings", "channel", "keywords"]);
    Some(draft)
}

pub fn parse_video(item: &JsonValue) -> Option<ContentDraft> {
    let id = json_string(item, &["id"])?;
    let mut draft = ContentDraft::new(Platform::YouTube, id);
    draft.account_external_id = json_string(item, &["snippet", "channelId"]);
    draft.account_display_name = json_string(item, &["snippet", "channelTitle"]);
    draft.title = json_string(item, &["snippet", "title"]);
    draft.description = json_string(item, &["snippet", "description"]);
    draft.published_at = json_string(item, &["snippet", "publishedAt"]);
    draft.live_status = json_string(item, &["snippet", "liveBroadcastContent"]);
    draft.duration = json_string(item, &["contentDetails", "duration"]);
    draft.view_count = json_i64(item, &["statistics", "viewCount"]);
    draft.like_count = json_i64(item, &["statistics", "likeCount"]);
    draft.comment_count = json_i64(item, &["statistics", "commentCount"]);
    Some(draft)
}

/// Parse a `comments` resource (a top-level comment snippet or a reply).
pub fn parse_comment(item: &JsonValue) -> Option<CommentDraft> {
    let id = json_string(item, &["id"])?;
    let snippet = json_at(item, &["snippet"])?;
    let mut draft = CommentDraft::new(Platform::YouTube, id);
    draft.text = json_string(snippet, &["textDisplay"]).or_else(|| json_string(snippet, &["textOriginal"]));
    draft.author_name = json_string(snippet, &["authorDisplayName"]);
    draft.author_external_id = json_string(snippet, &["authorChannelId", "value"]);
    draft.like_count = json_i64(snippet, &["likeCount"]);
    draft.published_at = json_string(snippet, &["publishedAt"]);
    Some(draft)
}

pub fn parse_comment_thread(item: &JsonValue) -> Option<CommentThread> {
    let top = json_at(item, &["snippet", "topLevelComment"])?;
    let mut comment = parse_comment(top)?;
    comment.reply_count = json_i64(item, &["snippet", "totalReplyCount"]);
    let replies = json_at(item, &["replies", "comments"])
        .and_then(JsonValue::as_array)
        .map(|arr| arr.iter().filter_map(parse_comment).collect())
        .unwrap_or_default();
    Some(CommentThread { comment, replies })
}
