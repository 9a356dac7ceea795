//! Twitter API v2 client (bearer-token app auth).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pcw_core::{AccountDraft, CommentDraft, CommentThread, ContentDraft, Platform};
use pcw_storage::{ApiAuth, HttpFetcher};
use serde_json::Value as JsonValue;

use crate::{json_at, json_i64, json_string, AdapterError, CommentPaging, PlatformAdapter};

pub const TWITTER_API_BASE: &str = "https://api.twitter.com/2";
const SOURCE_ID: &str = "twitter";
const TWEET_FIELDS: &str = "created_at,public_metrics,text,author_id,conversation_id";
const USER_FIELDS: &str = "username,name,description,profile_image_url,public_metrics,location,created_at,url";

/// Numeric post id from a status URL, or the input itself when there is none.
pub fn extract_tweet_id(url_or_id: &str) -> String {
    let trimmed = url_or_id.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return trimmed.to_string();
    }
    if let Some((_, rest)) = trimmed.split_once("status/") {
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        if !digits.is_empty() {
            return digits;
        }
    }
    trimmed.to_string()
}

#[derive(Debug, Clone)]
pub struct TwitterClient {
    http: Arc<HttpFetcher>,
    auth: ApiAuth,
    base_url: String,
}

impl TwitterClient {
    pub fn new(http: Arc<HttpFetcher>, bearer_token: String) -> Self {
        Self {
            http,
            auth: ApiAuth::Bearer(bearer_token),
            base_url: TWITTER_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// GET a v2 resource; a 404 comes back as `None`.
    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Option<JsonValue>, AdapterError> {
        let url = format!("{}/{path}", self.base_url);
        match self.http.get_json(SOURCE_ID, &url, query, &self.auth).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn lookup_user(&self, username: &str) -> Result<Option<JsonValue>, AdapterError> {
        let username = Platform::Twitter.normalize_account_id(username);
        if username.is_empty() {
            return Ok(None);
        }
        let response = self
            .get(
                &format!("users/by/username/{username}"),
                &[("user.fields", USER_FIELDS.into())],
            )
            .await?;
        // unknown users come back as 200 with an `errors` array and no `data`
        Ok(response.and_then(|r| r.get("data").cloned()))
    }

    /// Recent-search pages for `query`, each result as a flat comment.
    async fn search_comments(
        &self,
        query: String,
        max_results: u32,
        pages: u32,
    ) -> Result<Vec<CommentDraft>, AdapterError> {
        let mut out = Vec::new();
        let mut next_token: Option<String> = None;
        for _ in 0..pages.max(1) {
            let mut params = vec![
                ("query", query.clone()),
                ("max_results", max_results.clamp(10, 100).to_string()),
                ("tweet.fields", TWEET_FIELDS.to_string()),
                ("expansions", "author_id".to_string()),
                ("user.fields", "username,name".to_string()),
            ];
            if let Some(token) = &next_token {
                params.push(("next_token", token.clone()));
            }
            let Some(response) = self.get("tweets/search/recent", &params).await? else {
                break;
            };
            let users = included_users(&response);
            out.extend(data_array(&response).filter_map(|tweet| parse_reply(tweet, &users)));
            next_token = json_string(&response, &["meta", "next_token"]);
            if next_token.is_none() {
                break;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl PlatformAdapter for TwitterClient {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    async fn fetch_account(&self, identifier: &str) -> Result<Option<AccountDraft>, AdapterError> {
        Ok(self.lookup_user(identifier).await?.as_ref().and_then(parse_user))
    }

    async fn fetch_content(&self, content_id: &str) -> Result<Option<ContentDraft>, AdapterError> {
        let id = extract_tweet_id(content_id);
        let Some(response) = self
            .get(
                &format!("tweets/{id}"),
                &[
                    ("tweet.fields", TWEET_FIELDS.into()),
                    ("expansions", "author_id".into()),
                    ("user.fields", "username,name".into()),
                ],
            )
            .await?
        else {
            return Ok(None);
        };
        let users = included_users(&response);
        Ok(response.get("data").and_then(|tweet| parse_tweet(tweet, &users)))
    }

    async fn fetch_recent_content(
        &self,
        account_external_id: &str,
        limit: usize,
    ) -> Result<Vec<ContentDraft>, AdapterError> {
        let Some(user) = self.lookup_user(account_external_id).await? else {
            return Ok(Vec::new());
        };
        let Some(user_id) = json_string(&user, &["id"]) else {
            return Ok(Vec::new());
        };
        let Some(response) = self
            .get(
                &format!("users/{user_id}/tweets"),
                &[
                    ("max_results", limit.clamp(5, 100).to_string()),
                    ("exclude", "retweets,replies".into()),
                    ("tweet.fields", TWEET_FIELDS.into()),
                ],
            )
            .await?
        else {
            return Ok(Vec::new());
        };

        let mut authors = HashMap::new();
        if let Some((id, username, name)) = user_ref(&user) {
            authors.insert(id, (username, name));
        }
        let mut posts: Vec<ContentDraft> = data_array(&response)
            .filter_map(|tweet| parse_tweet(tweet, &authors))
            .collect();
        posts.truncate(limit);
        Ok(posts)
    }

    async fn fetch_comment_threads(
        &self,
        content_id: &str,
        paging: CommentPaging,
    ) -> Result<Vec<CommentThread>, AdapterError> {
        let id = extract_tweet_id(content_id);
        let replies = self
            .search_comments(format!("conversation_id:{id}"), paging.max_results, paging.pages)
            .await?;
        Ok(replies
            .into_iter()
            .filter(|reply| reply.external_id != id)
            .map(|comment| CommentThread {
                comment,
                replies: Vec::new(),
            })
            .collect())
    }

    async fn fetch_replies(
        &self,
        comment_external_id: &str,
        max_results: u32,
    ) -> Result<Vec<CommentDraft>, AdapterError> {
        let id = extract_tweet_id(comment_external_id);
        let mut replies = self
            .search_comments(format!("in_reply_to_tweet_id:{id}"), max_results, 1)
            .await?;
        replies.truncate(max_results as usize);
        Ok(replies)
    }
}

/// `author_id -> (username, display name)` from the `includes.users` expansion.
pub type UserIndex = HashMap<String, (String, Option<String>)>;

fn user_ref(user: &JsonValue) -> Option<(String, String, Option<String>)> {
    let id = json_string(user, &["id"])?;
    let username = json_string(user, &["username"])?;
    Some((id, username, json_string(user, &["name"])))
}

fn included_users(response: &JsonValue) -> UserIndex {
    json_at(response, &["includes", "users"])
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten()
        .filter_map(user_ref)
        .map(|(id, username, name)| (id, (username, name)))
        .collect()
}

fn data_array<'a>(response: &'a JsonValue) -> impl Iterator<Item = &'a JsonValue> + 'a {
    response
        .get("data")
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten()
}

pub fn parse_user(user: &JsonValue) -> Option<AccountDraft> {
    let username = json_string(user, &["username"])?;
    let mut draft = AccountDraft::new(
        Platform::Twitter,
        Platform::Twitter.normalize_account_id(&username),
    );
    draft.handle = Some(format!("@{username}"));
    draft.display_name = json_string(user, &["name"]);
    draft.description = json_string(user, &["description"]);
    draft.avatar_url = json_string(user, &["profile_image_url"]);
    draft.follower_count = json_i64(user, &["public_metrics", "followers_count"]);
    draft.content_count = json_i64(user, &["public_metrics", "tweet_count"]);
    draft.published_at = json_string(user, &["created_at"]);
    draft.location = json_string(user, &["location"]);
    draft.links = json_string(user, &["url"]);
    Some(draft)
}

pub fn parse_tweet(tweet: &JsonValue, users: &UserIndex) -> Option<ContentDraft> {
    let id = json_string(tweet, &["id"])?;
    let mut draft = ContentDraft::new(Platform::Twitter, id);
    if let Some((username, name)) = json_string(tweet, &["author_id"]).and_then(|a| users.get(&a)) {
        draft.account_external_id = Some(Platform::Twitter.normalize_account_id(username));
        draft.account_display_name = name.clone();
    }
    draft.description = json_string(tweet, &["text"]);
    draft.published_at = json_string(tweet, &["created_at"]);
    draft.like_count = json_i64(tweet, &["public_metrics", "like_count"]);
    draft.repost_count = json_i64(tweet, &["public_metrics", "retweet_count"]);
    draft.comment_count = json_i64(tweet, &["public_metrics", "reply_count"]);
    draft.view_count = json_i64(tweet, &["public_metrics", "impression_count"]);
    Some(draft)
}

pub fn parse_reply(tweet: &JsonValue, users: &UserIndex) -> Option<CommentDraft> {
    let id = json_string(tweet, &["id"])?;
    let mut draft = CommentDraft::new(Platform::Twitter, id);
    if let Some((username, name)) = json_string(tweet, &["author_id"]).and_then(|a| users.get(&a)) {
        draft.author_external_id = Some(Platform::Twitter.normalize_account_id(username));
        draft.author_name = name.clone().or_else(|| Some(username.clone()));
    }
    draft.text = json_string(tweet, &["text"]);
    draft.like_count = json_i64(tweet, &["public_metrics", "like_count"]);
    draft.reply_count = json_i64(tweet, &["public_metrics", "reply_count"]);
    draft.published_at = json_string(tweet, &["created_at"]);
    Some(draft)
}
