//! Axum JSON API: ingestion triggers, watch management and read projections.

use std::sync::Arc;

use axum::{
    extract::{rejection::PathRejection, Path, Query, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{TimeDelta, Utc};
use pcw_adapters::{extract_tweet_id, CommentPaging};
use pcw_core::Platform;
use pcw_storage::{
    Account, AccountFilter, Comment, CommentFilter, CommentLevel, ContentFilter, ContentItem,
    ContentListing, DetectionEvent, WatchedAccount,
};
use pcw_sync::{AccountTags, AuthorMatch, IngestError, StartWatching, SyncServices, TickSummary, WatchError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, info_span};

pub const CRATE_NAME: &str = "pcw-web";

const DEFAULT_LOG_LIMIT: i64 = 50;
const MAX_LOG_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub services: SyncServices,
}

impl AppState {
    pub fn new(services: SyncServices) -> Self {
        Self { services }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PCW_WEB_PORT")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(Self::default().port);
        Self { port }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/scrape/{identifier}", post(scrape_youtube_handler))
        .route("/scrape_twitter/{identifier}", post(scrape_twitter_handler))
        .route("/scrape_replies/{video_id}", post(scrape_replies_handler))
        .route(
            "/monitoring/channels",
            get(list_watched_handler).post(start_watching_handler),
        )
        .route("/monitoring/channels/{id}", delete(delete_watched_handler))
        .route("/monitoring/toggle", post(toggle_watch_handler))
        .route("/monitoring/status", get(watch_status_handler))
        .route("/monitoring/logs", get(watch_logs_handler))
        .route("/channels", get(list_channels_handler))
        .route("/channels/{id}", get(channel_detail_handler))
        .route("/videos/{id}", get(video_detail_handler))
        .route("/video_list", get(video_list_handler))
        .route("/comments", get(comments_handler))
        .route("/comment_replies", get(comment_replies_handler))
        .route("/twitter/accounts", get(list_twitter_accounts_handler))
        .route("/twitter/accounts/{username}", get(twitter_account_handler))
        .route("/twitter/posts/{id}", get(twitter_post_handler))
        .route("/twitter/replies", get(twitter_replies_handler))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                info_span!(
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }),
        )
}

pub async fn serve(state: AppState, config: WebConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "pcw web listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Error body is `{"detail": "..."}` with the matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    fn with_code(code: u16, detail: String) -> Self {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(%detail, "request failed");
        }
        Self::new(status, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        Self::with_code(err.status_code(), format!("{err:#}"))
    }
}

impl From<WatchError> for ApiError {
    fn from(err: WatchError) -> Self {
        Self::with_code(err.status_code(), format!("{err:#}"))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::with_code(500, format!("{err:#}"))
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// --- ingestion ---

#[derive(Debug, Default, Deserialize)]
struct ScrapeQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    pages: Option<u32>,
    max_results: Option<u32>,
    channel_type: Option<String>,
    ideology: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScrapeKind {
    Account,
    Content,
    Comments,
}

impl ScrapeKind {
    fn parse(platform: Platform, raw: Option<&str>) -> Result<Self, ApiError> {
        let raw = raw.map(str::trim).filter(|v| !v.is_empty());
        match (platform, raw) {
            (Platform::YouTube, None | Some("channel")) => Ok(Self::Account),
            (Platform::YouTube, Some("video")) => Ok(Self::Content),
            (Platform::YouTube, Some("comment")) => Ok(Self::Comments),
            (Platform::Twitter, None | Some("user")) => Ok(Self::Account),
            (Platform::Twitter, Some("post")) => Ok(Self::Content),
            (Platform::Twitter, Some("reply")) => Ok(Self::Comments),
            (_, Some(other)) => Err(ApiError::bad_request(format!(
                "unsupported {platform} scrape type `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Serialize)]
struct ScrapeResponse {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
}

async fn scrape_youtube_handler(
    State(state): State<Arc<AppState>>,
    Path(identifier): Path<String>,
    Query(query): Query<ScrapeQuery>,
) -> ApiResult<ScrapeResponse> {
    scrape(&state, Platform::YouTube, &identifier, query).await.map(Json)
}

async fn scrape_twitter_handler(
    State(state): State<Arc<AppState>>,
    Path(identifier): Path<String>,
    Query(query): Query<ScrapeQuery>,
) -> ApiResult<ScrapeResponse> {
    scrape(&state, Platform::Twitter, &identifier, query).await.map(Json)
}

async fn scrape(
    state: &AppState,
    platform: Platform,
    identifier: &str,
    query: ScrapeQuery,
) -> Result<ScrapeResponse, ApiError> {
    let ingestor = &state.services.ingestor;
    match ScrapeKind::parse(platform, query.kind.as_deref())? {
        ScrapeKind::Account => {
            let tags = AccountTags {
                channel_type: non_blank(query.channel_type),
                ideology: non_blank(query.ideology),
            };
            let account = ingestor.scrape_account(platform, identifier, tags).await?;
            Ok(ScrapeResponse {
                message: format!("{platform} account saved"),
                id: Some(account.id),
                external_id: Some(account.external_id),
                count: None,
            })
        }
        ScrapeKind::Content => {
            let item = ingestor.scrape_content(platform, identifier).await?;
            Ok(ScrapeResponse {
                message: format!("{platform} item saved"),
                id: Some(item.id),
                external_id: Some(item.external_id),
                count: None,
            })
        }
        ScrapeKind::Comments => {
            let paging = CommentPaging::new(query.max_results, query.pages);
            let count = ingestor.scrape_comments(platform, identifier, paging).await?;
            Ok(ScrapeResponse {
                message: format!("{count} {platform} comments saved"),
                id: None,
                external_id: None,
                count: Some(count),
            })
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuthorQuery {
    author_name: Option<String>,
    author_channel_id: Option<String>,
}

async fn scrape_replies_handler(
    State(state): State<Arc<AppState>>,
    Path(video_id): Path<String>,
    Query(query): Query<AuthorQuery>,
) -> ApiResult<Value> {
    let author = match (non_blank(query.author_channel_id), non_blank(query.author_name)) {
        (Some(id), _) => AuthorMatch::ExternalId(id),
        (None, Some(name)) => AuthorMatch::Name(name),
        (None, None) => {
            return Err(ApiError::bad_request(
                "author_name or author_channel_id is required",
            ))
        }
    };
    let outcome = state
        .services
        .ingestor
        .scrape_replies(Platform::YouTube, &video_id, &author)
        .await?;
    Ok(Json(json!({
        "message": format!("comment and {} replies saved", outcome.replies),
        "id": outcome.comment.id,
        "external_id": outcome.comment.external_id,
        "count": outcome.replies,
    })))
}

// --- watch management ---

#[derive(Debug, Deserialize)]
struct WatchRequest {
    channel_id: String,
    comment_text: String,
    channel_type: Option<String>,
    ideology: Option<String>,
    platform: Option<Platform>,
}

#[derive(Debug, Serialize)]
struct WatchStatus {
    enabled: bool,
    watched_accounts: usize,
    active_accounts: usize,
    last_tick: Option<TickSummary>,
}

async fn start_watching_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WatchRequest>,
) -> ApiResult<WatchedAccount> {
    let request = StartWatching {
        platform: body.platform.unwrap_or(Platform::YouTube),
        account: body.channel_id,
        trigger_text: body.comment_text,
        channel_type: non_blank(body.channel_type),
        ideology: non_blank(body.ideology),
    };
    Ok(Json(state.services.watch_list.start_watching(&request).await?))
}

async fn list_watched_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<WatchedAccount>> {
    Ok(Json(state.services.watch_list.list().await?))
}

async fn delete_watched_handler(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> ApiResult<Value> {
    let Path(id) = id?;
    state.services.watch_list.delete(id).await?;
    Ok(Json(json!({ "message": format!("watched account {id} deleted") })))
}

async fn toggle_watch_handler(State(state): State<Arc<AppState>>) -> ApiResult<WatchStatus> {
    let enabled = state.services.control.toggle();
    info!(enabled, "watch loop toggled");
    watch_status(&state).await.map(Json)
}

async fn watch_status_handler(State(state): State<Arc<AppState>>) -> ApiResult<WatchStatus> {
    watch_status(&state).await.map(Json)
}

async fn watch_status(state: &AppState) -> Result<WatchStatus, ApiError> {
    let watched = state.services.watch_list.list().await?;
    Ok(WatchStatus {
        enabled: state.services.control.is_enabled(),
        watched_accounts: watched.len(),
        active_accounts: watched.iter().filter(|w| w.is_active).count(),
        last_tick: state.services.control.last_tick(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    limit: Option<i64>,
    since_hours: Option<i64>,
}

async fn watch_logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Vec<DetectionEvent>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let since = match query.since_hours {
        Some(hours) if hours > 0 => {
            let window = TimeDelta::try_hours(hours)
                .ok_or_else(|| ApiError::bad_request("since_hours is out of range"))?;
            Some(Utc::now() - window)
        }
        _ => None,
    };
    Ok(Json(state.services.store.list_detection_events(limit, since).await?))
}

// --- reads ---

#[derive(Debug, Default, Deserialize)]
struct TagQuery {
    channel_type: Option<String>,
    ideology: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VideoListQuery {
    channel_type: Option<String>,
    ideology: Option<String>,
    channel_name: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct VideoQuery {
    video_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PostQuery {
    post_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct AccountWithContent {
    #[serde(flatten)]
    account: Account,
    content: Vec<ContentItem>,
}

#[derive(Debug, Serialize)]
struct ContentWithComments {
    #[serde(flatten)]
    item: ContentItem,
    comments: Vec<Comment>,
}

async fn list_channels_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TagQuery>,
) -> ApiResult<Vec<Account>> {
    list_accounts(&state, Platform::YouTube, query).await
}

async fn list_twitter_accounts_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TagQuery>,
) -> ApiResult<Vec<Account>> {
    list_accounts(&state, Platform::Twitter, query).await
}

async fn list_accounts(state: &AppState, platform: Platform, query: TagQuery) -> ApiResult<Vec<Account>> {
    let filter = AccountFilter {
        platform: Some(platform),
        channel_type: non_blank(query.channel_type),
        ideology: non_blank(query.ideology),
    };
    Ok(Json(state.services.store.list_accounts(&filter).await?))
}

async fn channel_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<AccountWithContent> {
    account_detail(&state, Platform::YouTube, &id).await
}

async fn twitter_account_handler(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> ApiResult<AccountWithContent> {
    account_detail(&state, Platform::Twitter, &username).await
}

async fn account_detail(state: &AppState, platform: Platform, raw_id: &str) -> ApiResult<AccountWithContent> {
    let external_id = platform.normalize_account_id(raw_id);
    let store = &state.services.store;
    let account = store
        .find_account(platform, &external_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("{platform} account {external_id} not found")))?;
    let content = store.list_items_for_account(account.id).await?;
    Ok(Json(AccountWithContent { account, content }))
}

async fn video_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ContentWithComments> {
    content_detail(&state, Platform::YouTube, id.trim()).await
}

async fn twitter_post_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ContentWithComments> {
    content_detail(&state, Platform::Twitter, &extract_tweet_id(&id)).await
}

async fn content_detail(state: &AppState, platform: Platform, external_id: &str) -> ApiResult<ContentWithComments> {
    let item = find_item(state, platform, external_id).await?;
    let comments = state.services.store.list_comments_for_item(item.id).await?;
    Ok(Json(ContentWithComments { item, comments }))
}

async fn find_item(state: &AppState, platform: Platform, external_id: &str) -> Result<ContentItem, ApiError> {
    state
        .services
        .store
        .find_content_item(platform, external_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("{platform} item {external_id} not found")))
}

async fn video_list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VideoListQuery>,
) -> ApiResult<Vec<ContentListing>> {
    let filter = ContentFilter {
        platform: Some(Platform::YouTube),
        channel_type: non_blank(query.channel_type),
        ideology: non_blank(query.ideology),
        channel_name: non_blank(query.channel_name),
        limit: query.limit.filter(|l| *l > 0),
    };
    Ok(Json(state.services.store.list_content_items(&filter).await?))
}

async fn comments_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VideoQuery>,
) -> ApiResult<Vec<Comment>> {
    list_comments(&state, Platform::YouTube, CommentLevel::TopLevel, non_blank(query.video_id)).await
}

async fn comment_replies_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VideoQuery>,
) -> ApiResult<Vec<Comment>> {
    list_comments(&state, Platform::YouTube, CommentLevel::Replies, non_blank(query.video_id)).await
}

/// Replies to a post are stored as that post's top-level comments.
async fn twitter_replies_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PostQuery>,
) -> ApiResult<Vec<Comment>> {
    let post_id = non_blank(query.post_id).map(|id| extract_tweet_id(&id));
    list_comments(&state, Platform::Twitter, CommentLevel::TopLevel, post_id).await
}

async fn list_comments(
    state: &AppState,
    platform: Platform,
    level: CommentLevel,
    content_external_id: Option<String>,
) -> ApiResult<Vec<Comment>> {
    let content_item_id = match content_external_id {
        Some(external_id) => Some(find_item(state, platform, &external_id).await?.id),
        None => None,
    };
    let filter = CommentFilter {
        platform,
        level,
        content_item_id,
    };
    Ok(Json(state.services.store.list_comments(&filter).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path as FsPath;

    use axum::body::Body;
    use axum::http::header;
    use http_body_util::BodyExt;
    use pcw_adapters::Adapters;
    use pcw_storage::Store;
    use pcw_sync::SyncConfig;
    use tower::ServiceExt;

    const CHANNEL: &str = "UCsample0000000000000001";

    async fn test_app() -> Router {
        let fixtures = FsPath::new(env!("CARGO_MANIFEST_DIR")).join("../pcw-adapters/fixtures/sample.json");
        let adapters = Adapters::from_fixture_file(fixtures).unwrap();
        let store = Store::in_memory().await.unwrap();
        let services = SyncServices::new(store, adapters, &SyncConfig::default());
        router(AppState::new(services))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = axum::http::Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = test_app().await;
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn channel_scrape_feeds_read_endpoints() {
        let app = test_app().await;
        let (status, body) = send(&app, "POST", "/scrape/@sampledaily?type=channel&channel_type=news", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["external_id"], CHANNEL);
        assert!(body["id"].is_i64());

        let (_, tagged) = send(&app, "GET", "/channels?channel_type=news", None).await;
        assert_eq!(tagged.as_array().unwrap().len(), 1);
        let (_, untagged) = send(&app, "GET", "/channels?channel_type=sports", None).await;
        assert!(untagged.as_array().unwrap().is_empty());

        let (status, detail) = send(&app, "GET", &format!("/channels/{CHANNEL}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["display_name"], "Sample Daily");
        assert!(!detail["content"].as_array().unwrap().is_empty());

        let (_, listed) = send(&app, "GET", "/video_list?channel_name=daily&channel_type=NEWS", None).await;
        assert!(!listed.as_array().unwrap().is_empty());
        assert_eq!(listed[0]["account_name"], "Sample Daily");
        let (_, none) = send(&app, "GET", "/video_list?channel_name=daily&ideology=left", None).await;
        assert!(none.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn comment_scrape_splits_top_level_and_replies() {
        let app = test_app().await;
        let (status, body) = send(&app, "POST", "/scrape/sample-video-long?type=comment", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 3);

        let (_, top) = send(&app, "GET", "/comments?video_id=sample-video-long", None).await;
        assert_eq!(top.as_array().unwrap().len(), 2);
        let (_, replies) = send(&app, "GET", "/comment_replies?video_id=sample-video-long", None).await;
        assert_eq!(replies.as_array().unwrap().len(), 1);
        let (_, all) = send(&app, "GET", "/comments", None).await;
        assert_eq!(all.as_array().unwrap().len(), 2);

        let (status, video) = send(&app, "GET", "/videos/sample-video-long", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(video["title"], "The week in review");
        assert_eq!(video["comments"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn replies_scrape_requires_an_author() {
        let app = test_app().await;
        let (status, body) = send(&app, "POST", "/scrape_replies/sample-video-long", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("author"));

        let (status, body) = send(&app, "POST", "/scrape_replies/sample-video-long?author_name=viewer", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["external_id"], "sample-comment-1");
        assert_eq!(body["count"], 1);

        let (status, _) = send(&app, "POST", "/scrape_replies/sample-video-long?author_name=nobody", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn errors_carry_status_and_detail() {
        let app = test_app().await;
        let (status, body) = send(&app, "POST", "/scrape/abc?type=playlist", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("playlist"));

        let (status, body) = send(&app, "POST", "/scrape/missing-video?type=video", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["detail"].is_string());

        let (status, _) = send(&app, "GET", "/videos/missing-video", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "GET", "/comments?video_id=missing-video", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "GET", "/channels/UCnothere", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn monitoring_lifecycle() {
        let app = test_app().await;
        let request = json!({
            "channel_id": "@sampledaily",
            "comment_text": "nice upload",
            "channel_type": "news",
        });
        let (status, watched) = send(&app, "POST", "/monitoring/channels", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(watched["account_external_id"], CHANNEL);
        assert_eq!(watched["last_seen_item_id"], "sample-video-long");
        let id = watched["id"].as_i64().unwrap();

        let (_, list) = send(&app, "GET", "/monitoring/channels", None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (_, status_body) = send(&app, "GET", "/monitoring/status", None).await;
        assert_eq!(status_body["enabled"], false);
        assert_eq!(status_body["active_accounts"], 1);
        let (_, toggled) = send(&app, "POST", "/monitoring/toggle", None).await;
        assert_eq!(toggled["enabled"], true);

        let (status, logs) = send(&app, "GET", "/monitoring/logs?limit=100000&since_hours=24", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(logs.as_array().unwrap().is_empty());

        let (status, _) = send(&app, "DELETE", &format!("/monitoring/channels/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, "DELETE", &format!("/monitoring/channels/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn non_numeric_watch_id_gets_a_json_detail() {
        let app = test_app().await;
        let (status, body) = send(&app, "DELETE", "/monitoring/channels/not-a-number", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("not-a-number"));
    }

    #[tokio::test]
    async fn twitter_scrapes_and_reads() {
        let app = test_app().await;
        let (status, body) = send(&app, "POST", "/scrape_twitter/@SampleNews?type=user", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["external_id"], "samplenews");

        let (status, account) = send(&app, "GET", "/twitter/accounts/SampleNews", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(account["follower_count"], 310000);

        let (status, body) = send(&app, "POST", "/scrape_twitter/1790000000000000002?type=reply", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);

        let (_, replies) = send(&app, "GET", "/twitter/replies?post_id=1790000000000000002", None).await;
        assert_eq!(replies.as_array().unwrap().len(), 2);
        let (status, post) = send(&app, "GET", "/twitter/posts/1790000000000000002", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(post["comments"].as_array().unwrap().len(), 2);

        let (_, accounts) = send(&app, "GET", "/twitter/accounts", None).await;
        assert_eq!(accounts.as_array().unwrap().len(), 1);
    }
}
