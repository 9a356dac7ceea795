use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use pcw_adapters::Credentials;

use crate::watch::TrackerSettings;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub youtube_api_key: Option<String>,
    pub twitter_bearer_token: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub watch_interval_secs: u64,
    pub watch_window: usize,
    pub watch_concurrency: usize,
    pub watch_enabled: bool,
    pub fixtures_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://pcw.db?mode=rwc".to_string(),
            youtube_api_key: None,
            twitter_bearer_token: None,
            user_agent: "pcw-bot/0.1".to_string(),
            http_timeout_secs: 20,
            fetch_timeout_secs: 30,
            watch_interval_secs: 60,
            watch_window: 5,
            watch_concurrency: 4,
            watch_enabled: false,
            fixtures_path: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            youtube_api_key: env_nonempty("YOUTUBE_API_KEY"),
            twitter_bearer_token: env_nonempty("TWITTER_BEARER_TOKEN"),
            user_agent: std::env::var("PCW_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("PCW_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            fetch_timeout_secs: env_parse("PCW_FETCH_TIMEOUT_SECS", defaults.fetch_timeout_secs),
            watch_interval_secs: env_parse("PCW_WATCH_INTERVAL_SECS", defaults.watch_interval_secs),
            watch_window: env_parse("PCW_WATCH_WINDOW", defaults.watch_window),
            watch_concurrency: env_parse("PCW_WATCH_CONCURRENCY", defaults.watch_concurrency),
            watch_enabled: std::env::var("PCW_WATCH_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.watch_enabled),
            fixtures_path: env_nonempty("PCW_FIXTURES").map(PathBuf::from),
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            youtube_api_key: self.youtube_api_key.clone(),
            twitter_bearer_token: self.twitter_bearer_token.clone(),
        }
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            window: self.watch_window.max(1),
            concurrency: self.watch_concurrency.max(1),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
        }
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs.max(1))
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
