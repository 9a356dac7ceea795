//! Reconciliation, on-demand ingestion and the watch loop, wired over one store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pcw_adapters::Adapters;
use pcw_storage::{HttpClientConfig, HttpFetcher, Store};
use tracing::info;

mod config;
mod ingest;
mod reconcile;
mod watch;

pub use config::SyncConfig;
pub use ingest::{AuthorMatch, IngestError, Ingestor, RepliesOutcome, ACCOUNT_RECENT_CONTENT};
pub use reconcile::{
    account_upsert, comment_upsert, content_upsert, AccountTags, ParentRef, Reconciler,
};
pub use watch::{
    build_watch_scheduler, latest_qualifying, Detection, StartWatching, TickSummary,
    TrackerSettings, WatchControl, WatchError, WatchList, WatchTracker,
};

pub const CRATE_NAME: &str = "pcw-sync";

/// Fixture adapters when `fixtures_path` is set, otherwise live clients for
/// whichever platforms have credentials.
pub fn build_adapters(config: &SyncConfig) -> Result<Adapters> {
    if let Some(path) = &config.fixtures_path {
        info!(path = %path.display(), "using fixture adapters");
        return Adapters::from_fixture_file(path);
    }

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs.max(1)),
        user_agent: Some(config.user_agent.clone()),
        ..HttpClientConfig::default()
    })?;
    let adapters = Adapters::live(Arc::new(http), &config.credentials());
    info!(platforms = ?adapters.platforms(), "live adapters configured");
    Ok(adapters)
}

/// Everything the web layer and CLI need, sharing one store and adapter set.
#[derive(Clone)]
pub struct SyncServices {
    pub store: Store,
    pub adapters: Adapters,
    pub reconciler: Reconciler,
    pub ingestor: Ingestor,
    pub watch_list: WatchList,
    pub tracker: Arc<WatchTracker>,
    pub control: WatchControl,
}

impl SyncServices {
    pub fn new(store: Store, adapters: Adapters, config: &SyncConfig) -> Self {
        let settings = config.tracker_settings();
        let control = WatchControl::new(config.watch_enabled);
        let reconciler = Reconciler::new(store.clone());
        let ingestor = Ingestor::new(reconciler.clone(), adapters.clone());
        let watch_list = WatchList::new(store.clone(), adapters.clone(), settings.window);
        let tracker = Arc::new(WatchTracker::new(
            store.clone(),
            adapters.clone(),
            control.clone(),
            settings,
        ));
        Self {
            store,
            adapters,
            reconciler,
            ingestor,
            watch_list,
            tracker,
            control,
        }
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = Store::connect(&config.database_url)
            .await
            .with_context(|| format!("opening database {}", config.database_url))?;
        let adapters = build_adapters(config)?;
        Ok(Self::new(store, adapters, config))
    }
}

/// One watch tick against the environment-configured database, ignoring the enable flag.
pub async fn run_tick_once_from_env() -> Result<TickSummary> {
    let config = SyncConfig::from_env();
    let services = SyncServices::from_config(&config).await?;
    services
        .tracker
        .tick()
        .await?
        .context("another watch tick is already running")
}
