//! Watch list, per-tick change detection and the recurring watch job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use pcw_adapters::{AdapterError, Adapters};
use pcw_core::{ContentDraft, DetectionStatus, Platform};
use pcw_storage::{
    advance_cursor, insert_detection_event, touch_watch_checked, NewDetectionEvent, Store,
    WatchUpsert, WatchedAccount,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("upstream fetch failed: {0}")]
    Upstream(#[source] AdapterError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl WatchError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Upstream(_) | Self::Invalid(_) => 400,
            Self::NotFound(_) => 404,
            Self::Store(_) => 500,
        }
    }
}

impl From<AdapterError> for WatchError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Unsupported(platform) => {
                Self::Invalid(format!("{platform} watching is not configured"))
            }
            other => Self::Upstream(other),
        }
    }
}

/// First qualifying item among the newest `window` items (input is newest first).
pub fn latest_qualifying(items: &[ContentDraft], window: usize) -> Option<&ContentDraft> {
    items.iter().take(window).find(|item| item.qualifies())
}

/// Process-wide enable flag for the recurring watch job, plus the last tick's summary.
#[derive(Debug, Clone, Default)]
pub struct WatchControl {
    enabled: Arc<AtomicBool>,
    last_tick: Arc<StdMutex<Option<TickSummary>>>,
}

impl WatchControl {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
            last_tick: Arc::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flip the flag and return the new value.
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn last_tick(&self) -> Option<TickSummary> {
        self.last_tick
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_tick(&self, summary: &TickSummary) {
        *self.last_tick.lock().unwrap_or_else(PoisonError::into_inner) = Some(summary.clone());
    }
}

/// Request to start (or resume) watching an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartWatching {
    pub platform: Platform,
    pub account: String,
    pub trigger_text: String,
    pub channel_type: Option<String>,
    pub ideology: Option<String>,
}

#[derive(Clone)]
pub struct WatchList {
    store: Store,
    adapters: Adapters,
    window: usize,
}

impl WatchList {
    pub fn new(store: Store, adapters: Adapters, window: usize) -> Self {
        Self {
            store,
            adapters,
            window: window.max(1),
        }
    }

    /// Create or reactivate a watched account, seeding its cursor with the
    /// current latest qualifying item so existing content is not reported.
    pub async fn start_watching(&self, request: &StartWatching) -> Result<WatchedAccount, WatchError> {
        let trigger_text = request.trigger_text.trim();
        if trigger_text.is_empty() {
            return Err(WatchError::Invalid("trigger text is empty".into()));
        }
        let identifier = request.account.trim();
        if identifier.is_empty() {
            return Err(WatchError::Invalid("account identifier is empty".into()));
        }

        let adapter = self.adapters.get(request.platform)?;
        let account = adapter.fetch_account(identifier).await?.ok_or_else(|| {
            WatchError::NotFound(format!("{} account {identifier} not found", request.platform))
        })?;
        let external_id = request.platform.normalize_account_id(&account.external_id);
        let recent = adapter
            .fetch_recent_content(&external_id, self.window)
            .await?;
        let seed = latest_qualifying(&recent, self.window).map(|item| item.external_id.clone());

        self.store
            .ensure_account_stub(request.platform, &external_id, account.display_name.as_deref())
            .await?;
        self.store
            .set_account_tags(
                request.platform,
                &external_id,
                request.channel_type.as_deref(),
                request.ideology.as_deref(),
            )
            .await?;

        let watched = self
            .store
            .upsert_watched(&WatchUpsert {
                platform: request.platform,
                account_external_id: external_id,
                display_name: account.display_name.clone(),
                trigger_text: trigger_text.to_string(),
                channel_type: request.channel_type.clone(),
                ideology: request.ideology.clone(),
                seed_cursor: seed,
            })
            .await?;
        info!(
            id = watched.id,
            platform = %watched.platform,
            account = %watched.account_external_id,
            cursor = ?watched.last_seen_item_id,
            "watching account"
        );
        Ok(watched)
    }

    pub async fn list(&self) -> Result<Vec<WatchedAccount>, WatchError> {
        Ok(self.store.list_watched().await?)
    }

    /// Deactivate without deleting; history and cursor are kept.
    pub async fn stop_watching(&self, id: i64) -> Result<(), WatchError> {
        if self.store.set_watch_active(id, false).await? {
            Ok(())
        } else {
            Err(WatchError::NotFound(format!("watched account {id} not found")))
        }
    }

    /// Hard delete, cascading to the account's detection events.
    pub async fn delete(&self, id: i64) -> Result<(), WatchError> {
        if self.store.delete_watched(id).await? {
            Ok(())
        } else {
            Err(WatchError::NotFound(format!("watched account {id} not found")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSettings {
    pub window: usize,
    pub concurrency: usize,
    pub fetch_timeout: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            window: 5,
            concurrency: 4,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub event_id: i64,
    pub watched_account_id: i64,
    pub platform: Platform,
    pub account_external_id: String,
    pub item_id: String,
    pub item_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checked: usize,
    pub detections: Vec<Detection>,
    pub failures: usize,
    pub timeouts: usize,
    /// Cursor moved underneath the tick (reseeded, deactivated or deleted).
    pub lost_races: usize,
}

enum Outcome {
    Observed(Option<ContentDraft>),
    Failed(String),
    TimedOut,
}

struct Observation {
    watched: WatchedAccount,
    outcome: Outcome,
}

pub struct WatchTracker {
    store: Store,
    adapters: Adapters,
    control: WatchControl,
    settings: TrackerSettings,
    running: Mutex<()>,
}

impl WatchTracker {
    pub fn new(store: Store, adapters: Adapters, control: WatchControl, settings: TrackerSettings) -> Self {
        Self {
            store,
            adapters,
            control,
            settings,
            running: Mutex::new(()),
        }
    }

    pub fn control(&self) -> &WatchControl {
        &self.control
    }

    /// Check every active watched account once and commit all cursor advances
    /// with their detection events in one transaction.
    ///
    /// Returns `None` when another tick is still running.
    pub async fn tick(&self) -> Result<Option<TickSummary>> {
        let Ok(_running) = self.running.try_lock() else {
            debug!("previous watch tick still running; skipping");
            return Ok(None);
        };

        let run_id = Uuid::new_v4();
        let summary = self
            .run_tick(run_id)
            .instrument(info_span!("watch_tick", %run_id))
            .await?;
        self.control.record_tick(&summary);
        Ok(Some(summary))
    }

    async fn run_tick(&self, run_id: Uuid) -> Result<TickSummary> {
        let started_at = Utc::now();
        let watched = self.store.list_active_watched().await?;
        let checked = watched.len();

        // all fetches finish before the first write
        let observations: Vec<Observation> = stream::iter(watched)
            .map(|w| self.observe(w))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let now = Utc::now();
        let mut detections = Vec::new();
        let mut failures = 0usize;
        let mut timeouts = 0usize;
        let mut lost_races = 0usize;

        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .context("opening watch tick transaction")?;
        for Observation { watched, outcome } in observations {
            let latest = match outcome {
                Outcome::Observed(latest) => latest,
                Outcome::Failed(error) => {
                    warn!(id = watched.id, account = %watched.account_external_id, %error, "watch fetch failed");
                    failures += 1;
                    None
                }
                Outcome::TimedOut => {
                    warn!(id = watched.id, account = %watched.account_external_id, "watch fetch timed out");
                    timeouts += 1;
                    None
                }
            };

            let Some(item) = latest.filter(|item| {
                watched.last_seen_item_id.as_deref() != Some(item.external_id.as_str())
            }) else {
                touch_watch_checked(&mut *tx, watched.id, now).await?;
                continue;
            };

            let advanced = advance_cursor(
                &mut *tx,
                watched.id,
                watched.last_seen_item_id.as_deref(),
                &item.external_id,
                now,
            )
            .await?;
            if !advanced {
                debug!(id = watched.id, "cursor changed during tick; no event");
                lost_races += 1;
                continue;
            }

            let event = insert_detection_event(
                &mut *tx,
                &NewDetectionEvent {
                    watched_account_id: watched.id,
                    platform: watched.platform,
                    account_external_id: watched.account_external_id.clone(),
                    item_id: item.external_id.clone(),
                    item_title: item.display_title(),
                    status: DetectionStatus::Pending,
                    trigger_text: watched.trigger_text.clone(),
                },
            )
            .await?;
            info!(
                id = watched.id,
                account = %watched.account_external_id,
                item = %event.item_id,
                previous = ?watched.last_seen_item_id,
                "new content detected"
            );
            detections.push(Detection {
                event_id: event.id,
                watched_account_id: watched.id,
                platform: watched.platform,
                account_external_id: watched.account_external_id,
                item_id: event.item_id,
                item_title: event.item_title,
            });
        }
        tx.commit().await.context("committing watch tick")?;

        let summary = TickSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            checked,
            detections,
            failures,
            timeouts,
            lost_races,
        };
        info!(
            checked,
            detections = summary.detections.len(),
            failures,
            timeouts,
            "watch tick finished"
        );
        Ok(summary)
    }

    async fn observe(&self, watched: WatchedAccount) -> Observation {
        let outcome = match self.adapters.get(watched.platform) {
            Err(err) => Outcome::Failed(err.to_string()),
            Ok(adapter) => {
                let fetch = adapter.fetch_recent_content(&watched.account_external_id, self.settings.window);
                match tokio::time::timeout(self.settings.fetch_timeout, fetch).await {
                    Err(_) => Outcome::TimedOut,
                    Ok(Err(err)) => Outcome::Failed(err.to_string()),
                    Ok(Ok(items)) => {
                        Outcome::Observed(latest_qualifying(&items, self.settings.window).cloned())
                    }
                }
            }
        };
        Observation { watched, outcome }
    }

    /// Scheduled entry point: ticks only while the control flag is on and never fails.
    pub async fn run_scheduled_tick(&self) {
        if !self.control.is_enabled() {
            debug!("watch loop disabled; skipping tick");
            return;
        }
        if let Err(err) = self.tick().await {
            warn!(error = %format!("{err:#}"), "watch tick failed");
        }
    }
}

/// Recurring job that runs [`WatchTracker::run_scheduled_tick`] every `interval`.
pub async fn build_watch_scheduler(tracker: Arc<WatchTracker>, interval: Duration) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(interval, move |_uuid, _l| {
        let tracker = Arc::clone(&tracker);
        Box::pin(async move {
            tracker.run_scheduled_tick().await;
        })
    })
    .with_context(|| format!("creating watch job every {interval:?}"))?;
    sched.add(job).await.context("adding watch job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcw_adapters::FixtureAdapter;
    use pcw_core::AccountDraft;

    const CHANNEL: &str = "UCwatch00000000000000001";

    fn upload(id: &str, duration: &str, live: &str) -> ContentDraft {
        let mut draft = ContentDraft::new(Platform::YouTube, id);
        draft.account_external_id = Some(CHANNEL.into());
        draft.title = Some(format!("upload {id}"));
        draft.duration = Some(duration.into());
        draft.live_status = Some(live.into());
        draft
    }

    async fn youtube_fixture() -> Arc<FixtureAdapter> {
        let adapter = Arc::new(FixtureAdapter::empty(Platform::YouTube));
        let mut account = AccountDraft::new(Platform::YouTube, CHANNEL);
        account.display_name = Some("Watch Channel".into());
        account.handle = Some("@watchchannel".into());
        adapter.add_account(account).await;
        adapter
    }

    async fn setup(adapter: Arc<FixtureAdapter>, settings: TrackerSettings) -> (Store, WatchList, WatchTracker) {
        let store = Store::in_memory().await.unwrap();
        let adapters = Adapters::new().with(adapter);
        let list = WatchList::new(store.clone(), adapters.clone(), settings.window);
        let tracker = WatchTracker::new(store.clone(), adapters, WatchControl::new(true), settings);
        (store, list, tracker)
    }

    fn start(account: &str) -> StartWatching {
        StartWatching {
            platform: Platform::YouTube,
            account: account.into(),
            trigger_text: "first!".into(),
            channel_type: Some("news".into()),
            ideology: None,
        }
    }

    #[test]
    fn qualifying_scan_skips_shorts_and_live_within_window() {
        let items = vec![
            upload("live", "PT0S", "live"),
            upload("short", "PT45S", "none"),
            upload("long", "PT1H2M", "none"),
        ];
        assert_eq!(latest_qualifying(&items, 5).unwrap().external_id, "long");
        assert!(latest_qualifying(&items, 2).is_none());
    }

    #[test]
    fn toggle_flips_and_reports_new_value() {
        let control = WatchControl::default();
        assert!(!control.is_enabled());
        assert!(control.toggle());
        assert!(control.is_enabled());
        assert!(!control.toggle());
        assert!(control.last_tick().is_none());
    }

    #[tokio::test]
    async fn start_watching_seeds_cursor_and_tags_account() {
        let adapter = youtube_fixture().await;
        adapter.publish_content(upload("v1", "PT10M", "none")).await;
        adapter.publish_content(upload("s1", "PT30S", "none")).await;
        let (store, list, tracker) = setup(adapter, TrackerSettings::default()).await;

        let watched = list.start_watching(&start("@watchchannel")).await.unwrap();
        assert_eq!(watched.account_external_id, CHANNEL);
        assert_eq!(watched.last_seen_item_id.as_deref(), Some("v1"));
        assert!(watched.is_active);

        let account = store.find_account(Platform::YouTube, CHANNEL).await.unwrap().unwrap();
        assert_eq!(account.channel_type.as_deref(), Some("news"));

        // nothing new since seeding
        let summary = tracker.tick().await.unwrap().unwrap();
        assert_eq!(summary.checked, 1);
        assert!(summary.detections.is_empty());
    }

    #[tokio::test]
    async fn start_watching_reports_missing_and_invalid_input() {
        let (_, list, _) = setup(youtube_fixture().await, TrackerSettings::default()).await;
        let missing = list.start_watching(&start("nobody")).await.unwrap_err();
        assert_eq!(missing.status_code(), 404);

        let mut blank = start(CHANNEL);
        blank.trigger_text = "  ".into();
        assert_eq!(list.start_watching(&blank).await.unwrap_err().status_code(), 400);

        let mut other = start("nasa");
        other.platform = Platform::Twitter;
        assert!(matches!(
            list.start_watching(&other).await.unwrap_err(),
            WatchError::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn failing_account_does_not_block_others() {
        let adapter = youtube_fixture().await;
        let mut second = AccountDraft::new(Platform::YouTube, "UCwatch00000000000000002");
        second.display_name = Some("Second".into());
        adapter.add_account(second).await;
        let (store, list, tracker) = setup(adapter.clone(), TrackerSettings::default()).await;

        let first = list.start_watching(&start(CHANNEL)).await.unwrap();
        let other = list
            .start_watching(&start("UCwatch00000000000000002"))
            .await
            .unwrap();

        adapter.publish_content(upload("v1", "PT10M", "none")).await;
        let mut other_upload = upload("w1", "PT10M", "none");
        other_upload.account_external_id = Some("UCwatch00000000000000002".into());
        adapter.publish_content(other_upload).await;
        adapter.fail_for(CHANNEL).await;

        let summary = tracker.tick().await.unwrap().unwrap();
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.detections.len(), 1);
        assert_eq!(summary.detections[0].watched_account_id, other.id);

        let first_row = store.get_watched(first.id).await.unwrap().unwrap();
        assert_eq!(first_row.last_seen_item_id, None);
        assert!(first_row.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn timed_out_fetch_counts_as_no_item() {
        let adapter = youtube_fixture().await;
        let settings = TrackerSettings {
            fetch_timeout: Duration::from_millis(50),
            ..TrackerSettings::default()
        };
        let (store, list, tracker) = setup(adapter.clone(), settings).await;
        let watched = list.start_watching(&start(CHANNEL)).await.unwrap();

        adapter.publish_content(upload("v1", "PT10M", "none")).await;
        adapter.set_latency(Some(Duration::from_secs(60))).await;
        let summary = tracker.tick().await.unwrap().unwrap();
        assert_eq!(summary.timeouts, 1);
        assert!(summary.detections.is_empty());
        assert!(store.events_for_watched(watched.id).await.unwrap().is_empty());

        adapter.set_latency(None).await;
        let summary = tracker.tick().await.unwrap().unwrap();
        assert_eq!(summary.detections.len(), 1);
    }

    #[tokio::test]
    async fn deactivated_accounts_are_not_checked() {
        let adapter = youtube_fixture().await;
        let (store, list, tracker) = setup(adapter.clone(), TrackerSettings::default()).await;
        let watched = list.start_watching(&start(CHANNEL)).await.unwrap();
        list.stop_watching(watched.id).await.unwrap();

        adapter.publish_content(upload("v1", "PT10M", "none")).await;
        let summary = tracker.tick().await.unwrap().unwrap();
        assert_eq!(summary.checked, 0);
        assert!(store.events_for_watched(watched.id).await.unwrap().is_empty());

        // restarting reseeds from the current upload instead of reporting it
        let resumed = list.start_watching(&start(CHANNEL)).await.unwrap();
        assert_eq!(resumed.id, watched.id);
        assert_eq!(resumed.last_seen_item_id.as_deref(), Some("v1"));
        assert_eq!(list.stop_watching(9999).await.unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let (_, _, tracker) = setup(youtube_fixture().await, TrackerSettings::default()).await;
        let _held = tracker.running.lock().await;
        assert!(tracker.tick().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disabled_control_skips_scheduled_ticks() {
        let adapter = youtube_fixture().await;
        let (store, list, tracker) = setup(adapter.clone(), TrackerSettings::default()).await;
        let watched = list.start_watching(&start(CHANNEL)).await.unwrap();
        adapter.publish_content(upload("v1", "PT10M", "none")).await;

        tracker.control().set_enabled(false);
        tracker.run_scheduled_tick().await;
        assert!(store.events_for_watched(watched.id).await.unwrap().is_empty());
        assert!(tracker.control().last_tick().is_none());

        tracker.control().set_enabled(true);
        tracker.run_scheduled_tick().await;
        assert_eq!(store.events_for_watched(watched.id).await.unwrap().len(), 1);
        assert_eq!(tracker.control().last_tick().unwrap().detections.len(), 1);
    }
}
