use std::sync::Arc;

use pcw_adapters::{Adapters, FixtureAdapter};
use pcw_core::{AccountDraft, ContentDraft, DetectionStatus, Platform};
use pcw_storage::Store;
use pcw_sync::{StartWatching, SyncConfig, SyncServices};

const CHANNEL: &str = "UCscenario00000000000001";

fn video(id: &str, title: &str) -> ContentDraft {
    let mut draft = ContentDraft::new(Platform::YouTube, id);
    draft.account_external_id = Some(CHANNEL.into());
    draft.title = Some(title.into());
    draft.duration = Some("PT8M".into());
    draft.live_status = Some("none".into());
    draft
}

async fn services_with(adapter: Arc<FixtureAdapter>, store: Store) -> SyncServices {
    let config = SyncConfig {
        watch_enabled: true,
        ..SyncConfig::default()
    };
    SyncServices::new(store, Adapters::new().with(adapter), &config)
}

async fn scenario_adapter() -> Arc<FixtureAdapter> {
    let adapter = Arc::new(FixtureAdapter::empty(Platform::YouTube));
    let mut account = AccountDraft::new(Platform::YouTube, CHANNEL);
    account.display_name = Some("Scenario Channel".into());
    account.handle = Some("@scenario".into());
    adapter.add_account(account).await;
    adapter
}

fn watch_request() -> StartWatching {
    StartWatching {
        platform: Platform::YouTube,
        account: "@scenario".into(),
        trigger_text: "notify me".into(),
        channel_type: None,
        ideology: None,
    }
}

#[tokio::test]
async fn new_upload_is_detected_exactly_once() {
    let adapter = scenario_adapter().await;
    adapter.publish_content(video("V1", "First upload")).await;
    let services = services_with(adapter.clone(), Store::in_memory().await.unwrap()).await;

    let watched = services.watch_list.start_watching(&watch_request()).await.unwrap();
    assert_eq!(watched.last_seen_item_id.as_deref(), Some("V1"));

    // no change
    let quiet = services.tracker.tick().await.unwrap().unwrap();
    assert!(quiet.detections.is_empty());

    adapter.publish_content(video("V2", "Second upload")).await;
    let loud = services.tracker.tick().await.unwrap().unwrap();
    assert_eq!(loud.detections.len(), 1);
    assert_eq!(loud.detections[0].item_id, "V2");
    assert_eq!(loud.detections[0].item_title.as_deref(), Some("Second upload"));

    let again = services.tracker.tick().await.unwrap().unwrap();
    assert!(again.detections.is_empty());

    let events = services.store.events_for_watched(watched.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, DetectionStatus::Pending);
    assert_eq!(events[0].trigger_text, "notify me");

    let row = services.store.get_watched(watched.id).await.unwrap().unwrap();
    assert_eq!(row.last_seen_item_id.as_deref(), Some("V2"));
    assert_eq!(
        services.control.last_tick().unwrap().run_id,
        again.run_id
    );
}

#[tokio::test]
async fn shorts_and_live_streams_never_trigger() {
    let adapter = scenario_adapter().await;
    adapter.publish_content(video("V1", "First upload")).await;
    let services = services_with(adapter.clone(), Store::in_memory().await.unwrap()).await;
    let watched = services.watch_list.start_watching(&watch_request()).await.unwrap();

    let mut short = video("S1", "Quick one");
    short.duration = Some("PT59S".into());
    let mut live = video("L1", "Live now");
    live.live_status = Some("live".into());
    adapter.publish_content(short).await;
    adapter.publish_content(live).await;

    let summary = services.tracker.tick().await.unwrap().unwrap();
    assert!(summary.detections.is_empty());
    assert!(services.store.events_for_watched(watched.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn deleting_watch_removes_its_events() {
    let adapter = scenario_adapter().await;
    let services = services_with(adapter.clone(), Store::in_memory().await.unwrap()).await;
    let watched = services.watch_list.start_watching(&watch_request()).await.unwrap();
    assert_eq!(watched.last_seen_item_id, None);

    adapter.publish_content(video("V1", "First upload")).await;
    services.tracker.tick().await.unwrap().unwrap();
    assert_eq!(services.store.list_detection_events(50, None).await.unwrap().len(), 1);

    services.watch_list.delete(watched.id).await.unwrap();
    assert!(services.store.list_detection_events(50, None).await.unwrap().is_empty());
    assert!(services.watch_list.list().await.unwrap().is_empty());
    assert_eq!(
        services.watch_list.delete(watched.id).await.unwrap_err().status_code(),
        404
    );
}

#[tokio::test]
async fn cursor_survives_a_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("pcw.db").display());
    let adapter = scenario_adapter().await;
    adapter.publish_content(video("V1", "First upload")).await;

    {
        let services = services_with(adapter.clone(), Store::connect(&url).await.unwrap()).await;
        services.watch_list.start_watching(&watch_request()).await.unwrap();
    }

    adapter.publish_content(video("V2", "Second upload")).await;
    let services = services_with(adapter, Store::connect(&url).await.unwrap()).await;
    let summary = services.tracker.tick().await.unwrap().unwrap();
    assert_eq!(summary.detections.len(), 1);
    assert_eq!(summary.detections[0].item_id, "V2");
}
