use super::*;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use shared::{domain::ComplianceStatus, protocol::ControlItemRecord};
use tokio::sync::{oneshot, Notify};

#[derive(Default)]
struct MemorySnapshots {
    snapshots: StdMutex<HashMap<UserId, AssessmentSnapshot>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    failures_left: AtomicUsize,
}

impl MemorySnapshots {
    fn with_snapshot(user_id: &str, snapshot: AssessmentSnapshot) -> Self {
        let store = Self::default();
        store
            .snapshots
            .lock()
            .expect("snapshots")
            .insert(UserId::new(user_id), snapshot);
        store
    }

    fn failing(times: usize) -> Self {
        let store = Self::default();
        store.failures_left.store(times, Ordering::SeqCst);
        store
    }

    fn stored(&self, user_id: &str) -> Option<AssessmentSnapshot> {
        self.snapshots
            .lock()
            .expect("snapshots")
            .get(&UserId::new(user_id))
            .cloned()
    }

    fn stored_status(&self, user_id: &str, item_id: &str) -> Option<String> {
        self.stored(user_id)?
            .items
            .into_iter()
            .find(|record| record.id == ItemId::new(item_id))
            .map(|record| record.status)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshots {
    async fn read_snapshot(&self, user_id: &UserId) -> Result<Option<AssessmentSnapshot>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .snapshots
            .lock()
            .expect("snapshots")
            .get(user_id)
            .cloned())
    }

    async fn write_snapshot(&self, user_id: &UserId, snapshot: &AssessmentSnapshot) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("remote store unavailable"));
        }
        self.snapshots
            .lock()
            .expect("snapshots")
            .insert(user_id.clone(), snapshot.clone());
        Ok(())
    }
}

/// Holds the first write until released; optionally fails it afterwards.
struct GatedSnapshots {
    inner: MemorySnapshots,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    started: Notify,
    finished: Notify,
    fail_gated_write: bool,
}

impl GatedSnapshots {
    fn new(fail_gated_write: bool) -> (Arc<Self>, oneshot::Sender<()>) {
        let (release, gate) = oneshot::channel();
        let store = Arc::new(Self {
            inner: MemorySnapshots::default(),
            gate: Mutex::new(Some(gate)),
            started: Notify::new(),
            finished: Notify::new(),
            fail_gated_write,
        });
        (store, release)
    }
}

#[async_trait]
impl SnapshotStore for GatedSnapshots {
    async fn read_snapshot(&self, user_id: &UserId) -> Result<Option<AssessmentSnapshot>> {
        self.inner.read_snapshot(user_id).await
    }

    async fn write_snapshot(&self, user_id: &UserId, snapshot: &AssessmentSnapshot) -> Result<()> {
        let gate = self.gate.lock().await.take();
        let Some(gate) = gate else {
            return self.inner.write_snapshot(user_id, snapshot).await;
        };
        self.started.notify_one();
        let _ = gate.await;
        let result = if self.fail_gated_write {
            Err(anyhow!("connection reset"))
        } else {
            self.inner.write_snapshot(user_id, snapshot).await
        };
        self.finished.notify_one();
        result
    }
}

struct NeverCompletes;

#[async_trait]
impl SnapshotStore for NeverCompletes {
    async fn read_snapshot(&self, _user_id: &UserId) -> Result<Option<AssessmentSnapshot>> {
        Ok(None)
    }

    async fn write_snapshot(&self, _user_id: &UserId, _snapshot: &AssessmentSnapshot) -> Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

struct FixedTier(TierStatus);

#[async_trait]
impl TierSource for FixedTier {
    async fn read_tier_status(&self, _user_id: &UserId) -> Result<TierStatus> {
        Ok(self.0)
    }
}

struct SwitchableIdentity(StdMutex<Option<UserId>>);

impl SwitchableIdentity {
    fn new(user_id: &str) -> Self {
        Self(StdMutex::new(Some(UserId::new(user_id))))
    }

    fn switch_to(&self, user_id: &str) {
        *self.0.lock().expect("identity") = Some(UserId::new(user_id));
    }
}

#[async_trait]
impl IdentityProvider for SwitchableIdentity {
    async fn current_identity(&self) -> Result<Option<UserId>> {
        Ok(self.0.lock().expect("identity").clone())
    }
}

#[derive(Default)]
struct RecordingExporter {
    reports: StdMutex<Vec<AssessmentReport>>,
}

#[async_trait]
impl ReportExporter for RecordingExporter {
    async fn export_report(&self, report: &AssessmentReport) -> Result<ExportReceipt> {
        self.reports.lock().expect("reports").push(report.clone());
        Ok(ExportReceipt {
            location: "memory://report".into(),
            item_count: report.items.len(),
        })
    }
}

fn fast_retry(retry_attempts: usize) -> ClientConfig {
    ClientConfig {
        policy: TierPolicy::default(),
        sync: SyncOptions {
            write_timeout: None,
            retry_attempts,
            retry_delay: Duration::from_millis(5),
        },
    }
}

fn client_with(
    config: ClientConfig,
    user: &str,
    snapshots: Arc<dyn SnapshotStore>,
    tier: TierStatus,
) -> Arc<AssessmentClient> {
    AssessmentClient::new_with_dependencies(
        config,
        Arc::new(StaticIdentity::user(user)),
        snapshots,
        Arc::new(FixedTier(tier)),
        Arc::new(MissingReportExporter),
    )
}

fn drain(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    received
}

#[tokio::test]
async fn new_user_starts_from_catalog_on_demo() {
    let snapshots = Arc::new(MemorySnapshots::default());
    let client = client_with(
        ClientConfig::default(),
        "alice",
        snapshots.clone(),
        TierStatus::Demo,
    );

    let summary = client.start_session().await.expect("session");
    assert_eq!(summary.source, SnapshotSource::Catalog);
    assert_eq!(summary.tier, TierStatus::Demo);
    assert_eq!(summary.total, CATALOG_SIZE);
    assert_eq!(summary.visible, DEMO_ITEM_LIMIT);
    assert!(summary.load_warning.is_none());

    let visible = client.visible_items().await.expect("visible");
    assert_eq!(visible, ControlCatalog::items()[..DEMO_ITEM_LIMIT].to_vec());
    assert_eq!(client.sync_state().await, SyncState::Ready);
    assert!(snapshots.stored("alice").is_none());
}

#[tokio::test]
async fn upgrade_reveals_full_catalog_without_reload() {
    let snapshots = Arc::new(MemorySnapshots::default());
    let client = client_with(
        ClientConfig::default(),
        "alice",
        snapshots.clone(),
        TierStatus::Demo,
    );
    let mut events = client.subscribe_events();
    client.start_session().await.expect("session");
    assert_eq!(
        client.full_catalog().await,
        Err(AssessmentError::TierDenied {
            operation: Operation::FullCatalog,
            tier: TierStatus::Demo,
        })
    );

    client.set_tier(TierStatus::Pro).await.expect("upgrade");
    assert_eq!(client.visible_items().await.expect("visible").len(), CATALOG_SIZE);
    assert_eq!(client.full_catalog().await.expect("catalog").len(), CATALOG_SIZE);
    assert_eq!(snapshots.reads.load(Ordering::SeqCst), 1);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, ClientEvent::TierChanged(TierStatus::Pro))));
}

#[tokio::test]
async fn stored_snapshot_is_used_as_is() {
    let mut items = ControlCatalog::items();
    items[0].status = ComplianceStatus::Compliant;
    items.truncate(10);
    let snapshots = Arc::new(MemorySnapshots::with_snapshot(
        "alice",
        AssessmentSnapshot::from_items(&items, None),
    ));
    let client = client_with(ClientConfig::default(), "alice", snapshots, TierStatus::Pro);

    let summary = client.start_session().await.expect("session");
    assert_eq!(summary.source, SnapshotSource::Remote);
    assert_eq!(summary.total, 10);

    let metrics = client.metrics().await.expect("metrics");
    assert_eq!(metrics.summary.total, 10);
    assert_eq!(metrics.summary.compliant, 1);
    assert_eq!(metrics.summary.progress, 10);
}

#[tokio::test]
async fn empty_snapshot_falls_back_to_catalog() {
    let snapshots = Arc::new(MemorySnapshots::with_snapshot(
        "alice",
        AssessmentSnapshot {
            items: Vec::new(),
            last_updated: None,
        },
    ));
    let client = client_with(ClientConfig::default(), "alice", snapshots, TierStatus::Pro);
    let summary = client.start_session().await.expect("session");
    assert_eq!(summary.source, SnapshotSource::Catalog);
    assert_eq!(summary.visible, CATALOG_SIZE);
}

#[tokio::test]
async fn integrity_violation_falls_back_to_catalog_with_warning() {
    let mut bad = ControlItemRecord::from(&ControlCatalog::items()[0]);
    bad.status = "Done".into();
    let snapshots = Arc::new(MemorySnapshots::with_snapshot(
        "alice",
        AssessmentSnapshot {
            items: vec![bad],
            last_updated: None,
        },
    ));
    let client = client_with(
        ClientConfig::default(),
        "alice",
        snapshots.clone(),
        TierStatus::Demo,
    );
    let mut events = client.subscribe_events();

    let summary = client.start_session().await.expect("session");
    assert_eq!(summary.source, SnapshotSource::CatalogAfterError);
    assert!(matches!(
        summary.load_warning,
        Some(AssessmentError::Integrity { .. })
    ));
    assert_eq!(summary.visible, DEMO_ITEM_LIMIT);
    assert_eq!(client.sync_state().await, SyncState::Ready);

    let received = drain(&mut events);
    assert!(received.iter().any(|event| matches!(
        event,
        ClientEvent::SyncStateChanged(SyncState::LoadFailed(AssessmentError::Integrity { .. }))
    )));
    assert!(received
        .iter()
        .any(|event| matches!(event, ClientEvent::Warning(AssessmentError::Integrity { .. }))));
    // the bad snapshot is left alone until the user edits something
    assert_eq!(snapshots.writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unreadable_billing_degrades_to_demo() {
    let client = AssessmentClient::new_with_dependencies(
        ClientConfig::default(),
        Arc::new(StaticIdentity::user("alice")),
        Arc::new(MemorySnapshots::default()),
        Arc::new(MissingTierSource),
        Arc::new(MissingReportExporter),
    );
    let mut events = client.subscribe_events();

    let summary = client.start_session().await.expect("session");
    assert_eq!(summary.tier, TierStatus::Demo);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, ClientEvent::Warning(AssessmentError::Persistence(_)))));
    assert_eq!(client.refresh_tier().await.expect("refresh"), TierStatus::Demo);
}

#[tokio::test]
async fn edit_made_during_inflight_write_reaches_remote() {
    let (snapshots, release) = GatedSnapshots::new(false);
    let client = client_with(
        ClientConfig::default(),
        "alice",
        snapshots.clone(),
        TierStatus::Demo,
    );
    client.start_session().await.expect("session");

    client
        .update_item(&ItemId::new("1"), &ItemPatch::notes("kick-off"))
        .await
        .expect("first edit");
    snapshots.started.notified().await;
    assert_eq!(client.sync_state().await, SyncState::Syncing);

    client
        .update_item(
            &ItemId::new("3"),
            &ItemPatch::status(ComplianceStatus::PartiallyCompliant),
        )
        .await
        .expect("second edit");
    client
        .update_item(&ItemId::new("3"), &ItemPatch::status(ComplianceStatus::Compliant))
        .await
        .expect("third edit");
    release.send(()).expect("release");

    assert_eq!(client.flush().await.expect("flush"), SyncState::Ready);
    assert_eq!(
        snapshots.inner.stored_status("alice", "3").as_deref(),
        Some("Compliant")
    );
    let stored = snapshots.inner.stored("alice").expect("stored");
    assert_eq!(stored.items.len(), CATALOG_SIZE);
    assert_eq!(stored.items[0].notes, "kick-off");
    // the two queued edits were coalesced into one write
    assert_eq!(snapshots.inner.writes.load(Ordering::SeqCst), 2);
    assert!(!client.has_unsynced_changes().await);
}

#[tokio::test]
async fn stale_session_write_cannot_touch_next_session() {
    let (snapshots, release) = GatedSnapshots::new(true);
    let identity = Arc::new(SwitchableIdentity::new("alice"));
    let client = AssessmentClient::new_with_dependencies(
        fast_retry(0),
        identity.clone(),
        snapshots.clone(),
        Arc::new(FixedTier(TierStatus::Demo)),
        Arc::new(MissingReportExporter),
    );

    let first = client.start_session().await.expect("alice session");
    client
        .update_item(&ItemId::new("2"), &ItemPatch::status(ComplianceStatus::Compliant))
        .await
        .expect("alice edit");
    snapshots.started.notified().await;

    client.end_session().await;
    identity.switch_to("bob");
    let second = client.start_session().await.expect("bob session");
    assert_ne!(first.token, second.token);
    let mut events = client.subscribe_events();

    release.send(()).expect("release");
    snapshots.finished.notified().await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(client.sync_state().await, SyncState::Ready);
    assert_eq!(client.user_id().await, Some(UserId::new("bob")));
    assert!(drain(&mut events).is_empty());
    let bob_item = client.item(&ItemId::new("2")).await.expect("item");
    assert_eq!(bob_item.status, ComplianceStatus::NotStarted);
    assert!(snapshots.inner.stored("bob").is_none());
}

#[tokio::test]
async fn transient_write_failures_heal_through_retry() {
    let snapshots = Arc::new(MemorySnapshots::failing(2));
    let client = client_with(fast_retry(3), "alice", snapshots.clone(), TierStatus::Demo);
    let mut events = client.subscribe_events();
    client.start_session().await.expect("session");

    client
        .update_item(&ItemId::new("4"), &ItemPatch::status(ComplianceStatus::Compliant))
        .await
        .expect("edit");

    assert_eq!(client.flush().await.expect("flush"), SyncState::Ready);
    assert_eq!(snapshots.writes.load(Ordering::SeqCst), 3);
    assert_eq!(
        snapshots.stored_status("alice", "4").as_deref(),
        Some("Compliant")
    );
    assert!(!drain(&mut events)
        .iter()
        .any(|event| matches!(event, ClientEvent::Warning(_))));
}

#[tokio::test]
async fn exhausted_retries_keep_edit_and_report_failure() {
    let snapshots = Arc::new(MemorySnapshots::failing(usize::MAX));
    let client = client_with(fast_retry(1), "alice", snapshots.clone(), TierStatus::Demo);
    let mut events = client.subscribe_events();
    client.start_session().await.expect("session");

    client
        .update_item(&ItemId::new("5"), &ItemPatch::notes("offsite copy pending"))
        .await
        .expect("edit is accepted locally");

    let state = client.flush().await.expect("flush");
    assert!(matches!(
        state,
        SyncState::SyncFailed(AssessmentError::Persistence(_))
    ));
    assert_eq!(snapshots.writes.load(Ordering::SeqCst), 2);
    assert!(client.has_unsynced_changes().await);
    let local = client.item(&ItemId::new("5")).await.expect("item");
    assert_eq!(local.notes, "offsite copy pending");
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, ClientEvent::Warning(AssessmentError::Persistence(_)))));

    snapshots.failures_left.store(0, Ordering::SeqCst);
    client.retry_sync().await.expect("retry");
    assert_eq!(client.flush().await.expect("flush"), SyncState::Ready);
    assert!(!client.has_unsynced_changes().await);
    let stored = snapshots.stored("alice").expect("stored");
    assert_eq!(stored.items[4].notes, "offsite copy pending");
}

#[tokio::test]
async fn slow_write_times_out_as_persistence_failure() {
    let config = ClientConfig {
        policy: TierPolicy::default(),
        sync: SyncOptions {
            write_timeout: Some(Duration::from_millis(20)),
            retry_attempts: 0,
            retry_delay: Duration::from_millis(1),
        },
    };
    let client = client_with(config, "alice", Arc::new(NeverCompletes), TierStatus::Pro);
    client.start_session().await.expect("session");
    client
        .update_item(&ItemId::new("1"), &ItemPatch::notes("x"))
        .await
        .expect("edit");

    match client.flush().await.expect("flush") {
        SyncState::SyncFailed(AssessmentError::Persistence(detail)) => {
            assert!(detail.contains("timed out"), "unexpected detail: {detail}")
        }
        other => panic!("expected timeout failure, got {other:?}"),
    }
}

#[tokio::test]
async fn items_beyond_demo_prefix_are_unreachable() {
    let snapshots = Arc::new(MemorySnapshots::default());
    let client = client_with(
        ClientConfig::default(),
        "alice",
        snapshots.clone(),
        TierStatus::Demo,
    );
    client.start_session().await.expect("session");

    let hidden = ItemId::new("10");
    let err = client
        .update_item(&hidden, &ItemPatch::status(ComplianceStatus::Compliant))
        .await
        .expect_err("hidden item");
    assert_eq!(err, AssessmentError::ItemNotFound { item_id: hidden.clone() });
    assert!(client.remove_item(&hidden).await.is_err());
    assert!(client.item(&hidden).await.is_err());
    assert!(client
        .query(&ItemQuery::search("patch"))
        .await
        .expect("query")
        .is_empty());

    client.set_tier(TierStatus::Pro).await.expect("upgrade");
    let updated = client
        .update_item(&hidden, &ItemPatch::status(ComplianceStatus::Compliant))
        .await
        .expect("visible on pro");
    assert_eq!(updated.status, ComplianceStatus::Compliant);
}

#[tokio::test]
async fn removed_item_is_gone_locally_and_remotely() {
    let snapshots = Arc::new(MemorySnapshots::default());
    let client = client_with(
        ClientConfig::default(),
        "alice",
        snapshots.clone(),
        TierStatus::Pro,
    );
    client.start_session().await.expect("session");

    let id = ItemId::new("7");
    let removed = client.remove_item(&id).await.expect("remove");
    assert_eq!(removed.id, id);
    let err = client
        .update_item(&id, &ItemPatch::notes("too late"))
        .await
        .expect_err("removed");
    assert!(err.is_not_found());

    client.flush().await.expect("flush");
    let stored = snapshots.stored("alice").expect("stored");
    assert_eq!(stored.items.len(), CATALOG_SIZE - 1);
    assert!(stored.items.iter().all(|record| record.id != id));
}

#[tokio::test]
async fn export_is_pro_only() {
    let exporter = Arc::new(RecordingExporter::default());
    let client = AssessmentClient::new_with_dependencies(
        ClientConfig::default(),
        Arc::new(StaticIdentity::user("alice")),
        Arc::new(MemorySnapshots::default()),
        Arc::new(FixedTier(TierStatus::Demo)),
        exporter.clone(),
    );
    client.start_session().await.expect("session");

    assert_eq!(
        client.export_report().await,
        Err(AssessmentError::TierDenied {
            operation: Operation::Export,
            tier: TierStatus::Demo,
        })
    );
    assert!(exporter.reports.lock().expect("reports").is_empty());

    client.set_tier(TierStatus::Pro).await.expect("upgrade");
    let receipt = client.export_report().await.expect("export");
    assert_eq!(receipt.item_count, CATALOG_SIZE);

    let reports = exporter.reports.lock().expect("reports");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].tier, TierStatus::Pro);
    assert_eq!(reports[0].user_id, Some(UserId::new("alice")));
    assert_eq!(reports[0].metrics.summary.total, CATALOG_SIZE);
}

#[tokio::test]
async fn anonymous_session_never_persists() {
    let client = AssessmentClient::new(ClientConfig::default());
    let summary = client.start_session().await.expect("session");
    assert_eq!(summary.user_id, None);
    assert_eq!(summary.tier, TierStatus::Demo);
    assert_eq!(summary.visible, DEMO_ITEM_LIMIT);

    client
        .update_item(&ItemId::new("1"), &ItemPatch::status(ComplianceStatus::Compliant))
        .await
        .expect("local edit");
    assert_eq!(client.flush().await.expect("flush"), SyncState::Ready);
    assert!(client.has_unsynced_changes().await);
    assert_eq!(client.refresh_tier().await.expect("tier"), TierStatus::Demo);
}

#[tokio::test]
async fn anonymous_session_cannot_be_promoted() {
    let client = AssessmentClient::new(ClientConfig::default());
    client.start_session().await.expect("session");

    assert_eq!(
        client.set_tier(TierStatus::Pro).await.expect("set tier"),
        TierStatus::Demo
    );
    assert_eq!(client.tier().await, TierStatus::Demo);
    assert_eq!(
        client.visible_items().await.expect("visible").len(),
        DEMO_ITEM_LIMIT
    );
    assert!(matches!(
        client.full_catalog().await,
        Err(AssessmentError::TierDenied { .. })
    ));
    assert!(matches!(
        client.export_report().await,
        Err(AssessmentError::TierDenied { .. })
    ));
}

#[tokio::test]
async fn operations_require_a_session() {
    let client = AssessmentClient::new(ClientConfig::default());
    assert_eq!(client.visible_items().await, Err(AssessmentError::NoSession));
    assert_eq!(
        client
            .update_item(&ItemId::new("1"), &ItemPatch::notes("x"))
            .await,
        Err(AssessmentError::NoSession)
    );
    assert_eq!(client.sync_state().await, SyncState::Idle);

    client.start_session().await.expect("session");
    client.end_session().await;
    assert_eq!(client.metrics().await, Err(AssessmentError::NoSession));
    assert_eq!(client.sync_state().await, SyncState::Idle);
}
