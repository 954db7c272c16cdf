use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{ControlItem, ItemId, Operation, SessionToken, TierStatus, UserId},
    error::AssessmentError,
    protocol::{AssessmentMetrics, AssessmentReport, AssessmentSnapshot, ExportReceipt},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

pub mod catalog;
mod durable;
pub mod query;
pub mod store;
pub mod sync;
pub mod tier;

pub use catalog::{ControlCatalog, CATALOG_SIZE};
pub use durable::DurableAssessmentBackend;
pub use query::{ItemQuery, QueryView, StatusFilter};
pub use store::{AssessmentStore, ItemPatch};
pub use sync::{SyncOptions, SyncState};
pub use tier::{TierPolicy, DEMO_ITEM_LIMIT};

use sync::{PendingWrite, SyncWorker};

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_identity(&self) -> Result<Option<UserId>>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn read_snapshot(&self, user_id: &UserId) -> Result<Option<AssessmentSnapshot>>;
    async fn write_snapshot(&self, user_id: &UserId, snapshot: &AssessmentSnapshot) -> Result<()>;
}

#[async_trait]
pub trait TierSource: Send + Sync {
    async fn read_tier_status(&self, user_id: &UserId) -> Result<TierStatus>;
}

#[async_trait]
pub trait ReportExporter: Send + Sync {
    async fn export_report(&self, report: &AssessmentReport) -> Result<ExportReceipt>;
}

pub struct AnonymousIdentity;

#[async_trait]
impl IdentityProvider for AnonymousIdentity {
    async fn current_identity(&self) -> Result<Option<UserId>> {
        Ok(None)
    }
}

/// Identity fixed at construction, e.g. from a command-line flag.
pub struct StaticIdentity(Option<UserId>);

impl StaticIdentity {
    pub fn new(user_id: Option<UserId>) -> Self {
        Self(user_id)
    }

    pub fn user(user_id: impl Into<UserId>) -> Self {
        Self(Some(user_id.into()))
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_identity(&self) -> Result<Option<UserId>> {
        Ok(self.0.clone())
    }
}

pub struct MissingSnapshotStore;

#[async_trait]
impl SnapshotStore for MissingSnapshotStore {
    async fn read_snapshot(&self, user_id: &UserId) -> Result<Option<AssessmentSnapshot>> {
        Err(anyhow!("assessment storage unavailable for user {user_id}"))
    }

    async fn write_snapshot(&self, user_id: &UserId, _snapshot: &AssessmentSnapshot) -> Result<()> {
        Err(anyhow!("assessment storage unavailable for user {user_id}"))
    }
}

pub struct MissingTierSource;

#[async_trait]
impl TierSource for MissingTierSource {
    async fn read_tier_status(&self, user_id: &UserId) -> Result<TierStatus> {
        Err(anyhow!("billing backend unavailable for user {user_id}"))
    }
}

pub struct MissingReportExporter;

#[async_trait]
impl ReportExporter for MissingReportExporter {
    async fn export_report(&self, _report: &AssessmentReport) -> Result<ExportReceipt> {
        Err(anyhow!("no report exporter configured"))
    }
}

pub(crate) fn persistence_error(err: anyhow::Error) -> AssessmentError {
    AssessmentError::Persistence(format!("{err:#}"))
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    SessionStarted {
        token: SessionToken,
        user_id: Option<UserId>,
        tier: TierStatus,
    },
    SyncStateChanged(SyncState),
    TierChanged(TierStatus),
    /// Non-blocking failure; the session stays usable.
    Warning(AssessmentError),
    SessionEnded {
        token: SessionToken,
    },
}

/// Where the items of a new session came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Remote,
    Catalog,
    CatalogAfterError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub token: SessionToken,
    pub user_id: Option<UserId>,
    pub tier: TierStatus,
    pub source: SnapshotSource,
    pub load_warning: Option<AssessmentError>,
    pub visible: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub policy: TierPolicy,
    pub sync: SyncOptions,
}

pub struct AssessmentClient {
    config: ClientConfig,
    identity: Arc<dyn IdentityProvider>,
    snapshots: Arc<dyn SnapshotStore>,
    billing: Arc<dyn TierSource>,
    exporter: Arc<dyn ReportExporter>,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<ClientEvent>,
}

struct SessionState {
    token: Option<SessionToken>,
    user_id: Option<UserId>,
    tier: TierStatus,
    store: AssessmentStore,
    sync: SyncState,
    worker: Option<SyncWorker>,
    next_sequence: u64,
}

impl SessionState {
    fn idle() -> Self {
        Self {
            token: None,
            user_id: None,
            tier: TierStatus::Demo,
            store: AssessmentStore::default(),
            sync: SyncState::Idle,
            worker: None,
            next_sequence: 0,
        }
    }

    fn active_token(&self) -> Result<SessionToken, AssessmentError> {
        self.token.ok_or(AssessmentError::NoSession)
    }

    fn ensure_current(&self, token: SessionToken) -> Result<(), AssessmentError> {
        if self.token == Some(token) {
            Ok(())
        } else {
            Err(AssessmentError::SessionSuperseded)
        }
    }
}

impl AssessmentClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Self::new_with_dependencies(
            config,
            Arc::new(AnonymousIdentity),
            Arc::new(MissingSnapshotStore),
            Arc::new(MissingTierSource),
            Arc::new(MissingReportExporter),
        )
    }

    pub fn new_with_dependencies(
        config: ClientConfig,
        identity: Arc<dyn IdentityProvider>,
        snapshots: Arc<dyn SnapshotStore>,
        billing: Arc<dyn TierSource>,
        exporter: Arc<dyn ReportExporter>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            identity,
            snapshots,
            billing,
            exporter,
            inner: Mutex::new(SessionState::idle()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Opens a session for the current identity, replacing any previous one.
    ///
    /// A missing, empty or unreadable snapshot seeds the session from the
    /// default catalog. Anonymous sessions run on the demo tier and never
    /// persist.
    pub async fn start_session(self: &Arc<Self>) -> Result<SessionSummary, AssessmentError> {
        let user_id = match self.identity.current_identity().await {
            Ok(user_id) => user_id,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "session: identity lookup failed; continuing anonymously");
                None
            }
        };

        let token = SessionToken::generate();
        {
            let mut guard = self.inner.lock().await;
            self.close_locked(&mut guard);
            guard.token = Some(token);
            guard.user_id = user_id.clone();
            guard.store = AssessmentStore::default();
            self.set_sync(&mut guard, SyncState::Loading);
        }
        info!(session = %token, user_id = ?user_id, "session: starting");

        let Some(user_id) = user_id else {
            let mut guard = self.inner.lock().await;
            guard.ensure_current(token)?;
            guard.store.load(ControlCatalog::items(), None);
            self.set_sync(&mut guard, SyncState::Ready);
            return Ok(self.finish_start(&guard, token, SnapshotSource::Catalog, None));
        };

        let tier = match self.billing.read_tier_status(&user_id).await {
            Ok(tier) => tier,
            Err(err) => {
                let err = persistence_error(err);
                warn!(user_id = %user_id, error = %err, "session: tier lookup failed; using demo tier");
                self.emit(ClientEvent::Warning(err));
                TierStatus::Demo
            }
        };

        let (items, last_updated, source, load_warning) =
            match self.snapshots.read_snapshot(&user_id).await {
                Ok(Some(snapshot)) if !snapshot.is_empty() => {
                    let last_updated = snapshot.last_updated;
                    match snapshot.into_items() {
                        Ok(items) => (items, last_updated, SnapshotSource::Remote, None),
                        Err(err) => (
                            ControlCatalog::items(),
                            None,
                            SnapshotSource::CatalogAfterError,
                            Some(err),
                        ),
                    }
                }
                Ok(_) => (ControlCatalog::items(), None, SnapshotSource::Catalog, None),
                Err(err) => (
                    ControlCatalog::items(),
                    None,
                    SnapshotSource::CatalogAfterError,
                    Some(persistence_error(err)),
                ),
            };

        let mut guard = self.inner.lock().await;
        if let Err(err) = guard.ensure_current(token) {
            debug!(session = %token, "session: superseded while loading");
            return Err(err);
        }
        guard.store.load(items, last_updated);
        guard.tier = tier;
        if let Some(err) = &load_warning {
            warn!(user_id = %user_id, error = %err, "session: snapshot load failed; using default catalog");
            self.set_sync(&mut guard, SyncState::LoadFailed(err.clone()));
            self.emit(ClientEvent::Warning(err.clone()));
        }
        self.set_sync(&mut guard, SyncState::Ready);
        guard.worker = Some(SyncWorker::spawn(
            Arc::downgrade(self),
            Arc::clone(&self.snapshots),
            self.config.sync.clone(),
        ));
        Ok(self.finish_start(&guard, token, source, load_warning))
    }

    fn finish_start(
        &self,
        state: &SessionState,
        token: SessionToken,
        source: SnapshotSource,
        load_warning: Option<AssessmentError>,
    ) -> SessionSummary {
        let total = state.store.items().len();
        let summary = SessionSummary {
            token,
            user_id: state.user_id.clone(),
            tier: state.tier,
            source,
            load_warning,
            visible: self.config.policy.visible_len(total, state.tier),
            total,
        };
        info!(
            session = %token,
            tier = %summary.tier,
            visible = summary.visible,
            total = summary.total,
            source = ?summary.source,
            "session: started"
        );
        self.emit(ClientEvent::SessionStarted {
            token,
            user_id: summary.user_id.clone(),
            tier: summary.tier,
        });
        summary
    }

    /// Drops the session without waiting for an in-flight write.
    pub async fn end_session(&self) {
        let mut guard = self.inner.lock().await;
        self.close_locked(&mut guard);
    }

    fn close_locked(&self, state: &mut SessionState) {
        let Some(token) = state.token else {
            return;
        };
        if state.store.is_dirty() && state.worker.is_some() {
            warn!(session = %token, revision = state.store.revision(), "session: closing with unsynced edits");
        }
        *state = SessionState {
            sync: state.sync.clone(),
            ..SessionState::idle()
        };
        self.set_sync(state, SyncState::Idle);
        info!(session = %token, "session: ended");
        self.emit(ClientEvent::SessionEnded { token });
    }

    pub async fn session_token(&self) -> Option<SessionToken> {
        self.inner.lock().await.token
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.inner.lock().await.user_id.clone()
    }

    pub async fn tier(&self) -> TierStatus {
        self.inner.lock().await.tier
    }

    pub async fn sync_state(&self) -> SyncState {
        self.inner.lock().await.sync.clone()
    }

    pub async fn has_unsynced_changes(&self) -> bool {
        self.inner.lock().await.store.is_dirty()
    }

    /// Applies a tier read elsewhere and returns the tier in effect.
    /// Anonymous sessions stay on demo whatever is requested.
    pub async fn set_tier(&self, tier: TierStatus) -> Result<TierStatus, AssessmentError> {
        let mut guard = self.inner.lock().await;
        guard.active_token()?;
        let tier = if guard.user_id.is_none() {
            if tier != TierStatus::Demo {
                warn!(requested = %tier, "tier: anonymous session is pinned to demo");
            }
            TierStatus::Demo
        } else {
            tier
        };
        self.apply_tier(&mut guard, tier);
        Ok(tier)
    }

    /// Re-reads the billing status. A failed read degrades to demo.
    pub async fn refresh_tier(&self) -> Result<TierStatus, AssessmentError> {
        let (token, user_id) = {
            let guard = self.inner.lock().await;
            (guard.active_token()?, guard.user_id.clone())
        };

        let tier = match user_id {
            None => TierStatus::Demo,
            Some(user_id) => match self.billing.read_tier_status(&user_id).await {
                Ok(tier) => tier,
                Err(err) => {
                    let err = persistence_error(err);
                    warn!(user_id = %user_id, error = %err, "tier: refresh failed; using demo tier");
                    self.emit(ClientEvent::Warning(err));
                    TierStatus::Demo
                }
            },
        };

        let mut guard = self.inner.lock().await;
        guard.ensure_current(token)?;
        self.apply_tier(&mut guard, tier);
        Ok(tier)
    }

    fn apply_tier(&self, state: &mut SessionState, tier: TierStatus) {
        if state.tier == tier {
            return;
        }
        info!(from = %state.tier, to = %tier, "tier: changed");
        state.tier = tier;
        self.emit(ClientEvent::TierChanged(tier));
    }

    fn view<'a>(&self, state: &'a SessionState) -> QueryView<'a> {
        QueryView::gated(&self.config.policy, state.store.items(), state.tier)
    }

    pub async fn visible_items(&self) -> Result<Vec<ControlItem>, AssessmentError> {
        let guard = self.inner.lock().await;
        guard.active_token()?;
        Ok(self.view(&guard).items().to_vec())
    }

    pub async fn query(&self, query: &ItemQuery) -> Result<Vec<ControlItem>, AssessmentError> {
        let guard = self.inner.lock().await;
        guard.active_token()?;
        Ok(self
            .view(&guard)
            .query(query)
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn item(&self, id: &ItemId) -> Result<ControlItem, AssessmentError> {
        let guard = self.inner.lock().await;
        guard.active_token()?;
        self.view(&guard)
            .items()
            .iter()
            .find(|item| &item.id == id)
            .cloned()
            .ok_or_else(|| AssessmentError::ItemNotFound {
                item_id: id.clone(),
            })
    }

    /// Aggregates over the items visible on the current tier.
    pub async fn metrics(&self) -> Result<AssessmentMetrics, AssessmentError> {
        let guard = self.inner.lock().await;
        guard.active_token()?;
        Ok(store::metrics(self.view(&guard).items()))
    }

    pub async fn full_catalog(&self) -> Result<Vec<ControlItem>, AssessmentError> {
        let guard = self.inner.lock().await;
        guard.active_token()?;
        self.config.policy.ensure(guard.tier, Operation::FullCatalog)?;
        Ok(guard.store.items().to_vec())
    }

    pub async fn update_item(
        &self,
        id: &ItemId,
        patch: &ItemPatch,
    ) -> Result<ControlItem, AssessmentError> {
        let mut guard = self.inner.lock().await;
        guard.active_token()?;
        self.ensure_reachable(&guard, Operation::Edit, id)?;
        let updated = guard.store.update_item(id, patch)?.clone();
        debug!(item_id = %id, revision = guard.store.revision(), "store: item updated");
        self.publish_locked(&mut guard);
        Ok(updated)
    }

    pub async fn remove_item(&self, id: &ItemId) -> Result<ControlItem, AssessmentError> {
        let mut guard = self.inner.lock().await;
        guard.active_token()?;
        self.ensure_reachable(&guard, Operation::Remove, id)?;
        let removed = guard.store.remove_item(id)?;
        info!(item_id = %id, revision = guard.store.revision(), "store: item removed");
        self.publish_locked(&mut guard);
        Ok(removed)
    }

    fn ensure_reachable(
        &self,
        state: &SessionState,
        operation: Operation,
        id: &ItemId,
    ) -> Result<(), AssessmentError> {
        self.config.policy.ensure(state.tier, operation)?;
        if self
            .config
            .policy
            .is_reachable(state.store.items(), state.tier, id)
        {
            Ok(())
        } else {
            Err(AssessmentError::ItemNotFound {
                item_id: id.clone(),
            })
        }
    }

    /// Re-sends the full current item sequence.
    pub async fn retry_sync(&self) -> Result<(), AssessmentError> {
        let mut guard = self.inner.lock().await;
        guard.active_token()?;
        self.publish_locked(&mut guard);
        Ok(())
    }

    /// Waits until every write published so far has settled.
    pub async fn flush(&self) -> Result<SyncState, AssessmentError> {
        let (token, target, mut settled) = {
            let guard = self.inner.lock().await;
            let token = guard.active_token()?;
            match guard.worker.as_ref() {
                Some(worker) => (token, guard.next_sequence, worker.settled()),
                None => return Ok(guard.sync.clone()),
            }
        };

        if settled.wait_for(|sequence| *sequence >= target).await.is_err() {
            debug!(session = %token, "sync: worker stopped before flush completed");
        }

        let guard = self.inner.lock().await;
        guard.ensure_current(token)?;
        Ok(guard.sync.clone())
    }

    fn publish_locked(&self, state: &mut SessionState) {
        let (Some(token), Some(user_id), Some(worker)) =
            (state.token, state.user_id.clone(), state.worker.as_ref())
        else {
            return;
        };
        state.next_sequence += 1;
        worker.publish(PendingWrite {
            token,
            user_id,
            revision: state.store.revision(),
            sequence: state.next_sequence,
            snapshot: state.store.snapshot(),
        });
        self.set_sync(state, SyncState::Syncing);
    }

    pub(crate) async fn settle_write(
        &self,
        write: &PendingWrite,
        outcome: Result<(), AssessmentError>,
    ) {
        let mut guard = self.inner.lock().await;
        if guard.token != Some(write.token) {
            debug!(
                session = %write.token,
                revision = write.revision,
                "sync: discarding result from stale session"
            );
            return;
        }

        let latest = write.sequence == guard.next_sequence;
        match outcome {
            Ok(()) => {
                guard.store.mark_persisted(write.revision);
                if latest {
                    self.set_sync(&mut guard, SyncState::Ready);
                }
            }
            Err(err) => {
                warn!(
                    user_id = %write.user_id,
                    revision = write.revision,
                    error = %err,
                    "sync: write failed; edits kept locally"
                );
                if latest {
                    self.set_sync(&mut guard, SyncState::SyncFailed(err.clone()));
                }
                self.emit(ClientEvent::Warning(err));
            }
        }
    }

    /// Builds the report from the visible items and hands it to the exporter.
    pub async fn export_report(&self) -> Result<ExportReceipt, AssessmentError> {
        let report = {
            let guard = self.inner.lock().await;
            guard.active_token()?;
            if let Err(err) = self.config.policy.ensure(guard.tier, Operation::Export) {
                debug!(tier = %guard.tier, "export: denied");
                return Err(err);
            }
            let items = self.view(&guard).items().to_vec();
            AssessmentReport {
                generated_at: Utc::now(),
                user_id: guard.user_id.clone(),
                tier: guard.tier,
                metrics: store::metrics(&items),
                items,
            }
        };

        let receipt = self
            .exporter
            .export_report(&report)
            .await
            .map_err(persistence_error)?;
        info!(
            location = %receipt.location,
            items = receipt.item_count,
            "export: report delivered"
        );
        Ok(receipt)
    }

    fn set_sync(&self, state: &mut SessionState, next: SyncState) {
        if state.sync == next {
            return;
        }
        debug!(from = %state.sync, to = %next, "sync: state changed");
        state.sync = next.clone();
        self.emit(ClientEvent::SyncStateChanged(next));
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
