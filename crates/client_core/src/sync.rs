use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use shared::{
    domain::{SessionToken, UserId},
    error::AssessmentError,
    protocol::AssessmentSnapshot,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{persistence_error, AssessmentClient, SnapshotStore};

pub const DEFAULT_RETRY_ATTEMPTS: usize = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Loading,
    LoadFailed(AssessmentError),
    Ready,
    Syncing,
    SyncFailed(AssessmentError),
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Idle => f.write_str("idle"),
            SyncState::Loading => f.write_str("loading"),
            SyncState::LoadFailed(err) => write!(f, "load failed: {err}"),
            SyncState::Ready => f.write_str("ready"),
            SyncState::Syncing => f.write_str("syncing"),
            SyncState::SyncFailed(err) => write!(f, "sync failed: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Upper bound for a single remote write; `None` waits indefinitely.
    pub write_timeout: Option<Duration>,
    /// Additional attempts after the first failed write.
    pub retry_attempts: usize,
    pub retry_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            write_timeout: None,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Full item sequence queued for the remote store.
#[derive(Debug, Clone)]
pub(crate) struct PendingWrite {
    pub token: SessionToken,
    pub user_id: UserId,
    pub revision: u64,
    pub sequence: u64,
    pub snapshot: AssessmentSnapshot,
}

/// Single writer for one authenticated session.
///
/// Publishing replaces any write that has not started yet, so at most one
/// write is in flight and the remote store always ends on the newest
/// published sequence. Dropping the worker closes the queue; a write already
/// in flight still finishes but its result is checked against the session
/// token before it touches client state.
pub(crate) struct SyncWorker {
    pending: watch::Sender<Option<PendingWrite>>,
    settled: watch::Receiver<u64>,
    _task: JoinHandle<()>,
}

impl SyncWorker {
    pub(crate) fn spawn(
        client: Weak<AssessmentClient>,
        snapshots: Arc<dyn SnapshotStore>,
        options: SyncOptions,
    ) -> Self {
        let (pending, pending_rx) = watch::channel(None);
        let (settled_tx, settled) = watch::channel(0);
        let task = tokio::spawn(run_worker(
            client, snapshots, options, pending_rx, settled_tx,
        ));
        Self {
            pending,
            settled,
            _task: task,
        }
    }

    pub(crate) fn publish(&self, write: PendingWrite) {
        self.pending.send_replace(Some(write));
    }

    /// Receiver of the highest sequence that finished (written or given up).
    pub(crate) fn settled(&self) -> watch::Receiver<u64> {
        self.settled.clone()
    }
}

async fn run_worker(
    client: Weak<AssessmentClient>,
    snapshots: Arc<dyn SnapshotStore>,
    options: SyncOptions,
    mut pending: watch::Receiver<Option<PendingWrite>>,
    settled: watch::Sender<u64>,
) {
    while pending.changed().await.is_ok() {
        let Some(mut write) = pending.borrow_and_update().clone() else {
            continue;
        };

        let mut failures = 0usize;
        let outcome = loop {
            match write_once(snapshots.as_ref(), &write, options.write_timeout).await {
                Ok(()) => break Ok(()),
                Err(err) if failures >= options.retry_attempts => break Err(err),
                Err(err) => {
                    failures += 1;
                    warn!(
                        user_id = %write.user_id,
                        revision = write.revision,
                        attempt = failures,
                        max_attempts = options.retry_attempts,
                        error = %err,
                        "sync: write failed; retrying"
                    );
                    tokio::select! {
                        changed = pending.changed() => {
                            if changed.is_err() {
                                debug!(user_id = %write.user_id, "sync: session closed during retry wait");
                                return;
                            }
                            let newer = pending.borrow_and_update().clone();
                            if let Some(newer) = newer {
                                debug!(
                                    user_id = %newer.user_id,
                                    revision = newer.revision,
                                    "sync: newer snapshot replaces retried write"
                                );
                                write = newer;
                                failures = 0;
                            }
                        }
                        _ = tokio::time::sleep(options.retry_delay) => {}
                    }
                }
            }
        };

        match client.upgrade() {
            Some(client) => client.settle_write(&write, outcome).await,
            None => return,
        }
        settled.send_replace(write.sequence);
    }
    debug!("sync: worker stopped");
}

async fn write_once(
    snapshots: &dyn SnapshotStore,
    write: &PendingWrite,
    timeout: Option<Duration>,
) -> Result<(), AssessmentError> {
    let request = snapshots.write_snapshot(&write.user_id, &write.snapshot);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, request).await {
            Ok(result) => result,
            Err(_) => {
                return Err(AssessmentError::Persistence(format!(
                    "write timed out after {} ms",
                    limit.as_millis()
                )))
            }
        },
        None => request.await,
    };
    result.map_err(persistence_error)?;
    info!(
        user_id = %write.user_id,
        revision = write.revision,
        items = write.snapshot.items.len(),
        "sync: snapshot written"
    );
    Ok(())
}
