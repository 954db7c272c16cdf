use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{
    domain::{TierStatus, UserId},
    protocol::AssessmentSnapshot,
};
use storage::Storage;
use tracing::debug;

use crate::{SnapshotStore, TierSource};

/// Snapshot and billing collaborator backed by the local SQLite database.
pub struct DurableAssessmentBackend {
    store: Storage,
}

impl DurableAssessmentBackend {
    pub async fn initialize(database_url: &str) -> Result<Arc<Self>> {
        let store = Storage::new(database_url)
            .await
            .with_context(|| format!("failed to initialize assessment storage at '{database_url}'"))?;
        Ok(Arc::new(Self { store }))
    }

    pub fn storage(&self) -> &Storage {
        &self.store
    }

    pub fn sqlite_url_for_data_dir(base_dir: &Path) -> String {
        format!(
            "sqlite://{}",
            base_dir.join("assessments.db").to_string_lossy().replace('\\', "/")
        )
    }
}

#[async_trait]
impl SnapshotStore for DurableAssessmentBackend {
    async fn read_snapshot(&self, user_id: &UserId) -> Result<Option<AssessmentSnapshot>> {
        let snapshot = self.store.load_assessment(user_id).await?;
        debug!(
            user_id = %user_id,
            found = snapshot.is_some(),
            "storage: snapshot read"
        );
        Ok(snapshot)
    }

    async fn write_snapshot(&self, user_id: &UserId, snapshot: &AssessmentSnapshot) -> Result<()> {
        self.store.save_assessment(user_id, snapshot).await
    }
}

#[async_trait]
impl TierSource for DurableAssessmentBackend {
    async fn read_tier_status(&self, user_id: &UserId) -> Result<TierStatus> {
        let subscription = self
            .store
            .subscription(user_id)
            .await
            .with_context(|| format!("failed to resolve tier for user '{user_id}'"))?;
        Ok(match subscription {
            Some(subscription) if subscription.active => TierStatus::Pro,
            _ => TierStatus::Demo,
        })
    }
}

#[cfg(test)]
#[path = "tests/durable_tests.rs"]
mod tests;
