use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::UserId,
    protocol::{AssessmentSnapshot, ControlItemRecord},
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSubscription {
    pub user_id: UserId,
    pub active: bool,
    pub started_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory URL opens its own empty database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn load_assessment(&self, user_id: &UserId) -> Result<Option<AssessmentSnapshot>> {
        let row = sqlx::query("SELECT items_json, last_updated FROM assessments WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read assessment for user '{user_id}'"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let items_json: String = row.try_get(0)?;
        let last_updated: String = row.try_get(1)?;
        let items: Vec<ControlItemRecord> = serde_json::from_str(&items_json)
            .with_context(|| format!("stored assessment for user '{user_id}' is not valid JSON"))?;
        Ok(Some(AssessmentSnapshot {
            items,
            last_updated: Some(parse_timestamp(&last_updated)?),
        }))
    }

    /// Replaces the whole stored item sequence for `user_id`.
    pub async fn save_assessment(
        &self,
        user_id: &UserId,
        snapshot: &AssessmentSnapshot,
    ) -> Result<()> {
        let items_json =
            serde_json::to_string(&snapshot.items).context("failed to encode assessment items")?;
        let last_updated = snapshot.last_updated.unwrap_or_else(Utc::now).to_rfc3339();
        sqlx::query(
            "INSERT INTO assessments (user_id, items_json, last_updated)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET items_json=excluded.items_json, last_updated=excluded.last_updated",
        )
        .bind(user_id.as_str())
        .bind(items_json)
        .bind(last_updated)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write assessment for user '{user_id}'"))?;
        Ok(())
    }

    pub async fn delete_assessment(&self, user_id: &UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM assessments WHERE user_id = ?")
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn subscription(&self, user_id: &UserId) -> Result<Option<StoredSubscription>> {
        let row = sqlx::query("SELECT active, started_at FROM subscriptions WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read subscription for user '{user_id}'"))?;

        row.map(|r| -> Result<StoredSubscription> {
            let started_at: String = r.try_get(1)?;
            Ok(StoredSubscription {
                user_id: user_id.clone(),
                active: r.try_get::<bool, _>(0)?,
                started_at: parse_timestamp(&started_at)?,
            })
        })
        .transpose()
    }

    pub async fn set_subscription(
        &self,
        user_id: &UserId,
        active: bool,
    ) -> Result<StoredSubscription> {
        let started_at = Utc::now();
        sqlx::query(
            "INSERT INTO subscriptions (user_id, active, started_at)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET active=excluded.active, started_at=excluded.started_at",
        )
        .bind(user_id.as_str())
        .bind(active)
        .bind(started_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write subscription for user '{user_id}'"))?;
        Ok(StoredSubscription {
            user_id: user_id.clone(),
            active,
            started_at,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    // sqlite CURRENT_TIMESTAMP default
    let naive = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("invalid stored timestamp '{raw}'"))?;
    Ok(naive.and_utc())
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
