use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use client_core::{ClientConfig, SyncOptions, TierPolicy, DEMO_ITEM_LIMIT};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "gap.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub demo_item_limit: usize,
    pub report_dir: PathBuf,
    pub sync_write_timeout_ms: Option<u64>,
    pub sync_retry_attempts: usize,
    pub sync_retry_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/gap.db".into(),
            demo_item_limit: DEMO_ITEM_LIMIT,
            report_dir: PathBuf::from("./reports"),
            sync_write_timeout_ms: Some(10_000),
            sync_retry_attempts: 3,
            sync_retry_delay_ms: 500,
        }
    }
}

impl Settings {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            policy: TierPolicy::new(self.demo_item_limit),
            sync: SyncOptions {
                write_timeout: self.sync_write_timeout_ms.map(Duration::from_millis),
                retry_attempts: self.sync_retry_attempts,
                retry_delay: Duration::from_millis(self.sync_retry_delay_ms),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    database_url: Option<String>,
    demo_item_limit: Option<usize>,
    report_dir: Option<PathBuf>,
    sync_write_timeout_ms: Option<u64>,
    sync_retry_attempts: Option<usize>,
    sync_retry_delay_ms: Option<u64>,
}

/// Defaults, then the config file, then environment variables.
///
/// An explicit `config_path` must exist; the default `gap.toml` is optional.
pub fn load_settings(config_path: Option<&Path>) -> anyhow::Result<Settings> {
    load_settings_with(config_path, |key| std::env::var(key).ok())
}

pub fn load_settings_with(
    config_path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let (path, required) = match config_path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let file_cfg: FileSettings = toml::from_str(&raw)
                .with_context(|| format!("invalid config file '{}'", path.display()))?;
            apply_file(&mut settings, file_cfg);
        }
        Err(err) if required => {
            return Err(err).with_context(|| format!("failed to read config file '{}'", path.display()));
        }
        Err(_) => {}
    }

    if let Some(v) = env("GAP_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DEMO_ITEM_LIMIT") {
        settings.demo_item_limit = parse_env("APP__DEMO_ITEM_LIMIT", &v)?;
    }
    if let Some(v) = env("APP__REPORT_DIR") {
        settings.report_dir = PathBuf::from(v);
    }
    if let Some(v) = env("APP__SYNC_WRITE_TIMEOUT_MS") {
        let timeout: u64 = parse_env("APP__SYNC_WRITE_TIMEOUT_MS", &v)?;
        // 0 disables the timeout
        settings.sync_write_timeout_ms = (timeout > 0).then_some(timeout);
    }
    if let Some(v) = env("APP__SYNC_RETRY_ATTEMPTS") {
        settings.sync_retry_attempts = parse_env("APP__SYNC_RETRY_ATTEMPTS", &v)?;
    }
    if let Some(v) = env("APP__SYNC_RETRY_DELAY_MS") {
        settings.sync_retry_delay_ms = parse_env("APP__SYNC_RETRY_DELAY_MS", &v)?;
    }

    if settings.demo_item_limit == 0 {
        bail!("demo_item_limit must be at least 1");
    }
    Ok(settings)
}

fn apply_file(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.demo_item_limit {
        settings.demo_item_limit = v;
    }
    if let Some(v) = file_cfg.report_dir {
        settings.report_dir = v;
    }
    if let Some(v) = file_cfg.sync_write_timeout_ms {
        settings.sync_write_timeout_ms = (v > 0).then_some(v);
    }
    if let Some(v) = file_cfg.sync_retry_attempts {
        settings.sync_retry_attempts = v;
    }
    if let Some(v) = file_cfg.sync_retry_delay_ms {
        settings.sync_retry_delay_ms = v;
    }
}

fn parse_env<T>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("invalid value '{raw}' for {key}"))
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
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
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
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
#[path = "tests/config_tests.rs"]
mod tests;
