use super::*;

use std::{collections::HashMap, time::Duration};

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn defaults_apply_without_file_or_env() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let missing = temp_root.path().join("absent.toml");

    let err = load_settings_with(Some(&missing), env_from(&[])).expect_err("explicit file");
    assert!(err.to_string().contains("absent.toml"));

    let settings = Settings::default();
    let config = settings.client_config();
    assert_eq!(config.policy.demo_item_limit(), DEMO_ITEM_LIMIT);
    assert_eq!(config.sync.retry_attempts, 3);
    assert_eq!(config.sync.write_timeout, Some(Duration::from_secs(10)));
}

#[test]
fn file_values_override_defaults_and_env_overrides_file() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let path = temp_root.path().join("gap.toml");
    fs::write(
        &path,
        r#"
database_url = "sqlite://./from-file.db"
demo_item_limit = 4
report_dir = "./out"
sync_retry_attempts = 1
"#,
    )
    .expect("write config");

    let settings = load_settings_with(Some(&path), env_from(&[])).expect("settings");
    assert_eq!(settings.database_url, "sqlite://./from-file.db");
    assert_eq!(settings.demo_item_limit, 4);
    assert_eq!(settings.report_dir, PathBuf::from("./out"));
    assert_eq!(settings.sync_retry_attempts, 1);
    assert_eq!(settings.sync_retry_delay_ms, 500);

    let settings = load_settings_with(
        Some(&path),
        env_from(&[
            ("GAP_DATABASE_URL", "sqlite://./gap-env.db"),
            ("APP__DATABASE_URL", "sqlite://./app-env.db"),
            ("APP__SYNC_WRITE_TIMEOUT_MS", "0"),
            ("APP__DEMO_ITEM_LIMIT", "2"),
        ]),
    )
    .expect("settings");
    assert_eq!(settings.database_url, "sqlite://./app-env.db");
    assert_eq!(settings.demo_item_limit, 2);
    assert_eq!(settings.sync_write_timeout_ms, None);
}

#[test]
fn rejects_malformed_numbers_and_zero_demo_limit() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let path = temp_root.path().join("gap.toml");
    fs::write(&path, "demo_item_limit = 6\n").expect("write config");

    let err = load_settings_with(Some(&path), env_from(&[("APP__SYNC_RETRY_ATTEMPTS", "many")]))
        .expect_err("bad number");
    assert!(err.to_string().contains("APP__SYNC_RETRY_ATTEMPTS"));

    assert!(load_settings_with(Some(&path), env_from(&[("APP__DEMO_ITEM_LIMIT", "0")])).is_err());
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(
        normalize_database_url("sqlite:./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
}

#[test]
fn creates_parent_dir_for_sqlite_url() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("data").join("gap.db");

    let url = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(url.starts_with("sqlite://"));
    assert!(temp_root.path().join("data").exists());
}
