use super::{normalize_database_url, prepare_database_url, settings_from_sources, Settings};

use std::collections::HashMap;

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
}

#[test]
fn creates_parent_dir_for_relative_sqlite_url() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.path().join("data").exists());
}

#[test]
fn defaults_match_call_windows() {
    let settings = settings_from_sources(&HashMap::new(), |_| None);
    let windows = settings.windows();
    assert_eq!(windows.ringing.num_seconds(), 60);
    assert_eq!(windows.cooldown.num_seconds(), 60);
    assert_eq!(windows.retention.num_days(), 7);
    assert_eq!(settings.sweep_interval().as_secs(), 30);
    assert!(!settings.end_requires_host);
}

#[test]
fn env_overrides_file_and_prefixed_env_wins() {
    let file_cfg = HashMap::from([
        ("bind_addr".to_string(), "0.0.0.0:9000".to_string()),
        ("ringing_window_seconds".to_string(), "45".to_string()),
        ("end_requires_host".to_string(), "true".to_string()),
    ]);
    let env = HashMap::from([
        ("SERVER_BIND", "0.0.0.0:9100"),
        ("APP__BIND_ADDR", "0.0.0.0:9200"),
        ("APP__COOLDOWN_WINDOW_SECONDS", "90"),
        ("APP__SWEEP_INTERVAL_SECONDS", "not-a-number"),
    ]);

    let settings = settings_from_sources(&file_cfg, |name| env.get(name).map(|v| v.to_string()));

    assert_eq!(settings.server_bind, "0.0.0.0:9200");
    assert_eq!(settings.ringing_window_seconds, 45);
    assert_eq!(settings.cooldown_window_seconds, 90);
    assert_eq!(settings.sweep_interval_seconds, 30);
    assert!(settings.end_requires_host);
}

#[test]
fn media_grant_config_comes_from_settings() {
    let env = HashMap::from([("MEDIA_API_SECRET", "rotated")]);
    let settings = settings_from_sources(&HashMap::new(), |name| env.get(name).map(|v| v.to_string()));
    let media = settings.media_grant();
    assert_eq!(media.api_key, "devkey");
    assert_eq!(media.api_secret, "rotated");
    assert_eq!(media.ttl_seconds, 3600);
}
