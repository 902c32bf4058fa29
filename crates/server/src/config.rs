use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration as StdDuration,
};

use anyhow::Context;
use chrono::Duration;
use serde::Deserialize;
use session_engine::{LifecycleWindows, MediaGrantConfig};
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub ringing_window_seconds: i64,
    pub cooldown_window_seconds: i64,
    pub retention_seconds: i64,
    pub sweep_interval_seconds: u64,
    pub end_requires_host: bool,
    pub media_api_key: String,
    pub media_api_secret: String,
    pub media_ttl_seconds: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/calls.db".into(),
            ringing_window_seconds: 60,
            cooldown_window_seconds: 60,
            retention_seconds: 7 * 24 * 60 * 60,
            sweep_interval_seconds: 30,
            end_requires_host: false,
            media_api_key: "devkey".into(),
            media_api_secret: "devsecret".into(),
            media_ttl_seconds: 3600,
        }
    }
}

impl Settings {
    pub fn windows(&self) -> LifecycleWindows {
        LifecycleWindows {
            ringing: Duration::seconds(self.ringing_window_seconds),
            cooldown: Duration::seconds(self.cooldown_window_seconds),
            retention: Duration::seconds(self.retention_seconds),
        }
    }

    pub fn media_grant(&self) -> MediaGrantConfig {
        MediaGrantConfig {
            api_key: self.media_api_key.clone(),
            api_secret: self.media_api_secret.clone(),
            ttl_seconds: self.media_ttl_seconds,
        }
    }

    pub fn sweep_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.sweep_interval_seconds.max(1))
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "bind_addr" => self.server_bind = value.to_string(),
            "database_url" => self.database_url = value.to_string(),
            "media_api_key" => self.media_api_key = value.to_string(),
            "media_api_secret" => self.media_api_secret = value.to_string(),
            "ringing_window_seconds" => parse_into(key, value, &mut self.ringing_window_seconds),
            "cooldown_window_seconds" => parse_into(key, value, &mut self.cooldown_window_seconds),
            "retention_seconds" => parse_into(key, value, &mut self.retention_seconds),
            "sweep_interval_seconds" => parse_into(key, value, &mut self.sweep_interval_seconds),
            "end_requires_host" => parse_into(key, value, &mut self.end_requires_host),
            "media_ttl_seconds" => parse_into(key, value, &mut self.media_ttl_seconds),
            _ => {}
        }
    }
}

/// Keys understood in `server.toml` and, upper-cased with an `APP__` prefix,
/// in the environment.
const KEYS: &[&str] = &[
    "bind_addr",
    "database_url",
    "ringing_window_seconds",
    "cooldown_window_seconds",
    "retention_seconds",
    "sweep_interval_seconds",
    "end_requires_host",
    "media_api_key",
    "media_api_secret",
    "media_ttl_seconds",
];

/// Bare environment names kept for deployments that predate the `APP__` prefix.
const BARE_ENV: &[(&str, &str)] = &[
    ("SERVER_BIND", "bind_addr"),
    ("DATABASE_URL", "database_url"),
    ("MEDIA_API_KEY", "media_api_key"),
    ("MEDIA_API_SECRET", "media_api_secret"),
];

pub fn load_settings() -> Settings {
    let file_cfg = fs::read_to_string("server.toml")
        .ok()
        .and_then(|raw| match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(cfg) => Some(cfg),
            Err(error) => {
                warn!(%error, "ignoring unreadable server.toml");
                None
            }
        })
        .unwrap_or_default();
    settings_from_sources(&file_cfg, |name| std::env::var(name).ok())
}

/// Defaults, then the file table, then bare env names, then `APP__*`.
pub fn settings_from_sources(
    file_cfg: &HashMap<String, String>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    for key in KEYS {
        if let Some(v) = file_cfg.get(*key) {
            settings.apply(*key, v);
        }
    }
    for (name, key) in BARE_ENV {
        if let Some(v) = env(*name) {
            settings.apply(*key, &v);
        }
    }
    for key in KEYS {
        if let Some(v) = env(&format!("APP__{}", key.to_ascii_uppercase())) {
            settings.apply(*key, &v);
        }
    }

    settings
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "ignoring invalid setting"),
    }
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
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
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
