use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use delivery::DeliveryConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// Use the Redis cache backend when set (requires the `redis` feature).
    pub redis_url: Option<String>,
    pub ack_timeout_ms: u64,
    pub resend_interval_ms: u64,
    pub resend_batch_size: usize,
    pub group_cache_max: usize,
    pub send_queue_capacity: usize,
    pub shutdown_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let delivery = DeliveryConfig::default();
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/server.db".into(),
            redis_url: None,
            ack_timeout_ms: delivery.ack_timeout.as_millis() as u64,
            resend_interval_ms: delivery.resend_interval.as_millis() as u64,
            resend_batch_size: delivery.resend_batch_size,
            group_cache_max: delivery.group_cache_max,
            send_queue_capacity: delivery.send_queue_capacity,
            shutdown_timeout_ms: delivery.shutdown_timeout.as_millis() as u64,
        }
    }
}

impl Settings {
    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            resend_interval: Duration::from_millis(self.resend_interval_ms),
            resend_batch_size: self.resend_batch_size,
            group_cache_max: self.group_cache_max,
            send_queue_capacity: self.send_queue_capacity,
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            ..DeliveryConfig::default()
        }
    }
}

/// Defaults, then `server.toml`, then environment variables.
pub fn load_settings() -> Settings {
    let file = fs::read_to_string("server.toml").ok();
    load_settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

pub(crate) fn load_settings_from(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.server_bind = v.clone();
            }
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("redis_url") {
                settings.redis_url = Some(v.clone());
            }
        }
    }

    if let Some(v) = env("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = env("REDIS_URL") {
        settings.redis_url = Some(v);
    }
    if let Some(v) = env("APP__REDIS_URL") {
        settings.redis_url = Some(v);
    }

    if let Some(parsed) = env("APP__ACK_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.ack_timeout_ms = parsed;
    }
    if let Some(parsed) = env("APP__RESEND_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        settings.resend_interval_ms = parsed;
    }
    if let Some(parsed) = env("APP__RESEND_BATCH_SIZE").and_then(|v| v.parse().ok()) {
        settings.resend_batch_size = parsed;
    }
    if let Some(parsed) = env("APP__GROUP_CACHE_MAX").and_then(|v| v.parse().ok()) {
        settings.group_cache_max = parsed;
    }
    if let Some(parsed) = env("APP__SEND_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
        settings.send_queue_capacity = parsed;
    }
    if let Some(parsed) = env("APP__SHUTDOWN_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.shutdown_timeout_ms = parsed;
    }

    settings
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
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
