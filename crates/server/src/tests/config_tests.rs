use super::{load_settings_from, normalize_database_url, prepare_database_url, Settings};

use std::{
    collections::HashMap,
    env, fs,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults_apply_without_file_or_env() {
    let settings = load_settings_from(None, env_from(&[]));
    let defaults = Settings::default();
    assert_eq!(settings.server_bind, defaults.server_bind);
    assert_eq!(settings.database_url, defaults.database_url);
    assert!(settings.redis_url.is_none());
    assert_eq!(settings.delivery_config().ack_timeout, Duration::from_secs(10));
}

#[test]
fn file_values_are_overridden_by_env() {
    let file = r#"
bind_addr = "0.0.0.0:9000"
database_url = "sqlite://./from-file.db"
redis_url = "redis://file:6379"
"#;
    let settings = load_settings_from(
        Some(file),
        env_from(&[("APP__DATABASE_URL", "sqlite://./from-env.db")]),
    );
    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.database_url, "sqlite://./from-env.db");
    assert_eq!(settings.redis_url.as_deref(), Some("redis://file:6379"));
}

#[test]
fn app_prefixed_env_wins_over_plain_env() {
    let settings = load_settings_from(
        None,
        env_from(&[("SERVER_BIND", "127.0.0.1:1"), ("APP__BIND_ADDR", "127.0.0.1:2")]),
    );
    assert_eq!(settings.server_bind, "127.0.0.1:2");
}

#[test]
fn delivery_knobs_parse_and_bad_values_are_ignored() {
    let settings = load_settings_from(
        None,
        env_from(&[
            ("APP__ACK_TIMEOUT_MS", "2500"),
            ("APP__RESEND_BATCH_SIZE", "50"),
            ("APP__GROUP_CACHE_MAX", "not-a-number"),
        ]),
    );
    let delivery = settings.delivery_config();
    assert_eq!(delivery.ack_timeout, Duration::from_millis(2500));
    assert_eq!(delivery.resend_batch_size, 50);
    assert_eq!(delivery.group_cache_max, Settings::default().group_cache_max);
}

#[test]
fn unparseable_file_is_ignored() {
    let settings = load_settings_from(Some("this is [ not toml"), env_from(&[]));
    assert_eq!(settings.server_bind, Settings::default().server_bind);
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn keeps_memory_and_full_urls() {
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(
        normalize_database_url("sqlite://./x.db?mode=rwc"),
        "sqlite://./x.db?mode=rwc"
    );
    assert_eq!(normalize_database_url("   "), Settings::default().database_url);
}

#[test]
fn creates_parent_dir_for_sqlite_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("chat_delivery_config_test_{suffix}"));
    let db_path = temp_root.join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.join("data").exists());

    fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("chat_delivery_open_test_{suffix}"));
    let db_path = temp_root.join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );

    fs::remove_dir_all(temp_root).expect("cleanup");
}
