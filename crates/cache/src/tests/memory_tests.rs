use std::time::Duration;

use super::*;

#[tokio::test]
async fn set_members_round_trip_and_empty_sets_disappear() {
    let cache = MemoryCache::new();
    assert!(cache.add_to_set("offline:1", "a").await.expect("sadd"));
    assert!(!cache.add_to_set("offline:1", "a").await.expect("sadd again"));
    assert!(cache.set_contains("offline:1", "a").await.expect("sismember"));

    assert!(cache.remove_from_set("offline:1", "a").await.expect("srem"));
    assert!(!cache.exists("offline:1").await.expect("exists"));
}

#[tokio::test]
async fn range_by_score_orders_and_limits() {
    let cache = MemoryCache::new();
    cache.add_to_sorted_set("z", 30.0, "c").await.expect("zadd");
    cache.add_to_sorted_set("z", 10.0, "a").await.expect("zadd");
    cache.add_to_sorted_set("z", 20.0, "b").await.expect("zadd");

    let all = cache
        .range_by_score("z", f64::NEG_INFINITY, f64::INFINITY, None)
        .await
        .expect("range");
    let members: Vec<_> = all.iter().map(|m| m.member.as_str()).collect();
    assert_eq!(members, vec!["a", "b", "c"]);

    let limited = cache
        .range_by_score("z", 15.0, f64::INFINITY, Some(1))
        .await
        .expect("range");
    assert_eq!(limited, vec![ScoredMember::new("b", 20.0)]);
}

#[tokio::test]
async fn wrong_type_is_reported() {
    let cache = MemoryCache::new();
    cache.set("plain", "value", None).await.expect("set");
    let err = cache.add_to_set("plain", "x").await.expect_err("wrong type");
    assert!(matches!(err, CacheError::WrongType(key) if key == "plain"));
}

#[tokio::test]
async fn keys_expire_lazily() {
    let cache = MemoryCache::new();
    cache
        .set("short", "lived", Some(Duration::from_millis(20)))
        .await
        .expect("set");
    assert_eq!(cache.get("short").await.expect("get").as_deref(), Some("lived"));
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(cache.get("short").await.expect("get"), None);
}

#[tokio::test]
async fn insert_if_exists_only_touches_existing_keys() {
    let cache = MemoryCache::new();
    assert!(!cache
        .insert_if_exists("group:members:1", 1.0, "7")
        .await
        .expect("missing"));
    assert!(!cache.exists("group:members:1").await.expect("exists"));

    cache
        .replace_sorted_set(
            "group:members:1",
            &[ScoredMember::new("5", 3.0)],
            Duration::from_secs(60),
        )
        .await
        .expect("replace");
    assert!(cache
        .insert_if_exists("group:members:1", 1.0, "7")
        .await
        .expect("present"));
    assert_eq!(cache.sorted_set_len("group:members:1").await.expect("len"), 2);
}

#[tokio::test]
async fn remove_scored_matching_checks_score_and_fields() {
    let cache = MemoryCache::new();
    let first = r#"{"id":"m1","recipient":"2","message":{}}"#;
    let second = r#"{"id":"m1","recipient":"3","message":{}}"#;
    let third = r#"{"id":"m1","recipient":"2","message":{"retry":true}}"#;
    cache.add_to_sorted_set("pending", 100.0, first).await.expect("zadd");
    cache.add_to_sorted_set("pending", 100.0, second).await.expect("zadd");
    cache.add_to_sorted_set("pending", 200.0, third).await.expect("zadd");

    let removed = cache
        .remove_scored_matching("pending", 100.0, &[("id", "m1"), ("recipient", "2")])
        .await
        .expect("remove");
    assert_eq!(removed, 1);

    let left: Vec<String> = cache
        .range_by_score("pending", f64::NEG_INFINITY, f64::INFINITY, None)
        .await
        .expect("range")
        .into_iter()
        .map(|m| m.member)
        .collect();
    assert_eq!(left, vec![second.to_string(), third.to_string()]);
}

#[tokio::test]
async fn evict_least_active_trims_index_and_member_keys() {
    let cache = MemoryCache::new();
    for group in 1..=4 {
        cache
            .add_to_sorted_set("group:active", group as f64, &group.to_string())
            .await
            .expect("index");
        cache
            .replace_sorted_set(
                &format!("group:members:{group}"),
                &[ScoredMember::new("1", 1.0)],
                Duration::from_secs(60),
            )
            .await
            .expect("members");
    }

    let mut evicted = cache
        .evict_least_active("group:active", 2, "group:members:")
        .await
        .expect("evict");
    evicted.sort();
    assert_eq!(evicted, vec!["1".to_string(), "2".to_string()]);
    assert!(!cache.exists("group:members:1").await.expect("exists"));
    assert!(cache.exists("group:members:4").await.expect("exists"));
    assert_eq!(cache.sorted_set_len("group:active").await.expect("len"), 2);

    let none = cache
        .evict_least_active("group:active", 2, "group:members:")
        .await
        .expect("evict again");
    assert!(none.is_empty());
}
