//! End-to-end integration tests for the cache engine

use method_cache::layer::{CacheLayer, InMemoryStore, LayerKind};
use method_cache::policy::source::ProgrammaticSource;
use method_cache::{CallOptions, MethodCacheEngine, PolicyFragment};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn settle() {
    // Let policy listeners drain pending change events
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn basic_hit_with_counters() {
    let engine = MethodCacheEngine::builder().build().unwrap();

    // Fill u:1 with a 60s TTL and the users tag
    let options = CallOptions::default().with_override(
        PolicyFragment::new()
            .duration(Duration::from_secs(60))
            .tag("users"),
    );
    let value = engine
        .get_or_create(
            "Users.Get",
            &[json!("u:1")],
            || async { Ok(json!({"id": 1, "name": "A"})) },
            options,
        )
        .await
        .unwrap();
    assert_eq!(value, json!({"id": 1, "name": "A"}));

    // Read it back
    let cached = engine.try_get("Users.Get", &[json!("u:1")]).await;
    assert_eq!(cached, Some(json!({"id": 1, "name": "A"})));

    let stats = engine.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn tag_invalidation_removes_all_tagged_entries() {
    let programmatic = Arc::new(ProgrammaticSource::new());
    let engine = MethodCacheEngine::builder()
        .with_source(Arc::clone(&programmatic) as _)
        .build()
        .unwrap();

    programmatic
        .method("Users.Get")
        .duration(Duration::from_secs(60))
        .tag("users")
        .apply();
    settle().await;

    for id in ["u:1", "u:2"] {
        engine
            .get_or_create(
                "Users.Get",
                &[json!(id)],
                move || async move { Ok(json!({"id": id})) },
                CallOptions::default(),
            )
            .await
            .unwrap();
    }
    assert!(engine.try_get("Users.Get", &[json!("u:1")]).await.is_some());
    assert!(engine.try_get("Users.Get", &[json!("u:2")]).await.is_some());

    engine.invalidate_tags(&["users".to_string()]).await;

    assert_eq!(engine.try_get("Users.Get", &[json!("u:1")]).await, None);
    assert_eq!(engine.try_get("Users.Get", &[json!("u:2")]).await, None);
    engine.shutdown().await;
}

#[tokio::test]
async fn star_pattern_invalidates_every_tag() {
    let engine = MethodCacheEngine::builder().build().unwrap();

    for (method, tag) in [("A.Get", "alpha"), ("B.Get", "beta")] {
        let options =
            CallOptions::default().with_override(PolicyFragment::new().tag(tag));
        engine
            .get_or_create(
                method,
                &[json!(1)],
                || async { Ok(json!(1)) },
                options,
            )
            .await
            .unwrap();
    }

    engine.invalidate_tag_pattern("*").await;

    assert_eq!(engine.try_get("A.Get", &[json!(1)]).await, None);
    assert_eq!(engine.try_get("B.Get", &[json!(1)]).await, None);
    engine.shutdown().await;
}

#[tokio::test]
async fn invalidation_is_idempotent() {
    let engine = MethodCacheEngine::builder().build().unwrap();

    engine
        .get_or_create(
            "Svc.Get",
            &[json!(1)],
            || async { Ok(json!(1)) },
            CallOptions::default(),
        )
        .await
        .unwrap();

    // The cache key is derived from method identity and arguments; grab it
    // by invalidating the tag-free entry twice through the same path
    let keys: Vec<String> = vec![method_cache::key::generate(
        "Svc.Get",
        &[json!(1)],
        &method_cache::CachePolicy::default(),
    )];
    engine.invalidate_keys(&keys).await;
    engine.invalidate_keys(&keys).await;

    assert_eq!(engine.try_get("Svc.Get", &[json!(1)]).await, None);
    engine.shutdown().await;
}

#[tokio::test]
async fn invalidate_then_fill_serves_the_new_value() {
    let engine = MethodCacheEngine::builder().build().unwrap();

    engine
        .get_or_create(
            "Svc.Get",
            &[json!(1)],
            || async { Ok(json!("old")) },
            CallOptions::default(),
        )
        .await
        .unwrap();

    let keys = vec![method_cache::key::generate(
        "Svc.Get",
        &[json!(1)],
        &method_cache::CachePolicy::default(),
    )];
    engine.invalidate_keys(&keys).await;

    let value = engine
        .get_or_create(
            "Svc.Get",
            &[json!(1)],
            || async { Ok(json!("new")) },
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(value, json!("new"));
    engine.shutdown().await;
}

#[tokio::test]
async fn clear_empties_the_engine() {
    let l2 = Arc::new(InMemoryStore::new("l2", LayerKind::Distributed));
    let engine = MethodCacheEngine::builder()
        .with_distributed(Arc::clone(&l2) as Arc<dyn CacheLayer>)
        .build()
        .unwrap();

    engine
        .get_or_create(
            "Svc.Get",
            &[json!(1)],
            || async { Ok(json!(1)) },
            CallOptions::default(),
        )
        .await
        .unwrap();

    engine.clear().await;

    assert_eq!(engine.try_get("Svc.Get", &[json!(1)]).await, None);
    assert_eq!(engine.memory_stats().entries, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn expired_entries_miss_after_the_ttl() {
    let engine = MethodCacheEngine::builder().build().unwrap();

    let options = CallOptions::default()
        .with_override(PolicyFragment::new().duration(Duration::from_millis(30)));
    engine
        .get_or_create(
            "Short.Get",
            &[json!(1)],
            || async { Ok(json!(1)) },
            options,
        )
        .await
        .unwrap();
    assert!(engine.try_get("Short.Get", &[json!(1)]).await.is_some());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(engine.try_get("Short.Get", &[json!(1)]).await, None);
    engine.shutdown().await;
}
