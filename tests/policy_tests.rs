//! Policy-resolution integration tests across all four source tiers

use method_cache::policy::runtime::PolicyOverride;
use method_cache::policy::source::{DescriptorSource, ProgrammaticSource};
use method_cache::{MethodCacheEngine, PolicyFragment};
use pretty_assertions::assert_eq;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn write_policy_file(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("methodcache.yaml");
    let mut f = std::fs::File::create(&path).expect("create policy file");
    f.write_all(content.as_bytes()).expect("write policy file");
    path
}

/// Descriptor says 1h, file says 30m, programmatic says 2h, runtime
/// override says 5m. The override wins; removing it restores 2h.
#[tokio::test]
async fn runtime_override_wins_and_removal_restores_programmatic() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_policy_file(
        &dir,
        r"
MethodCache:
  Services:
    M:
      Duration: 30m
",
    );

    let descriptors = Arc::new(DescriptorSource::new());
    descriptors.register("M", PolicyFragment::new().duration(Duration::from_secs(3600)));
    let programmatic = Arc::new(ProgrammaticSource::new());
    programmatic
        .method("M")
        .duration(Duration::from_secs(7200))
        .apply();

    let engine = MethodCacheEngine::builder()
        .with_source(descriptors as _)
        .with_source(programmatic as _)
        .with_policy_file(&path)
        .unwrap()
        .without_file_watching()
        .build()
        .unwrap();

    // Sanity: without an override the programmatic source (priority 30) wins
    assert_eq!(engine.get_effective("M").duration, Duration::from_secs(7200));

    engine.apply_overrides(vec![PolicyOverride::new(
        "M",
        PolicyFragment::new().duration(Duration::from_secs(300)),
    )]);
    settle().await;
    assert_eq!(engine.get_effective("M").duration, Duration::from_secs(300));

    engine.remove_override("M");
    settle().await;
    assert_eq!(engine.get_effective("M").duration, Duration::from_secs(7200));

    engine.shutdown().await;
}

#[tokio::test]
async fn file_source_fills_fields_the_higher_tiers_leave_unset() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_policy_file(
        &dir,
        r"
MethodCache:
  Defaults:
    Tags: [site]
  Services:
    M:
      Duration: 30m
      Version: 3
      Tags: [from-file]
",
    );

    let programmatic = Arc::new(ProgrammaticSource::new());
    programmatic.method("M").tag("from-code").apply();

    let engine = MethodCacheEngine::builder()
        .with_source(programmatic as _)
        .with_policy_file(&path)
        .unwrap()
        .without_file_watching()
        .build()
        .unwrap();

    let policy = engine.get_effective("M");
    // Version and duration come from the file (no higher contribution)
    assert_eq!(policy.duration, Duration::from_secs(1800));
    assert_eq!(policy.version, 3);
    // Tags union across every tier
    assert!(policy.tags.contains(&"from-code".to_string()));
    assert!(policy.tags.contains(&"from-file".to_string()));
    assert!(policy.tags.contains(&"site".to_string()));

    engine.shutdown().await;
}

#[tokio::test]
async fn applying_the_same_override_twice_is_idempotent() {
    let engine = MethodCacheEngine::builder().build().unwrap();

    let fragment = PolicyFragment::new()
        .duration(Duration::from_secs(120))
        .tag("t");
    engine.apply_overrides(vec![PolicyOverride::new("M", fragment.clone())]);
    settle().await;
    let once = engine.get_effective("M");

    engine.apply_overrides(vec![PolicyOverride::new("M", fragment)]);
    settle().await;
    let twice = engine.get_effective("M");

    assert_eq!(once.duration, twice.duration);
    assert_eq!(once.tags, twice.tags);
    assert_eq!(engine.get_overrides().len(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn idempotency_requirement_is_or_ed_across_tiers() {
    let descriptors = Arc::new(DescriptorSource::new());
    descriptors.register("M", PolicyFragment::new().require_idempotent(true));
    let programmatic = Arc::new(ProgrammaticSource::new());
    programmatic
        .method("M")
        .duration(Duration::from_secs(60))
        .apply();

    let engine = MethodCacheEngine::builder()
        .with_source(descriptors as _)
        .with_source(programmatic as _)
        .build()
        .unwrap();

    // The low-priority descriptor's requirement survives the merge
    assert!(engine.get_effective("M").require_idempotent);

    engine.shutdown().await;
}

#[tokio::test]
async fn policy_changes_take_effect_on_subsequent_calls() {
    use method_cache::CallOptions;
    use serde_json::json;

    let programmatic = Arc::new(ProgrammaticSource::new());
    programmatic
        .method("M.Get")
        .duration(Duration::from_secs(3600))
        .apply();

    let engine = MethodCacheEngine::builder()
        .with_source(Arc::clone(&programmatic) as _)
        .build()
        .unwrap();

    engine
        .get_or_create(
            "M.Get",
            &[json!(1)],
            || async { Ok(json!("v1")) },
            CallOptions::default(),
        )
        .await
        .unwrap();

    // Bump the version at runtime: subsequent calls derive a different key
    // and the old entry becomes unreachable
    engine.apply_overrides(vec![PolicyOverride::new(
        "M.Get",
        PolicyFragment::new().version(2),
    )]);
    settle().await;

    let value = engine
        .get_or_create(
            "M.Get",
            &[json!(1)],
            || async { Ok(json!("v2")) },
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(value, json!("v2"));

    engine.shutdown().await;
}
