//! Stampede-protection integration tests

use method_cache::policy::source::ProgrammaticSource;
use method_cache::{CallOptions, Error, MethodCacheEngine, PolicyFragment, StampedeMode};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn hundred_concurrent_misses_invoke_the_factory_once() {
    let engine = Arc::new(MethodCacheEngine::builder().build().unwrap());
    let executions = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..100 {
        let engine = Arc::clone(&engine);
        let executions = Arc::clone(&executions);
        handles.push(tokio::spawn(async move {
            engine
                .get_or_create(
                    "Slow.Get",
                    &[json!("k")],
                    move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(json!(42))
                    },
                    CallOptions::default(),
                )
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), json!(42));
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn concurrent_failures_share_one_error() {
    let engine = Arc::new(MethodCacheEngine::builder().build().unwrap());
    let executions = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let engine = Arc::clone(&engine);
        let executions = Arc::clone(&executions);
        handles.push(tokio::spawn(async move {
            engine
                .get_or_create(
                    "Broken.Get",
                    &[json!(1)],
                    move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Err(anyhow::anyhow!("upstream down"))
                    },
                    CallOptions::default(),
                )
                .await
        }));
    }

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Factory { .. }));
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn stampede_mode_none_runs_every_caller() {
    let programmatic = Arc::new(ProgrammaticSource::new());
    let engine = Arc::new(
        MethodCacheEngine::builder()
            .with_source(Arc::clone(&programmatic) as _)
            .build()
            .unwrap(),
    );
    programmatic.set(
        "Unguarded.Get",
        PolicyFragment::new().stampede(StampedeMode::None),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let executions = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..5 {
        let engine = Arc::clone(&engine);
        let executions = Arc::clone(&executions);
        handles.push(tokio::spawn(async move {
            engine
                .get_or_create(
                    "Unguarded.Get",
                    &[json!(1)],
                    move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!(1))
                    },
                    CallOptions::default(),
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    // Without protection every concurrent miss pays the factory cost
    assert_eq!(executions.load(Ordering::SeqCst), 5);
    engine.shutdown().await;
}

#[tokio::test]
async fn cancelled_caller_gets_cancelled_while_others_complete() {
    let engine = Arc::new(MethodCacheEngine::builder().build().unwrap());

    // First caller starts a slow factory
    let survivor = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .get_or_create(
                    "Slow.Get",
                    &[json!(1)],
                    || async {
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        Ok(json!("done"))
                    },
                    CallOptions::default(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Second caller joins the same flight, then cancels
    let cancel = CancellationToken::new();
    let cancelled = {
        let engine = Arc::clone(&engine);
        let options = CallOptions::default().with_cancel(cancel.clone());
        tokio::spawn(async move {
            engine
                .get_or_create(
                    "Slow.Get",
                    &[json!(1)],
                    || async { Ok(json!("unused")) },
                    options,
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    assert_eq!(cancelled.await.unwrap().unwrap_err(), Error::Cancelled);
    assert_eq!(survivor.await.unwrap().unwrap(), json!("done"));

    // The factory ran to completion and its result was cached
    assert_eq!(
        engine.try_get("Slow.Get", &[json!(1)]).await,
        Some(json!("done"))
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn probabilistic_mode_serves_hits_and_eventually_refreshes() {
    let programmatic = Arc::new(ProgrammaticSource::new());
    let engine = Arc::new(
        MethodCacheEngine::builder()
            .with_source(Arc::clone(&programmatic) as _)
            .build()
            .unwrap(),
    );
    // A short TTL and an aggressive beta make an early refresh all but
    // certain across repeated hits
    programmatic.set(
        "Hot.Get",
        PolicyFragment::new()
            .duration(Duration::from_millis(500))
            .stampede(StampedeMode::Probabilistic { beta: 100.0 }),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let versions = Arc::new(AtomicUsize::new(0));
    let fill = |versions: Arc<AtomicUsize>| {
        move || async move {
            let version = versions.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!(version))
        }
    };

    // Fill
    let first = engine
        .get_or_create(
            "Hot.Get",
            &[json!(1)],
            fill(Arc::clone(&versions)),
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(first, json!(1));

    // Repeated hits keep returning a value while triggering refreshes
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let value = engine
            .get_or_create(
                "Hot.Get",
                &[json!(1)],
                fill(Arc::clone(&versions)),
                CallOptions::default(),
            )
            .await
            .unwrap();
        assert!(value.as_u64().unwrap() >= 1);
        if versions.load(Ordering::SeqCst) > 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no early refresh ever triggered"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    engine.shutdown().await;
}
