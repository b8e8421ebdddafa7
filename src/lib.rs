//! Method Cache
//!
//! A layered method-result caching engine for server-side applications:
//! interpose on idempotent service operations, store their return values
//! keyed by method identity and argument content, serve later calls from
//! fast storage, and invalidate on demand.
//!
//! # Features
//!
//! - **Layered storage**: in-process L1 with TTL and approximate-LRU
//!   eviction, optional distributed (L2) and persistent (L3) layers behind a
//!   uniform contract, async write fan-out, and L1 promotion on lower hits
//! - **Tag invalidation**: key-, tag-, and glob-pattern-based invalidation,
//!   propagated across instances over a pluggable backplane
//! - **Stampede protection**: strict single-flight, probabilistic early
//!   refresh, and refresh-ahead
//! - **Policy pipeline**: per-method policies merged from descriptors,
//!   watched config files, programmatic registration, and runtime overrides
//! - **Production ready**: circuit breakers per layer, bounded write queue
//!   with retry, structured tracing, statistics, graceful shutdown
//!
//! # Example
//!
//! ```
//! use method_cache::{CallOptions, MethodCacheEngine};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let engine = MethodCacheEngine::builder().build().unwrap();
//!
//! let user = engine
//!     .get_or_create(
//!         "UserService.GetUser",
//!         &[json!(42)],
//!         || async { Ok(json!({"id": 42, "name": "A"})) },
//!         CallOptions::default(),
//!     )
//!     .await
//!     .unwrap();
//! assert_eq!(user["id"], 42);
//! engine.shutdown().await;
//! # });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backplane;
pub mod breaker;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod entry;
pub mod error;
pub mod flight;
pub mod key;
pub mod layer;
pub mod manager;
pub mod memory;
pub mod policy;
pub mod queue;
pub mod stats;
pub mod tags;

pub use engine::{EngineBuilder, MethodCacheEngine};
pub use error::{Error, Result};
pub use manager::{CacheManager, CallOptions};
pub use policy::{CachePolicy, PolicyFragment, StampedeMode};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
