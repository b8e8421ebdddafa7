//! Single-flight execution for stampede protection
//!
//! One factory execution per key miss: the first caller becomes the leader
//! and runs the work in a detached task; every concurrent caller for the
//! same key awaits the shared result, so all of them observe the same value
//! or the same error. A striped pool of mutexes (power-of-two size, selected
//! by key hash) bounds concurrent factory executions without per-key lock
//! allocation.
//!
//! Cancellation: each caller cancels independently and receives
//! [`Error::Cancelled`]; the underlying work is cancelled only when the last
//! awaiter goes away.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::key::stripe_hash;
use crate::{Error, Result};

type FlightResult = Result<Value>;

#[derive(Clone)]
struct FlightSlot {
    rx: watch::Receiver<Option<FlightResult>>,
    waiters: Arc<AtomicUsize>,
    child_cancel: CancellationToken,
}

struct FlightInner {
    stripes: Box<[Mutex<()>]>,
    mask: u64,
    inflight: DashMap<String, FlightSlot>,
}

/// Shared single-flight executor
#[derive(Clone)]
pub struct SingleFlight {
    inner: Arc<FlightInner>,
}

/// Decrements the waiter count on drop; the last waiter out cancels the
/// underlying work.
struct WaiterGuard {
    waiters: Arc<AtomicUsize>,
    child_cancel: CancellationToken,
}

impl WaiterGuard {
    fn register(slot: &FlightSlot) -> Self {
        slot.waiters.fetch_add(1, Ordering::SeqCst);
        Self {
            waiters: Arc::clone(&slot.waiters),
            child_cancel: slot.child_cancel.clone(),
        }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.waiters.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.child_cancel.cancel();
        }
    }
}

impl SingleFlight {
    /// Create an executor with `stripes` mutexes (rounded up to a power of
    /// two)
    #[must_use]
    pub fn new(stripes: usize) -> Self {
        let count = stripes.max(1).next_power_of_two();
        let stripes: Box<[Mutex<()>]> = (0..count).map(|_| Mutex::new(())).collect();
        Self {
            inner: Arc::new(FlightInner {
                mask: count as u64 - 1,
                stripes,
                inflight: DashMap::new(),
            }),
        }
    }

    /// Number of keys currently in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Execute `work` for `key` under single-flight.
    ///
    /// The first caller for a key spawns `work`; concurrent callers await
    /// the same outcome. `work` is responsible for its own re-probe: by the
    /// time a follower-turned-leader runs, the previous execution may
    /// already have filled the cache.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        work: F,
    ) -> FlightResult
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FlightResult> + Send + 'static,
    {
        let mut leader_tx = None;
        let (slot, guard) = match self.inner.inflight.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let slot = occupied.get().clone();
                let guard = WaiterGuard::register(&slot);
                (slot, guard)
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                let slot = FlightSlot {
                    rx,
                    // The leader counts as a waiter from the instant the slot
                    // becomes visible, so a follower that joins and cancels
                    // immediately cannot tear the flight down underneath it.
                    waiters: Arc::new(AtomicUsize::new(1)),
                    child_cancel: CancellationToken::new(),
                };
                let guard = WaiterGuard {
                    waiters: Arc::clone(&slot.waiters),
                    child_cancel: slot.child_cancel.clone(),
                };
                vacant.insert(slot.clone());
                leader_tx = Some(tx);
                (slot, guard)
            }
        };
        let _guard = guard;

        if let Some(tx) = leader_tx {
            let inner = Arc::clone(&self.inner);
            let child_cancel = slot.child_cancel.clone();
            let flight_key = key.to_string();
            tokio::spawn(async move {
                let stripe_index = (stripe_hash(&flight_key) & inner.mask) as usize;
                let result = tokio::select! {
                    () = child_cancel.cancelled() => {
                        trace!(key = %flight_key, "Flight cancelled by last awaiter");
                        Err(Error::Cancelled)
                    }
                    result = async {
                        // Stripe held only for the duration of one execution
                        let _stripe = inner.stripes[stripe_index].lock().await;
                        work().await
                    } => result,
                };
                let _ = tx.send(Some(result));
                inner.inflight.remove(&flight_key);
            });
        }

        let mut rx = slot.rx.clone();
        loop {
            let current = rx.borrow().clone();
            if let Some(result) = current {
                return result;
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Sender dropped without publishing: the leader task
                        // was torn down (runtime shutdown)
                        return Err(Error::Cancelled);
                    }
                }
            }
        }
    }
}
