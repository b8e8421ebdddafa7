//! Circuit breaker protecting lower cache layers
//!
//! A layer whose breaker is open reports "not present" for reads and skips
//! writes, so a failing store never extends the caller's critical path.
//! After the reset timeout the breaker moves to half-open and lets a trial
//! request through; enough successes close it again.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::entry::epoch_millis_now;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected until the reset timeout elapses
    Open,
    /// A limited number of trial requests probe the layer
    HalfOpen,
}

impl BreakerState {
    /// Lowercase label used in health snapshots
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Cheap-to-clone observability snapshot
#[derive(Debug, Clone)]
pub struct BreakerStats {
    /// Current state
    pub state: BreakerState,
    /// Open transitions since creation
    pub trips: u64,
    /// Milliseconds until a trial request is allowed (0 unless open)
    pub retry_after_ms: u64,
    /// Consecutive failures in the closed state
    pub current_failures: u32,
}

/// Circuit breaker guarding one cache layer
pub struct LayerBreaker {
    layer: String,
    enabled: bool,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    state: RwLock<BreakerState>,
    failures: AtomicU32,
    successes: AtomicU32,
    /// Epoch-ms of the last state change
    last_change_ms: AtomicU64,
    trips: AtomicU64,
}

impl LayerBreaker {
    /// Create a breaker for the named layer
    #[must_use]
    pub fn new(layer: &str, config: &BreakerConfig) -> Self {
        Self {
            layer: layer.to_string(),
            enabled: config.enabled,
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            reset_timeout: config.reset_timeout,
            state: RwLock::new(BreakerState::Closed),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            last_change_ms: AtomicU64::new(0),
            trips: AtomicU64::new(0),
        }
    }

    /// Whether a request may proceed.
    ///
    /// In the open state the reset timeout is compared against wall-clock
    /// epoch milliseconds; once elapsed the breaker moves to half-open and
    /// the request becomes the trial probe.
    pub fn can_proceed(&self) -> bool {
        if !self.enabled {
            return true;
        }
        let state = *self.state.read();
        match state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed =
                    epoch_millis_now().saturating_sub(self.last_change_ms.load(Ordering::Relaxed));
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = self.reset_timeout.as_millis() as u64;
                if elapsed >= timeout_ms {
                    debug!(layer = %self.layer, "Breaker reset timeout elapsed, probing half-open");
                    self.transition_to(BreakerState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful layer operation
    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }
        match *self.state.read() {
            BreakerState::Closed => {
                self.failures.store(0, Ordering::Relaxed);
            }
            BreakerState::HalfOpen => {
                let successes = self.successes.fetch_add(1, Ordering::Relaxed) + 1;
                if successes >= self.success_threshold {
                    self.transition_to(BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed layer operation
    pub fn record_failure(&self) {
        if !self.enabled {
            return;
        }
        match *self.state.read() {
            BreakerState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.failure_threshold {
                    self.transition_to(BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                warn!(layer = %self.layer, "Trial request failed, reopening breaker");
                self.transition_to(BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> BreakerState {
        *self.state.read()
    }

    /// Observability snapshot
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let state = *self.state.read();
        let retry_after_ms = if state == BreakerState::Open {
            let elapsed =
                epoch_millis_now().saturating_sub(self.last_change_ms.load(Ordering::Relaxed));
            #[allow(clippy::cast_possible_truncation)]
            let reset_ms = self.reset_timeout.as_millis() as u64;
            reset_ms.saturating_sub(elapsed)
        } else {
            0
        };
        BreakerStats {
            state,
            trips: self.trips.load(Ordering::Relaxed),
            retry_after_ms,
            current_failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn transition_to(&self, new_state: BreakerState) {
        let mut state = self.state.write();
        if *state == new_state {
            return;
        }
        *state = new_state;
        self.last_change_ms.store(epoch_millis_now(), Ordering::Relaxed);

        match new_state {
            BreakerState::Closed => {
                self.failures.store(0, Ordering::Relaxed);
                self.successes.store(0, Ordering::Relaxed);
                info!(layer = %self.layer, "Layer breaker closed");
            }
            BreakerState::Open => {
                self.trips.fetch_add(1, Ordering::Relaxed);
                warn!(
                    layer = %self.layer,
                    failures = self.failures.load(Ordering::Relaxed),
                    "Layer breaker opened"
                );
            }
            BreakerState::HalfOpen => {
                self.successes.store(0, Ordering::Relaxed);
            }
        }
    }
}
