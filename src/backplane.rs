//! Cross-instance invalidation backplane
//!
//! Invalidations performed by one engine instance are published as
//! [`BackplaneMessage`]s; every other instance applies them locally so its
//! L1 converges. Delivery is best-effort: duplicates and reordering are
//! tolerated because invalidation is idempotent, and receivers drop messages
//! stamped with their own origin.
//!
//! Two transports ship with the crate: [`LoopbackHub`] (an in-process
//! broadcast channel, used by tests and by multi-engine processes) and
//! [`PollingBackplane`] (polls a [`MessageStore`] table for rows above the
//! last-seen id, de-duplicating within a bounded window; this is the shape
//! when the backplane shares a relational store with L3).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BackplaneConfig;
use crate::Result;

// ── Wire format ───────────────────────────────────────────────────────────

/// Invalidation message exchanged between engine instances
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackplaneMessage {
    /// Invalidate one key
    Key {
        /// Cache key
        key: String,
        /// Emitting instance
        origin: Uuid,
        /// Publish time (UTC)
        timestamp: DateTime<Utc>,
    },
    /// Invalidate every entry carrying a tag
    Tag {
        /// Tag
        tag: String,
        /// Emitting instance
        origin: Uuid,
        /// Publish time (UTC)
        timestamp: DateTime<Utc>,
    },
    /// Clear the whole cache
    Clear {
        /// Emitting instance
        origin: Uuid,
        /// Publish time (UTC)
        timestamp: DateTime<Utc>,
    },
}

impl BackplaneMessage {
    /// Key-invalidation message stamped now
    #[must_use]
    pub fn key(key: impl Into<String>, origin: Uuid) -> Self {
        Self::Key {
            key: key.into(),
            origin,
            timestamp: Utc::now(),
        }
    }

    /// Tag-invalidation message stamped now
    #[must_use]
    pub fn tag(tag: impl Into<String>, origin: Uuid) -> Self {
        Self::Tag {
            tag: tag.into(),
            origin,
            timestamp: Utc::now(),
        }
    }

    /// Clear-all message stamped now
    #[must_use]
    pub fn clear(origin: Uuid) -> Self {
        Self::Clear {
            origin,
            timestamp: Utc::now(),
        }
    }

    /// Emitting instance id
    #[must_use]
    pub fn origin(&self) -> Uuid {
        match self {
            Self::Key { origin, .. } | Self::Tag { origin, .. } | Self::Clear { origin, .. } => {
                *origin
            }
        }
    }

    /// Publish timestamp
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Key { timestamp, .. }
            | Self::Tag { timestamp, .. }
            | Self::Clear { timestamp, .. } => *timestamp,
        }
    }

    /// Key or tag payload; `None` for clear-all
    #[must_use]
    pub fn payload(&self) -> Option<&str> {
        match self {
            Self::Key { key, .. } => Some(key),
            Self::Tag { tag, .. } => Some(tag),
            Self::Clear { .. } => None,
        }
    }
}

// ── Transport contract ────────────────────────────────────────────────────

/// Pluggable backplane transport
#[async_trait]
pub trait BackplaneTransport: Send + Sync {
    /// Transport name for logs
    fn name(&self) -> &str;

    /// Publish one message to every other instance
    async fn publish(&self, msg: &BackplaneMessage) -> Result<()>;

    /// Open a message stream.
    ///
    /// The stream ends when the transport loses its connection; the
    /// subscriber treats that as a fault and reconnects with backoff.
    async fn subscribe(&self) -> Result<BoxStream<'static, BackplaneMessage>>;
}

// ── Loopback transport ────────────────────────────────────────────────────

/// Shared in-process hub connecting loopback transports.
///
/// Engines in the same process clone the hub and build one transport each;
/// multi-instance tests exercise real cross-instance invalidation this way.
#[derive(Clone)]
pub struct LoopbackHub {
    tx: broadcast::Sender<BackplaneMessage>,
}

impl LoopbackHub {
    /// Create a hub with the given channel capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    /// Build a transport attached to this hub
    #[must_use]
    pub fn transport(&self) -> LoopbackBackplane {
        LoopbackBackplane { tx: self.tx.clone() }
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// In-process broadcast transport
pub struct LoopbackBackplane {
    tx: broadcast::Sender<BackplaneMessage>,
}

#[async_trait]
impl BackplaneTransport for LoopbackBackplane {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn publish(&self, msg: &BackplaneMessage) -> Result<()> {
        // No receivers is not a failure: a single-instance deployment simply
        // has nobody to tell.
        let _ = self.tx.send(msg.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, BackplaneMessage>> {
        let stream = BroadcastStream::new(self.tx.subscribe())
            .filter_map(|item| futures::future::ready(item.ok()));
        Ok(stream.boxed())
    }
}

// ── Polling transport ─────────────────────────────────────────────────────

/// Append-only message table with monotonically increasing ids
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message, returning its id
    async fn append(&self, msg: &BackplaneMessage) -> Result<u64>;

    /// Fetch up to `limit` messages with id greater than `after`
    async fn fetch_after(&self, after: u64, limit: usize) -> Result<Vec<(u64, BackplaneMessage)>>;
}

/// In-memory message table for tests and single-host setups
#[derive(Default)]
pub struct InMemoryMessageStore {
    rows: Mutex<Vec<BackplaneMessage>>,
}

impl InMemoryMessageStore {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, msg: &BackplaneMessage) -> Result<u64> {
        let mut rows = self.rows.lock();
        rows.push(msg.clone());
        Ok(rows.len() as u64)
    }

    async fn fetch_after(&self, after: u64, limit: usize) -> Result<Vec<(u64, BackplaneMessage)>> {
        let rows = self.rows.lock();
        Ok(rows
            .iter()
            .enumerate()
            .map(|(i, msg)| (i as u64 + 1, msg.clone()))
            .filter(|(id, _)| *id > after)
            .take(limit)
            .collect())
    }
}

/// Message identity used for de-duplication
type MessageIdentity = (Uuid, DateTime<Utc>, Option<String>);

/// Transport that polls a [`MessageStore`] for new rows.
///
/// Subscribers remember the highest id they have seen and poll for greater
/// ids; `(origin, timestamp, payload)` triples already delivered within the
/// dedup window are dropped, since a polling table can hand the same row to
/// a reconnecting subscriber twice.
pub struct PollingBackplane {
    store: Arc<dyn MessageStore>,
    config: BackplaneConfig,
}

impl PollingBackplane {
    /// Create a polling transport over `store`
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, config: BackplaneConfig) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl BackplaneTransport for PollingBackplane {
    fn name(&self) -> &str {
        "polling"
    }

    async fn publish(&self, msg: &BackplaneMessage) -> Result<()> {
        self.store.append(msg).await.map(|_| ())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, BackplaneMessage>> {
        // Start above the current high-water mark: history is not replayed.
        let mut last_seen = self
            .store
            .fetch_after(0, usize::MAX)
            .await?
            .last()
            .map_or(0, |(id, _)| *id);

        let (tx, rx) = mpsc::channel(64);
        let store = Arc::clone(&self.store);
        let poll_interval = self.config.poll_interval;
        let window = self.config.dedup_window.max(1);

        tokio::spawn(async move {
            let mut seen: VecDeque<MessageIdentity> = VecDeque::with_capacity(window);
            loop {
                tokio::time::sleep(poll_interval).await;
                let batch = match store.fetch_after(last_seen, 256).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(error = %e, "Backplane poll failed");
                        continue;
                    }
                };
                for (id, msg) in batch {
                    last_seen = last_seen.max(id);
                    let identity = (
                        msg.origin(),
                        msg.timestamp(),
                        msg.payload().map(ToString::to_string),
                    );
                    if seen.contains(&identity) {
                        debug!("Dropped duplicate backplane message");
                        continue;
                    }
                    if seen.len() == window {
                        seen.pop_front();
                    }
                    seen.push_back(identity);
                    if tx.send(msg).await.is_err() {
                        // Subscriber dropped the stream
                        return;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

// ── Publisher ─────────────────────────────────────────────────────────────

/// Outbound half of the backplane: stamps messages with this instance's id
/// and swallows transport failures (invalidations always succeed locally).
pub struct BackplanePublisher {
    transport: Arc<dyn BackplaneTransport>,
    instance_id: Uuid,
}

impl BackplanePublisher {
    /// Create a publisher for this instance
    #[must_use]
    pub fn new(transport: Arc<dyn BackplaneTransport>, instance_id: Uuid) -> Self {
        Self {
            transport,
            instance_id,
        }
    }

    /// Publish a key invalidation
    pub async fn publish_key(&self, key: &str) {
        self.publish(BackplaneMessage::key(key, self.instance_id))
            .await;
    }

    /// Publish a tag invalidation
    pub async fn publish_tag(&self, tag: &str) {
        self.publish(BackplaneMessage::tag(tag, self.instance_id))
            .await;
    }

    /// Publish a clear-all
    pub async fn publish_clear(&self) {
        self.publish(BackplaneMessage::clear(self.instance_id)).await;
    }

    async fn publish(&self, msg: BackplaneMessage) {
        if let Err(e) = self.transport.publish(&msg).await {
            warn!(
                transport = self.transport.name(),
                error = %e,
                "Backplane publish failed; invalidation applied locally only"
            );
        }
    }
}

// ── Subscriber ────────────────────────────────────────────────────────────

/// Lifecycle state of the backplane subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Not running
    Idle,
    /// Opening the transport stream
    Subscribing,
    /// Receiving messages
    Active,
    /// Shutting down on request
    Unsubscribing,
    /// Stream lost; reconnecting with backoff
    Faulted,
}

/// Handler invoked for every foreign invalidation message
pub type MessageHandler = Arc<dyn Fn(&BackplaneMessage) + Send + Sync>;

/// Inbound half of the backplane.
///
/// Owns the subscription task. Messages stamped with this instance's own
/// origin are dropped; everything else is handed to the local-invalidation
/// handler. Invalidations are terminal: the handler never re-publishes.
/// While faulted the subscriber reconnects with exponential backoff and the
/// engine keeps serving local reads and writes.
pub struct BackplaneSubscriber {
    state: Arc<RwLock<SubscriptionState>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackplaneSubscriber {
    /// Start the subscription task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(
        transport: Arc<dyn BackplaneTransport>,
        instance_id: Uuid,
        handler: MessageHandler,
        config: &BackplaneConfig,
    ) -> Self {
        let state = Arc::new(RwLock::new(SubscriptionState::Idle));
        let cancel = CancellationToken::new();

        let task_state = Arc::clone(&state);
        let task_cancel = cancel.clone();
        let reconnect_initial = config.reconnect_initial;
        let reconnect_max = config.reconnect_max;

        let handle = tokio::spawn(async move {
            let mut faults: u32 = 0;
            'outer: while !task_cancel.is_cancelled() {
                *task_state.write() = SubscriptionState::Subscribing;
                match transport.subscribe().await {
                    Ok(mut stream) => {
                        *task_state.write() = SubscriptionState::Active;
                        faults = 0;
                        info!(transport = transport.name(), "Backplane subscription active");
                        loop {
                            tokio::select! {
                                () = task_cancel.cancelled() => {
                                    *task_state.write() = SubscriptionState::Unsubscribing;
                                    break 'outer;
                                }
                                next = stream.next() => match next {
                                    Some(msg) => {
                                        if msg.origin() == instance_id {
                                            continue;
                                        }
                                        handler(&msg);
                                    }
                                    None => {
                                        *task_state.write() = SubscriptionState::Faulted;
                                        warn!(transport = transport.name(), "Backplane stream ended, reconnecting");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        *task_state.write() = SubscriptionState::Faulted;
                        warn!(transport = transport.name(), error = %e, "Backplane subscribe failed");
                    }
                }

                // Exponential backoff before the next attempt, capped
                let delay = reconnect_initial
                    .saturating_mul(1_u32 << faults.min(16))
                    .min(reconnect_max);
                faults = faults.saturating_add(1);
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            *task_state.write() = SubscriptionState::Idle;
        });

        Self {
            state,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state.read()
    }

    /// Stop the subscription and wait for the task to finish
    pub async fn unsubscribe(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for BackplaneSubscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
