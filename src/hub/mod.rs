// vigil: Subscription hub

pub mod protocol;
pub mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Role;
use crate::error::{CoreError, CoreResult};
use crate::events::AlertEvent;
use crate::metrics::InternalMetrics;
use protocol::{Envelope, HubMessage, MessageType, SubscriptionFilter};

/// Hub tuning
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub ping_interval: std::time::Duration,
    pub max_slow_misses: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            ping_interval: std::time::Duration::from_secs(30),
            max_slow_misses: 3,
        }
    }
}

/// Shared per-subscriber state
///
/// The outbound queue sender lives in the hub's entry, not here; eviction
/// drops the sender and fires the cancel signal, which both session tasks
/// observe.
pub struct SubscriberHandle {
    pub session_id: Uuid,
    pub username: String,
    /// Permission snapshot taken at upgrade time
    pub role: Role,
    filter: Mutex<SubscriptionFilter>,
    misses: AtomicU32,
    last_pong: Mutex<Instant>,
    cancel: watch::Sender<bool>,
}

impl SubscriberHandle {
    pub fn new(session_id: Uuid, username: String, role: Role) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            session_id,
            username,
            role,
            filter: Mutex::new(SubscriptionFilter::default()),
            misses: AtomicU32::new(0),
            last_pong: Mutex::new(Instant::now()),
            cancel,
        })
    }

    pub fn set_filter(&self, filter: SubscriptionFilter) {
        *self.filter.lock() = filter;
    }

    pub fn filter(&self) -> SubscriptionFilter {
        self.filter.lock().clone()
    }

    /// Record client liveness
    pub fn note_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    fn pong_age(&self) -> std::time::Duration {
        self.last_pong.lock().elapsed()
    }

    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn close(&self) {
        let _ = self.cancel.send(true);
    }
}

struct Entry {
    handle: Arc<SubscriberHandle>,
    tx: mpsc::Sender<Envelope>,
}

type SubscriberMap = Arc<RwLock<HashMap<Uuid, Entry>>>;

/// Handle for registering subscribers and broadcasting messages
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<(Arc<SubscriberHandle>, mpsc::Sender<Envelope>)>,
    unregister_tx: mpsc::Sender<Uuid>,
    broadcast_tx: mpsc::Sender<HubMessage>,
    subscribers: SubscriberMap,
    queue_capacity: usize,
}

impl HubHandle {
    pub async fn register(
        &self,
        handle: Arc<SubscriberHandle>,
        tx: mpsc::Sender<Envelope>,
    ) -> CoreResult<()> {
        self.register_tx
            .send((handle, tx))
            .await
            .map_err(|_| CoreError::Canceled("hub stopped".to_string()))
    }

    pub async fn unregister(&self, session_id: Uuid) {
        let _ = self.unregister_tx.send(session_id).await;
    }

    pub async fn broadcast(&self, message: HubMessage) {
        let _ = self.broadcast_tx.send(message).await;
    }

    /// Non-blocking broadcast for synchronous callers; a full hub queue
    /// drops the message
    pub fn try_broadcast(&self, message: HubMessage) {
        let _ = self.broadcast_tx.try_send(message);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}

/// The hub task: owns registration, broadcast, ping, and eviction
///
/// Reads three inbound channels (register, unregister, broadcast) plus the
/// alert event stream. The subscriber set sits behind a read-write lock
/// held only long enough to enqueue.
pub struct Hub {
    config: HubConfig,
    subscribers: SubscriberMap,
    register_rx: mpsc::Receiver<(Arc<SubscriberHandle>, mpsc::Sender<Envelope>)>,
    unregister_rx: mpsc::Receiver<Uuid>,
    broadcast_rx: mpsc::Receiver<HubMessage>,
}

impl Hub {
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(64);
        let (unregister_tx, unregister_rx) = mpsc::channel(64);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(256);
        let subscribers: SubscriberMap = Arc::new(RwLock::new(HashMap::new()));
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            subscribers: Arc::clone(&subscribers),
            queue_capacity: config.queue_capacity,
        };
        let hub = Self {
            config,
            subscribers,
            register_rx,
            unregister_rx,
            broadcast_rx,
        };
        (hub, handle)
    }

    /// Drive the hub until shutdown, then close every subscriber
    pub async fn run(mut self, mut events: mpsc::Receiver<AlertEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("Subscription hub started");

        loop {
            tokio::select! {
                Some((handle, tx)) = self.register_rx.recv() => {
                    self.register(handle, tx);
                }
                Some(session_id) = self.unregister_rx.recv() => {
                    self.unregister(session_id);
                }
                Some(message) = self.broadcast_rx.recv() => {
                    self.broadcast(&message);
                }
                Some(event) = events.recv() => {
                    self.broadcast(&HubMessage::alert(&event));
                }
                _ = ping.tick() => {
                    self.ping_tick();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Subscription hub stopping");
        let mut subscribers = self.subscribers.write();
        for (_, entry) in subscribers.drain() {
            entry.handle.close();
        }
        InternalMetrics::global().subscribers_connected.set(0);
    }

    fn register(&self, handle: Arc<SubscriberHandle>, tx: mpsc::Sender<Envelope>) {
        info!(session = %handle.session_id, user = %handle.username, "Subscriber registered");
        let mut subscribers = self.subscribers.write();
        subscribers.insert(handle.session_id, Entry { handle, tx });
        InternalMetrics::global()
            .subscribers_connected
            .set(subscribers.len() as i64);
    }

    fn unregister(&self, session_id: Uuid) {
        let mut subscribers = self.subscribers.write();
        if let Some(entry) = subscribers.remove(&session_id) {
            entry.handle.close();
            debug!(session = %session_id, "Subscriber unregistered");
        }
        InternalMetrics::global()
            .subscribers_connected
            .set(subscribers.len() as i64);
    }

    fn broadcast(&self, message: &HubMessage) {
        let metrics = InternalMetrics::global();
        metrics.broadcasts.inc();

        let mut evict = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for entry in subscribers.values() {
                if !entry.handle.filter().matches(message) {
                    continue;
                }
                match entry.tx.try_send(message.envelope.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        metrics.subscriber_misses.inc();
                        let misses = entry.handle.misses.fetch_add(1, Ordering::SeqCst) + 1;
                        if misses >= self.config.max_slow_misses {
                            evict.push(entry.handle.session_id);
                        } else {
                            warn!(
                                session = %entry.handle.session_id,
                                misses,
                                "Subscriber queue full, message dropped"
                            );
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        evict.push(entry.handle.session_id);
                    }
                }
            }
        }
        for session_id in evict {
            self.evict(session_id, "slow consumer");
        }
    }

    fn ping_tick(&self) {
        let deadline = self.config.ping_interval * 2;
        let mut evict = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for entry in subscribers.values() {
                if entry.handle.pong_age() > deadline {
                    evict.push(entry.handle.session_id);
                    continue;
                }
                let _ = entry
                    .tx
                    .try_send(Envelope::new(MessageType::Ping, serde_json::Value::Null));
            }
        }
        for session_id in evict {
            self.evict(session_id, "ping timeout");
        }
    }

    fn evict(&self, session_id: Uuid, reason: &str) {
        let mut subscribers = self.subscribers.write();
        if let Some(entry) = subscribers.remove(&session_id) {
            warn!(session = %session_id, reason, "Subscriber evicted");
            entry.handle.close();
            InternalMetrics::global().subscribers_evicted.inc();
        }
        InternalMetrics::global()
            .subscribers_connected
            .set(subscribers.len() as i64);
    }
}
