//! Event bus for supervisor and aggregator notifications
//!
//! Typed publish/subscribe with per-subscriber bounded buffers. Publishers
//! never block on slow consumers unless the subscriber opted into the
//! blocking policy; sequence numbers let consumers detect drops.

pub mod sink;

use crate::model::{HealthState, ServiceState, StopReason};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

pub use sink::{EventRecord, EventSink, EventType, FileEventSink, NullEventSink, ObjectReference};

/// Back-pressure policy selected at subscription time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Drop the incoming event when the buffer is full
    DropNewest,
    /// Make the publisher wait for space
    Block,
    /// Evict the oldest buffered event to make room
    EvictOldest,
}

/// A service state transition, emitted on every edge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub service: String,
    pub old_state: ServiceState,
    pub new_state: ServiceState,
    pub health: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

/// Catalog change visible to aggregator subscribers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolUpdateKind {
    ServerRegistered,
    ServerDeregistered,
    ToolsUpdated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUpdateEvent {
    pub server: String,
    pub kind: ToolUpdateKind,
    /// Externally visible (prefixed) names of the affected tools
    pub tools: Vec<String>,
}

/// Payload variants carried on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    StateChange(StateChangeEvent),
    ToolUpdate(ToolUpdateEvent),
    ReconcileCompleted { kind: String, name: String },
}

/// An event as delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic per-bus sequence number; gaps mean drops
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<String>,
    pub payload: EventPayload,
}

/// Per-subscriber delivery counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelMetrics {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub evicted: u64,
}

struct SubscriberQueue {
    name: String,
    policy: BackpressurePolicy,
    capacity: usize,
    buf: Mutex<VecDeque<Event>>,
    readable: Notify,
    writable: Notify,
    closed: AtomicBool,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
}

impl SubscriberQueue {
    fn metrics(&self) -> ChannelMetrics {
        ChannelMetrics {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }
}

/// Receiving side of one subscription
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Receive the next event; None once the subscription is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let notified = self.queue.readable.notified();
            if let Some(event) = self.pop() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<Event> {
        self.pop()
    }

    fn pop(&self) -> Option<Event> {
        let event = self.queue.buf.lock().pop_front();
        if event.is_some() {
            self.queue.delivered.fetch_add(1, Ordering::Relaxed);
            self.queue.writable.notify_one();
        }
        event
    }

    pub fn metrics(&self) -> ChannelMetrics {
        self.queue.metrics()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::Release);
        // Unblock a publisher waiting for space on this queue.
        self.queue.writable.notify_one();
    }
}

/// In-process event bus with bounded per-subscriber fan-out
pub struct EventBus {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Subscribe with the default buffer capacity
    pub fn subscribe(&self, name: &str, policy: BackpressurePolicy) -> Subscription {
        self.subscribe_with_capacity(name, policy, crate::constants::EVENT_BUFFER_CAPACITY)
    }

    pub fn subscribe_with_capacity(
        &self,
        name: &str,
        policy: BackpressurePolicy,
        capacity: usize,
    ) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            name: name.to_string(),
            policy,
            capacity: capacity.max(1),
            buf: Mutex::new(VecDeque::new()),
            readable: Notify::new(),
            writable: Notify::new(),
            closed: AtomicBool::new(false),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        });
        self.subscribers.lock().push(queue.clone());
        Subscription { queue }
    }

    /// Publish an event to every live subscriber, applying each queue's
    /// back-pressure policy. Returns the assigned sequence number.
    pub async fn publish(&self, payload: EventPayload) -> u64 {
        self.publish_correlated(payload, None, None).await
    }

    pub async fn publish_correlated(
        &self,
        payload: EventPayload,
        correlation_id: Option<String>,
        caused_by: Option<String>,
    ) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let event = Event {
            sequence,
            timestamp: Utc::now(),
            correlation_id,
            caused_by,
            payload,
        };

        let targets: Vec<Arc<SubscriberQueue>> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|q| !q.closed.load(Ordering::Acquire));
            subscribers.clone()
        };

        for queue in targets {
            queue.published.fetch_add(1, Ordering::Relaxed);
            Self::deliver(&queue, event.clone()).await;
        }

        sequence
    }

    async fn deliver(queue: &Arc<SubscriberQueue>, event: Event) {
        match queue.policy {
            BackpressurePolicy::DropNewest => {
                let mut buf = queue.buf.lock();
                if buf.len() >= queue.capacity {
                    queue.dropped.fetch_add(1, Ordering::Relaxed);
                } else {
                    buf.push_back(event);
                    queue.readable.notify_one();
                }
            }
            BackpressurePolicy::EvictOldest => {
                let mut buf = queue.buf.lock();
                if buf.len() >= queue.capacity {
                    buf.pop_front();
                    queue.evicted.fetch_add(1, Ordering::Relaxed);
                }
                buf.push_back(event);
                queue.readable.notify_one();
            }
            BackpressurePolicy::Block => loop {
                let writable = queue.writable.notified();
                {
                    let mut buf = queue.buf.lock();
                    if buf.len() < queue.capacity {
                        buf.push_back(event);
                        queue.readable.notify_one();
                        return;
                    }
                }
                if queue.closed.load(Ordering::Acquire) {
                    queue.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                writable.await;
            },
        }
    }

    /// Spawn a handler task draining a subscription. Each event is handled in
    /// isolation; a panicking handler is logged and delivery continues.
    pub fn spawn_handler<F>(&self, name: &str, policy: BackpressurePolicy, handler: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let mut subscription = self.subscribe(name, policy);
        let name = name.to_string();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    handler(event)
                }));
                if result.is_err() {
                    tracing::error!("event handler '{}' panicked; continuing", name);
                }
            }
        });
    }

    /// Metrics for all live subscribers
    pub fn metrics(&self) -> Vec<(String, ChannelMetrics)> {
        self.subscribers
            .lock()
            .iter()
            .map(|q| (q.name.clone(), q.metrics()))
            .collect()
    }

    /// Wait (bounded) for all subscriber queues to drain during shutdown.
    pub async fn drain(&self, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let all_empty = self
                .subscribers
                .lock()
                .iter()
                .all(|q| q.closed.load(Ordering::Acquire) || q.is_empty());
            if all_empty {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
