//! 内存总线 (同进程通信)
//!
//! Implements [`BusClient`] without a network. Deliveries are injected with
//! [`MemoryBus::deliver`] and publishes are recorded for inspection. Used by
//! tests and when embedding the worker next to another component.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use shared::{ConnectionEvent, ConnectionState, QoS};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio_util::task::TaskTracker;

use crate::bus::{BusClient, IncomingMessage, MessageHandler};
use crate::error::{DisconnectError, PublishError, SubscribeError};
use crate::topic::{topic_matches, validate_filter};

/// A payload handed to [`MemoryBus::publish`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// In-process bus
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    state: RwLock<ConnectionState>,
    routes: DashMap<String, Arc<dyn MessageHandler>>,
    published: Mutex<Vec<PublishedMessage>>,
    publish_notify: Notify,
    subscribe_calls: Mutex<Vec<(String, QoS)>>,
    rejected: Mutex<HashSet<String>>,
    failing_publishes: AtomicUsize,
    failing_subscribes: AtomicUsize,
    events: broadcast::Sender<ConnectionEvent>,
    handlers: TaskTracker,
    drain_timeout: Duration,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus")
            .field("state", &self.state())
            .field("routes", &self.inner.routes.len())
            .field("published", &self.inner.published.lock().len())
            .finish()
    }
}

impl MemoryBus {
    /// Create a bus that is already connected
    pub fn new() -> Self {
        Self::with_options(64, Duration::from_secs(10))
    }

    pub fn with_options(event_capacity: usize, drain_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(MemoryInner {
                state: RwLock::new(ConnectionState::Connected),
                routes: DashMap::new(),
                published: Mutex::new(Vec::new()),
                publish_notify: Notify::new(),
                subscribe_calls: Mutex::new(Vec::new()),
                rejected: Mutex::new(HashSet::new()),
                failing_publishes: AtomicUsize::new(0),
                failing_subscribes: AtomicUsize::new(0),
                events,
                handlers: TaskTracker::new(),
                drain_timeout,
            }),
        }
    }

    /// Inject a delivery as if it arrived from the broker
    ///
    /// Returns the number of handlers the message was routed to.
    pub fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>, qos: QoS) -> usize {
        let msg = IncomingMessage::new(topic, payload, qos);
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .inner
            .routes
            .iter()
            .filter(|entry| topic_matches(entry.key(), topic))
            .map(|entry| entry.value().clone())
            .collect();

        if handlers.is_empty() {
            tracing::warn!(topic = %topic, "No handler registered for topic");
        }

        for handler in &handlers {
            let handler = handler.clone();
            let msg = msg.clone();
            self.inner.handlers.spawn(async move {
                handler.on_message(msg).await;
            });
        }
        handlers.len()
    }

    /// Wait for every handler invocation started so far
    pub async fn wait_idle(&self) {
        self.inner.handlers.close();
        self.inner.handlers.wait().await;
        self.inner.handlers.reopen();
    }

    /// Wait until at least `count` publishes were recorded
    pub async fn wait_for_publishes(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.inner.publish_notify.notified();
                if self.inner.published.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    /// All publishes so far, in order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.published.lock().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Every subscribe call, including rejected ones
    pub fn subscribe_calls(&self) -> Vec<(String, QoS)> {
        self.inner.subscribe_calls.lock().clone()
    }

    /// Answer future subscribes to `topic` with a rejection
    pub fn reject_topic(&self, topic: &str) {
        self.inner.rejected.lock().insert(topic.to_string());
    }

    /// Fail the next `count` publishes with a client error
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Time out the next `count` subscribes as if the SUBACK never arrived
    pub fn fail_next_subscribes(&self, count: usize) {
        self.inner.failing_subscribes.store(count, Ordering::SeqCst);
    }

    /// Simulate a dropped connection
    pub fn interrupt(&self, error: &str) {
        self.set_state(ConnectionState::Interrupted);
        self.emit(ConnectionEvent::Interrupted {
            error: error.to_string(),
        });
    }

    /// Simulate a reconnect
    pub fn resume(&self, session_present: bool) {
        self.set_state(ConnectionState::Connected);
        self.emit(ConnectionEvent::Resumed { session_present });
    }

    /// Emit an arbitrary lifecycle event without changing state
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.inner.state.write() = state;
    }
}

#[async_trait]
impl BusClient for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        let state = self.state();
        if !state.is_connected() {
            return Err(PublishError::NotConnected(state));
        }

        let failing = self
            .inner
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(PublishError::Client("injected publish failure".to_string()));
        }

        self.inner.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        self.inner.publish_notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<QoS, SubscribeError> {
        validate_filter(topic).map_err(SubscribeError::InvalidTopic)?;
        let state = self.state();
        if !state.is_connected() {
            return Err(SubscribeError::NotConnected(state));
        }

        self.inner
            .subscribe_calls
            .lock()
            .push((topic.to_string(), qos));

        let failing = self
            .inner
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(SubscribeError::Timeout(topic.to_string()));
        }

        if self.inner.rejected.lock().contains(topic) {
            return Err(SubscribeError::Rejected(topic.to_string()));
        }

        self.inner.routes.insert(topic.to_string(), handler);
        Ok(qos)
    }

    async fn disconnect(&self) -> Result<(), DisconnectError> {
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }

        self.inner.handlers.close();
        if tokio::time::timeout(self.inner.drain_timeout, self.inner.handlers.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                in_flight = self.inner.handlers.len(),
                "In-flight messages still running, disconnecting anyway"
            );
        }

        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Closed);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }
}
