//! Resubscription after a non-persistent resume
//!
//! Runs as its own task observing the connection's event stream, so the
//! subscribe round-trips never block the transport's event loop.
//!
//! ```text
//! Resumed(session_present = true)  ──▶ no-op (broker kept the subscriptions)
//! Resumed(session_present = false) ──▶ subscribe every recorded topic
//!                                          │
//!                                          ├─ all granted        ──▶ keep running
//!                                          ├─ no SUBACK / dropped ──▶ retried on next resume
//!                                          └─ any rejected       ──▶ fatal
//! ```

use futures::future::join_all;
use relay_client::{BusClient, ConnectionEvent, MessageHandler, QoS, SubscribeError};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::core::error::{WorkerError, WorkerResult};

/// One entry of the subscription set recorded at startup
#[derive(Clone)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
    pub handler: Arc<dyn MessageHandler>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: QoS, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            handler,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .finish()
    }
}

/// Result of one resubscription round that did not hit a rejection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResubscribeReport {
    pub resubscribed: Vec<String>,
    /// Interrupted by another drop; redone on the next resume
    pub deferred: Vec<String>,
}

pub struct Resubscriber {
    bus: Arc<dyn BusClient>,
    subscriptions: Arc<[Subscription]>,
}

impl Resubscriber {
    pub fn new(bus: Arc<dyn BusClient>, subscriptions: Vec<Subscription>) -> Self {
        Self {
            bus,
            subscriptions: subscriptions.into(),
        }
    }

    /// Re-issue every recorded subscription and collect all results
    ///
    /// Fails with [`WorkerError::Resubscribe`] listing every topic the broker
    /// refused. Unconfirmed topics are deferred to the next resume.
    pub async fn resubscribe_all(&self) -> WorkerResult<ResubscribeReport> {
        tracing::info!(
            topics = self.subscriptions.len(),
            "Session did not persist. Resubscribing to existing topics..."
        );

        let results = join_all(self.subscriptions.iter().map(|sub| async move {
            let result = self
                .bus
                .subscribe(&sub.topic, sub.qos, sub.handler.clone())
                .await;
            (sub.topic.clone(), result)
        }))
        .await;

        let mut report = ResubscribeReport::default();
        let mut rejected = Vec::new();
        for (topic, result) in results {
            match result {
                Ok(granted) => {
                    tracing::info!(topic = %topic, granted = %granted, "Resubscribed");
                    report.resubscribed.push(topic);
                }
                Err(e) if is_rejection(&e) => {
                    tracing::error!(
                        topic = %topic,
                        error = %e,
                        "Server rejected resubscribe to topic"
                    );
                    rejected.push(topic);
                }
                Err(e) => {
                    tracing::warn!(
                        topic = %topic,
                        error = %e,
                        "Resubscribe not confirmed, will retry on next resume"
                    );
                    report.deferred.push(topic);
                }
            }
        }

        if rejected.is_empty() {
            Ok(report)
        } else {
            Err(WorkerError::Resubscribe { topics: rejected })
        }
    }

    /// React to a single lifecycle event
    pub async fn on_event(&self, event: &ConnectionEvent) -> WorkerResult<()> {
        match event {
            ConnectionEvent::Resumed {
                session_present: false,
            } => {
                self.resubscribe_all().await?;
            }
            ConnectionEvent::Resumed {
                session_present: true,
            } => {
                tracing::info!("Session persisted, subscriptions still active");
            }
            ConnectionEvent::Interrupted { error } => {
                tracing::warn!(error = %error, "Connection interrupted");
            }
            ConnectionEvent::Connected { .. } | ConnectionEvent::Closed => {}
        }
        Ok(())
    }

    /// Observe the event stream until the connection closes or `shutdown` fires
    ///
    /// Returns `Ok` when the stream ends, `Err` on a fatal resubscription.
    pub async fn run(
        self,
        mut events: broadcast::Receiver<ConnectionEvent>,
        shutdown: CancellationToken,
    ) -> WorkerResult<()> {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                received = events.recv() => received,
            };

            match received {
                Ok(ConnectionEvent::Closed) => {
                    tracing::debug!("Connection closed, resubscriber stopping");
                    return Ok(());
                }
                Ok(event) => self.on_event(&event).await?,
                Err(RecvError::Lagged(skipped)) => {
                    // A missed Resumed(false) would leave us without subscriptions
                    tracing::warn!(skipped, "Lifecycle events lagged");
                    if self.bus.state().is_connected() {
                        self.resubscribe_all().await?;
                    }
                }
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}

/// Only an explicit refusal is final; a lost SUBACK or dropped link is redone
/// on the next resume
fn is_rejection(e: &SubscribeError) -> bool {
    matches!(e, SubscribeError::Rejected(_) | SubscribeError::InvalidTopic(_))
}
