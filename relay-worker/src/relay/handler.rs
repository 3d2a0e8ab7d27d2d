//! Request handler
//!
//! Per-message state machine:
//!
//! ```text
//! Received ──decode──▶ Parsed ──compute──▶ Computed ──publish(QoS 1)────────▶ Resolved
//!    │                    │
//!    │                    └──error/panic──▶ Failed ──publish(inbound QoS)───▶ Resolved
//!    ├──malformed──▶ Dropped (no publish, diagnostic only)
//!    └──token already resolved──▶ Duplicate (no publish)
//! ```
//!
//! Every parsed request with a fresh token yields exactly one publish call. A
//! failed publish is logged and not retried: retransmission belongs to the
//! transport, and the orchestrator expires tokens that are never resolved.
//! The token is released after a failed publish so a broker redelivery can
//! still resolve it.

use async_trait::async_trait;
use futures::FutureExt;
use relay_client::{BusClient, IncomingMessage, MessageHandler, QoS};
use serde_json::Value;
use shared::{WorkRequest, WorkResolution};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::compute::{ComputeError, ComputeFunction, PANIC_KIND, panic_message};
use super::dedup::{DEFAULT_RECENT_TOKENS, RecentTokens};
use super::stats::RelayStats;

/// Which resolution shape was published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStatus {
    Success,
    Failure,
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionStatus::Success => write!(f, "success"),
            ResolutionStatus::Failure => write!(f, "failure"),
        }
    }
}

/// Terminal state of one handling cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    Resolved {
        task_token: String,
        status: ResolutionStatus,
        /// Whether the bus accepted the resolution
        delivered: bool,
    },
    Dropped {
        reason: String,
    },
    /// Redelivery of a token resolved recently
    Duplicate {
        task_token: String,
    },
}

impl HandleOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, HandleOutcome::Dropped { .. })
    }
}

/// Bridges inbound work requests to the compute function and back
pub struct RequestHandler {
    bus: Arc<dyn BusClient>,
    compute: Arc<dyn ComputeFunction>,
    submit_topic: String,
    stats: Arc<RelayStats>,
    recent: RecentTokens,
}

impl RequestHandler {
    pub fn new(
        bus: Arc<dyn BusClient>,
        compute: Arc<dyn ComputeFunction>,
        submit_topic: impl Into<String>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            bus,
            compute,
            submit_topic: submit_topic.into(),
            stats,
            recent: RecentTokens::new(DEFAULT_RECENT_TOKENS),
        }
    }

    /// Remember the last `capacity` tokens; 0 disables duplicate detection
    pub fn with_recent_tokens(mut self, capacity: usize) -> Self {
        self.recent = RecentTokens::new(capacity);
        self
    }

    /// Run one message through the state machine
    pub async fn handle(&self, msg: &IncomingMessage) -> HandleOutcome {
        self.stats.record_received();
        let _in_flight = self.stats.track_in_flight();

        // 1. Received -> Parsed | Dropped
        let request = match WorkRequest::decode(&msg.payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(
                    message_id = %msg.message_id,
                    topic = %msg.topic,
                    error = %e,
                    payload = %String::from_utf8_lossy(&msg.payload),
                    "Protocol violation: dropping malformed work request"
                );
                self.stats.record_dropped();
                return HandleOutcome::Dropped {
                    reason: e.to_string(),
                };
            }
        };

        if !self.recent.claim(&request.task_token) {
            tracing::warn!(
                message_id = %msg.message_id,
                task_token = %request.task_token,
                dup = msg.dup,
                "Skipping redelivered work request, token already resolved"
            );
            self.stats.record_duplicate();
            return HandleOutcome::Duplicate {
                task_token: request.task_token,
            };
        }

        tracing::debug!(
            message_id = %msg.message_id,
            task_token = %request.task_token,
            compute = self.compute.name(),
            "Work request received"
        );

        // 2. Parsed -> Computed | Failed
        let WorkRequest { input, task_token } = request;
        let (resolution, qos) = match self.run_compute(input).await {
            Ok(result) => (
                WorkResolution::success(result, task_token),
                QoS::AtLeastOnce,
            ),
            Err(e) => {
                tracing::warn!(
                    message_id = %msg.message_id,
                    task_token = %task_token,
                    kind = %e.kind,
                    error = %e.message,
                    "Computation failed"
                );
                (
                    WorkResolution::failure(task_token, e.kind, e.partial),
                    msg.qos,
                )
            }
        };

        let status = if resolution.is_success() {
            self.stats.record_succeeded();
            ResolutionStatus::Success
        } else {
            self.stats.record_failed();
            ResolutionStatus::Failure
        };

        // 3. Computed | Failed -> Resolved
        let delivered = self.publish(&resolution, qos).await;
        if !delivered {
            self.stats.record_publish_failure();
            self.recent.release(resolution.task_token());
        }

        HandleOutcome::Resolved {
            task_token: resolution.task_token().to_string(),
            status,
            delivered,
        }
    }

    /// A panic inside the compute function is a computation fault
    async fn run_compute(&self, input: Value) -> Result<Value, ComputeError> {
        match AssertUnwindSafe(self.compute.compute(input))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    compute = self.compute.name(),
                    panic = %message,
                    "Compute function panicked"
                );
                Err(ComputeError::new(PANIC_KIND, message))
            }
        }
    }

    async fn publish(&self, resolution: &WorkResolution, qos: QoS) -> bool {
        let task_token = resolution.task_token();
        let payload = match resolution.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(
                    task_token = %task_token,
                    error = %e,
                    "Failed to encode resolution"
                );
                return false;
            }
        };

        match self.bus.publish(&self.submit_topic, payload, qos).await {
            Ok(()) => {
                tracing::info!(
                    task_token = %task_token,
                    topic = %self.submit_topic,
                    qos = %qos,
                    success = resolution.is_success(),
                    "Resolution published"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    task_token = %task_token,
                    topic = %self.submit_topic,
                    error = %e,
                    "Failed to publish resolution, token left to expire"
                );
                false
            }
        }
    }
}

#[async_trait]
impl MessageHandler for RequestHandler {
    async fn on_message(&self, msg: IncomingMessage) {
        self.handle(&msg).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::compute::AddOperands;
    use relay_client::MemoryBus;
    use serde_json::json;

    fn handler(
        bus: &MemoryBus,
        compute: Arc<dyn ComputeFunction>,
    ) -> (RequestHandler, Arc<RelayStats>) {
        let stats = Arc::new(RelayStats::new());
        let handler = RequestHandler::new(Arc::new(bus.clone()), compute, "out", stats.clone());
        (handler, stats)
    }

    struct Panicky;

    #[async_trait]
    impl ComputeFunction for Panicky {
        async fn compute(&self, _input: Value) -> Result<Value, ComputeError> {
            panic!("index out of bounds")
        }
    }

    struct Partial;

    #[async_trait]
    impl ComputeFunction for Partial {
        async fn compute(&self, _input: Value) -> Result<Value, ComputeError> {
            Err(ComputeError::new("Interrupted", "stopped halfway").with_partial(json!(2)))
        }
    }

    #[tokio::test]
    async fn test_success_publishes_at_least_once() {
        let bus = MemoryBus::new();
        let (handler, stats) = handler(&bus, Arc::new(AddOperands));
        let msg = IncomingMessage::new(
            "in",
            br#"{"Input":{"a":2,"b":3},"TaskToken":"T1"}"#.to_vec(),
            QoS::AtMostOnce,
        );

        let outcome = handler.handle(&msg).await;

        assert_eq!(
            outcome,
            HandleOutcome::Resolved {
                task_token: "T1".to_string(),
                status: ResolutionStatus::Success,
                delivered: true,
            }
        );
        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].qos, QoS::AtLeastOnce);
        assert_eq!(stats.snapshot().succeeded, 1);
    }

    #[tokio::test]
    async fn test_failure_uses_inbound_qos() {
        let bus = MemoryBus::new();
        let (handler, _) = handler(&bus, Arc::new(AddOperands));
        let msg = IncomingMessage::new(
            "in",
            br#"{"Input":{"a":"x","b":3},"TaskToken":"T2"}"#.to_vec(),
            QoS::AtMostOnce,
        );

        handler.handle(&msg).await;

        let published = bus.published();
        assert_eq!(published[0].qos, QoS::AtMostOnce);
        let body: Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(body["exception"], json!("TypeMismatch"));
    }

    #[tokio::test]
    async fn test_partial_result_is_published() {
        let bus = MemoryBus::new();
        let (handler, _) = handler(&bus, Arc::new(Partial));
        let msg = IncomingMessage::new(
            "in",
            br#"{"Input":{},"TaskToken":"T3"}"#.to_vec(),
            QoS::AtLeastOnce,
        );

        handler.handle(&msg).await;

        let body: Value = serde_json::from_slice(&bus.published()[0].payload).unwrap();
        assert_eq!(body, json!({"result": 2, "TaskToken": "T3", "exception": "Interrupted"}));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let bus = MemoryBus::new();
        let (handler, stats) = handler(&bus, Arc::new(Panicky));
        let msg = IncomingMessage::new(
            "in",
            br#"{"Input":1,"TaskToken":"T4"}"#.to_vec(),
            QoS::AtLeastOnce,
        );

        let outcome = handler.handle(&msg).await;

        assert!(matches!(
            outcome,
            HandleOutcome::Resolved { status: ResolutionStatus::Failure, .. }
        ));
        let body: Value = serde_json::from_slice(&bus.published()[0].payload).unwrap();
        assert_eq!(body["exception"], json!(PANIC_KIND));
        assert_eq!(stats.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_malformed_is_dropped() {
        let bus = MemoryBus::new();
        let (handler, stats) = handler(&bus, Arc::new(AddOperands));

        for payload in [
            &b"not json"[..],
            &br#"{"Input":{"a":1}}"#[..],
            &br#"{"TaskToken":"T5"}"#[..],
        ] {
            let msg = IncomingMessage::new("in", payload.to_vec(), QoS::AtLeastOnce);
            assert!(handler.handle(&msg).await.is_dropped());
        }

        assert!(bus.published().is_empty());
        assert_eq!(stats.snapshot().dropped, 3);
    }

    #[tokio::test]
    async fn test_publish_failure_is_not_retried() {
        let bus = MemoryBus::new();
        bus.fail_next_publishes(1);
        let (handler, stats) = handler(&bus, Arc::new(AddOperands));
        let msg = IncomingMessage::new(
            "in",
            br#"{"Input":{"a":1,"b":1},"TaskToken":"T6"}"#.to_vec(),
            QoS::AtLeastOnce,
        );

        let outcome = handler.handle(&msg).await;

        assert!(matches!(outcome, HandleOutcome::Resolved { delivered: false, .. }));
        assert!(bus.published().is_empty());
        assert_eq!(stats.snapshot().publish_failures, 1);
        assert_eq!(stats.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn test_redelivered_token_is_resolved_once() {
        let bus = MemoryBus::new();
        let (handler, stats) = handler(&bus, Arc::new(AddOperands));
        let payload = br#"{"Input":{"a":2,"b":3},"TaskToken":"T1"}"#;

        let first = handler
            .handle(&IncomingMessage::new("in", payload.to_vec(), QoS::AtLeastOnce))
            .await;
        let mut redelivery = IncomingMessage::new("in", payload.to_vec(), QoS::AtLeastOnce);
        redelivery.dup = true;
        let second = handler.handle(&redelivery).await;

        assert!(matches!(first, HandleOutcome::Resolved { delivered: true, .. }));
        assert_eq!(
            second,
            HandleOutcome::Duplicate {
                task_token: "T1".to_string()
            }
        );
        assert_eq!(bus.published().len(), 1);
        assert_eq!(stats.snapshot().duplicates, 1);
    }

    #[tokio::test]
    async fn test_undelivered_token_can_be_resolved_by_redelivery() {
        let bus = MemoryBus::new();
        bus.fail_next_publishes(1);
        let (handler, _) = handler(&bus, Arc::new(AddOperands));
        let payload = br#"{"Input":{"a":1,"b":1},"TaskToken":"T7"}"#;

        for _ in 0..2 {
            handler
                .handle(&IncomingMessage::new("in", payload.to_vec(), QoS::AtLeastOnce))
                .await;
        }

        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_detection_can_be_disabled() {
        let bus = MemoryBus::new();
        let (handler, _) = handler(&bus, Arc::new(AddOperands));
        let handler = handler.with_recent_tokens(0);
        let payload = br#"{"Input":{"a":1,"b":1},"TaskToken":"T8"}"#;

        for _ in 0..2 {
            handler
                .handle(&IncomingMessage::new("in", payload.to_vec(), QoS::AtLeastOnce))
                .await;
        }

        assert_eq!(bus.published().len(), 2);
    }
}
