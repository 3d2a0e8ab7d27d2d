//! Bus abstraction
//!
//! ```text
//!              ┌──────────────────┐
//!              │  BusClient Trait │  ◄── 可插拔实现
//!              └────────┬─────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!       MqttBus                  MemoryBus
//!   (mTLS MQTT broker)         (同进程通信)
//! ```

use async_trait::async_trait;
use shared::{ConnectionEvent, ConnectionState, QoS};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{DisconnectError, PublishError, SubscribeError};

/// A message delivered on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Locally generated, for log correlation only
    pub message_id: Uuid,
    pub topic: String,
    pub payload: Vec<u8>,
    /// QoS the message arrived with
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
}

impl IncomingMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            topic: topic.into(),
            payload: payload.into(),
            qos,
            dup: false,
            retain: false,
        }
    }
}

/// Subscription callback
///
/// Each delivery runs on its own task; implementations may be invoked
/// concurrently and must not assume ordering between messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, msg: IncomingMessage);
}

/// The single long-lived connection to the message bus
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Publish a payload
    ///
    /// Resolves on broker acknowledgment for `AtLeastOnce`, immediately after
    /// hand-off for `AtMostOnce`.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError>;

    /// Subscribe and route matching deliveries to `handler`
    ///
    /// Subscribing again to the same filter replaces the handler. Returns the
    /// QoS granted by the broker.
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<QoS, SubscribeError>;

    /// Graceful disconnect; terminal
    async fn disconnect(&self) -> Result<(), DisconnectError>;

    /// Observe lifecycle events (advisory, never blocks the connection)
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    fn state(&self) -> ConnectionState;
}
