//! Relay Client - message bus connection for the on-prem worker
//!
//! Owns the single long-lived connection to the message bus:
//!
//! - **MQTT** (`mqtt`): mTLS MQTT over `rumqttc`, reconnecting on its own
//! - **Memory** (`memory`): in-process bus with the same trait, for tests and embedding
//!
//! Both expose publish / subscribe-with-handler and a lifecycle event stream
//! (`Interrupted`, `Resumed`, `Closed`) through [`BusClient`].

pub mod bus;
pub mod config;
pub mod credential;
pub mod error;
pub mod memory;
pub mod mqtt;
pub mod topic;

mod acks;

pub use bus::{BusClient, IncomingMessage, MessageHandler};
pub use config::{BusConfig, TlsCredentials};
pub use credential::PemBundle;
pub use error::{ConnectError, DisconnectError, PublishError, SubscribeError};
pub use memory::{MemoryBus, PublishedMessage};
pub use mqtt::MqttBus;
pub use topic::topic_matches;

// Re-export shared types for convenience
pub use shared::{ConnectionEvent, ConnectionState, QoS};
