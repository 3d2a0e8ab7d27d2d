//! Bus connection error types

use thiserror::Error;

/// Transport-level handshake could not complete
///
/// Fatal at startup.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Invalid connection settings
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// CA bundle, client certificate or private key unusable
    #[error("Credential error: {0}")]
    Credential(String),

    /// Network or MQTT handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// No CONNACK within the connect timeout
    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Publish rejected or not acknowledged
#[derive(Debug, Error)]
pub enum PublishError {
    /// Connection is not in the `Connected` state
    #[error("Not connected (state: {0})")]
    NotConnected(shared::ConnectionState),

    /// Request could not be handed to the event loop
    #[error("Client error: {0}")]
    Client(String),

    /// No PUBACK within the ack timeout
    #[error("Timeout waiting for ack on {0}")]
    Timeout(String),

    /// Event loop stopped while waiting
    #[error("Connection closed")]
    Closed,
}

/// Subscription rejected or not acknowledged
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// Broker answered the SUBSCRIBE with a failure return code
    #[error("Subscription rejected by broker: {0}")]
    Rejected(String),

    /// Invalid topic filter
    #[error("Invalid topic filter: {0}")]
    InvalidTopic(String),

    #[error("Not connected (state: {0})")]
    NotConnected(shared::ConnectionState),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Timeout waiting for ack on {0}")]
    Timeout(String),

    #[error("Connection closed")]
    Closed,
}

/// Graceful disconnect failed
#[derive(Debug, Error)]
pub enum DisconnectError {
    #[error("Client error: {0}")]
    Client(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}
