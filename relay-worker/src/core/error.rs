//! Worker error types
//!
//! Every variant here ends the process with a non-zero exit status.

use relay_client::{ConnectError, DisconnectError, SubscribeError};
use thiserror::Error;

use super::config::ConfigError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Handshake failed at startup
    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),

    /// Initial subscription not acknowledged
    #[error("Subscribe to '{topic}' failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: SubscribeError,
    },

    /// Broker rejected a resubscription after a non-persistent resume
    #[error("Server rejected resubscribe to topics: {}", .topics.join(", "))]
    Resubscribe { topics: Vec<String> },

    /// The connection reached its terminal state without a shutdown request
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Disconnect failed: {0}")]
    Disconnect(#[from] DisconnectError),

    /// A supervised background task panicked or was aborted
    #[error("Task failed: {0}")]
    Task(String),
}

pub type WorkerResult<T> = Result<T, WorkerError>;
