//! Shared types for the work relay
//!
//! Wire envelopes and value types used by both the on-prem worker and the
//! orchestrator-side adapters. Nothing in here performs I/O.

pub mod connection;
pub mod envelope;
pub mod outcome;
pub mod qos;

// Re-exports
pub use serde::{Deserialize, Serialize};
pub use serde_json::Value;

pub use connection::{ConnectionEvent, ConnectionState};
pub use envelope::{EnvelopeError, WorkRequest, WorkResolution};
pub use outcome::TaskOutcome;
pub use qos::QoS;
