//! 工作请求与结果信封
//!
//! Inbound (work request):
//!
//! ```json
//! { "Input": { "a": 2, "b": 3 }, "TaskToken": "<opaque>" }
//! ```
//!
//! Outbound (resolution), one of:
//!
//! ```json
//! { "result": 5, "TaskToken": "<opaque>" }
//! { "result": null, "TaskToken": "<opaque>", "exception": "TypeMismatch" }
//! ```
//!
//! The task token is never interpreted, only echoed back.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Envelope decoding / encoding errors
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Payload is not valid JSON
    #[error("Malformed JSON: {0}")]
    Malformed(serde_json::Error),

    /// Valid JSON but not the expected envelope shape
    #[error("Invalid envelope: {0}")]
    InvalidShape(serde_json::Error),

    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),
}

impl EnvelopeError {
    fn from_decode(e: serde_json::Error) -> Self {
        use serde_json::error::Category;
        match e.classify() {
            Category::Data => EnvelopeError::InvalidShape(e),
            Category::Syntax | Category::Eof | Category::Io => EnvelopeError::Malformed(e),
        }
    }
}

/// A unit of work handed over by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    #[serde(rename = "Input")]
    pub input: Value,
    #[serde(rename = "TaskToken")]
    pub task_token: String,
}

impl WorkRequest {
    pub fn new(input: Value, task_token: impl Into<String>) -> Self {
        Self {
            input,
            task_token: task_token.into(),
        }
    }

    /// Decode an inbound payload
    ///
    /// Fails when either `Input` or `TaskToken` is missing, when the token is
    /// not a string, or when the payload is not a JSON object at all.
    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(payload).map_err(EnvelopeError::from_decode)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Serialization)
    }
}

/// Exactly one resolution is produced per parsed work request
#[derive(Debug, Clone, PartialEq)]
pub enum WorkResolution {
    Success {
        result: Value,
        task_token: String,
    },
    Failure {
        task_token: String,
        error_kind: String,
        /// Partial value computed before the failure, usually absent
        result: Option<Value>,
    },
}

/// Wire shape shared by both resolution variants
#[derive(Debug, Serialize, Deserialize)]
struct ResolutionWire {
    #[serde(default)]
    result: Value,
    #[serde(rename = "TaskToken")]
    task_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exception: Option<String>,
}

impl WorkResolution {
    pub fn success(result: Value, task_token: impl Into<String>) -> Self {
        WorkResolution::Success {
            result,
            task_token: task_token.into(),
        }
    }

    pub fn failure(
        task_token: impl Into<String>,
        error_kind: impl Into<String>,
        result: Option<Value>,
    ) -> Self {
        WorkResolution::Failure {
            task_token: task_token.into(),
            error_kind: error_kind.into(),
            result,
        }
    }

    pub fn task_token(&self) -> &str {
        match self {
            WorkResolution::Success { task_token, .. } => task_token,
            WorkResolution::Failure { task_token, .. } => task_token,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkResolution::Success { .. })
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let wire = match self {
            WorkResolution::Success { result, task_token } => ResolutionWire {
                result: result.clone(),
                task_token: task_token.clone(),
                exception: None,
            },
            WorkResolution::Failure {
                task_token,
                error_kind,
                result,
            } => ResolutionWire {
                result: result.clone().unwrap_or(Value::Null),
                task_token: task_token.clone(),
                exception: Some(error_kind.clone()),
            },
        };
        serde_json::to_vec(&wire).map_err(EnvelopeError::Serialization)
    }

    /// Decode an outbound envelope (orchestrator side)
    ///
    /// The presence of `exception` selects [`WorkResolution::Failure`]; a
    /// `null` result on the failure path becomes `None`.
    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let wire: ResolutionWire =
            serde_json::from_slice(payload).map_err(EnvelopeError::from_decode)?;
        Ok(match wire.exception {
            Some(error_kind) => WorkResolution::Failure {
                task_token: wire.task_token,
                error_kind,
                result: match wire.result {
                    Value::Null => None,
                    other => Some(other),
                },
            },
            None => WorkResolution::Success {
                result: wire.result,
                task_token: wire.task_token,
            },
        })
    }
}
