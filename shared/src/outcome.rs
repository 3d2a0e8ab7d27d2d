//! Orchestrator-side view of a resolution
//!
//! The callback adapter resumes a paused orchestration step either with a
//! success output or with a failure. This is the pure mapping it applies to
//! an outbound envelope; sending the result to the orchestrator is not part
//! of this crate.

use serde_json::{Value, json};

use crate::envelope::WorkResolution;

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Resume the step with `output` (`{"result": ...}`)
    Succeeded { task_token: String, output: Value },
    /// Fail the step with `error` (the exception kind)
    Failed {
        task_token: String,
        error: String,
        /// JSON text of the partial result, if any
        cause: Option<String>,
    },
}

impl TaskOutcome {
    pub fn task_token(&self) -> &str {
        match self {
            TaskOutcome::Succeeded { task_token, .. } => task_token,
            TaskOutcome::Failed { task_token, .. } => task_token,
        }
    }
}

impl From<WorkResolution> for TaskOutcome {
    fn from(resolution: WorkResolution) -> Self {
        match resolution {
            WorkResolution::Success { result, task_token } => TaskOutcome::Succeeded {
                task_token,
                output: json!({ "result": result }),
            },
            WorkResolution::Failure {
                task_token,
                error_kind,
                result,
            } => TaskOutcome::Failed {
                task_token,
                error: error_kind,
                cause: result.map(|v| v.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_wraps_result() {
        let outcome = TaskOutcome::from(WorkResolution::success(json!(5), "T1"));
        assert_eq!(
            outcome,
            TaskOutcome::Succeeded {
                task_token: "T1".into(),
                output: json!({"result": 5}),
            }
        );
    }

    #[test]
    fn test_failure_carries_kind() {
        let outcome = TaskOutcome::from(WorkResolution::failure("T2", "TypeMismatch", None));
        assert_eq!(outcome.task_token(), "T2");
        assert_eq!(
            outcome,
            TaskOutcome::Failed {
                task_token: "T2".into(),
                error: "TypeMismatch".into(),
                cause: None,
            }
        );
    }

    #[test]
    fn test_failure_partial_result_becomes_cause() {
        let outcome =
            TaskOutcome::from(WorkResolution::failure("T3", "Overflow", Some(json!({"n": 1}))));
        match outcome {
            TaskOutcome::Failed { cause, .. } => assert_eq!(cause.as_deref(), Some(r#"{"n":1}"#)),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
