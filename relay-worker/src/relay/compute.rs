//! Compute boundary
//!
//! The relay never looks inside a computation: it hands over `input` and gets
//! back either a value or a classified error. The error's `kind` becomes the
//! `exception` field of the failure envelope.

use async_trait::async_trait;
use serde_json::{Number, Value};
use std::sync::Arc;
use thiserror::Error;

/// Kind used when a compute function panics
pub const PANIC_KIND: &str = "Panic";

/// Classified computation failure
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct ComputeError {
    /// Classification label, published as `exception`
    pub kind: String,
    pub message: String,
    /// Value computed before the failure, if the function has one
    pub partial: Option<Value>,
}

impl ComputeError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            partial: None,
        }
    }

    pub fn with_partial(mut self, partial: Value) -> Self {
        self.partial = Some(partial);
        self
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new("TypeMismatch", message)
    }

    pub fn missing_operand(name: &str) -> Self {
        Self::new("MissingOperand", format!("missing operand '{}'", name))
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new("InvalidInput", message)
    }

    pub fn overflow(message: impl Into<String>) -> Self {
        Self::new("Overflow", message)
    }
}

/// Caller-supplied unit of work, invoked once per parsed request
///
/// Implementations may run concurrently for different requests. Long or
/// blocking work belongs on the blocking pool, see [`BlockingCompute`].
#[async_trait]
pub trait ComputeFunction: Send + Sync {
    async fn compute(&self, input: Value) -> Result<Value, ComputeError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "compute"
    }
}

/// `input.a + input.b`
#[derive(Debug, Clone, Copy, Default)]
pub struct AddOperands;

impl AddOperands {
    pub fn add(input: &Value) -> Result<Value, ComputeError> {
        let Value::Object(fields) = input else {
            return Err(ComputeError::invalid_input(format!(
                "expected an object, got {}",
                type_name(input)
            )));
        };
        let a = fields.get("a").ok_or_else(|| ComputeError::missing_operand("a"))?;
        let b = fields.get("b").ok_or_else(|| ComputeError::missing_operand("b"))?;

        if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
            return add_numbers(&x, &y);
        }
        match (a, b) {
            (Value::String(x), Value::String(y)) => Ok(Value::String(format!("{}{}", x, y))),
            (Value::Array(x), Value::Array(y)) => {
                Ok(Value::Array(x.iter().chain(y.iter()).cloned().collect()))
            }
            _ => Err(ComputeError::type_mismatch(format!(
                "cannot add {} and {}",
                type_name(a),
                type_name(b)
            ))),
        }
    }
}

#[async_trait]
impl ComputeFunction for AddOperands {
    async fn compute(&self, input: Value) -> Result<Value, ComputeError> {
        Self::add(&input)
    }

    fn name(&self) -> &str {
        "add"
    }
}

/// Booleans count as 0 and 1 in arithmetic
fn numeric(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => Some(n.clone()),
        Value::Bool(b) => Some(Number::from(u8::from(*b))),
        _ => None,
    }
}

fn add_numbers(x: &Number, y: &Number) -> Result<Value, ComputeError> {
    let as_int = |n: &Number| {
        n.as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
    };

    if let (Some(x), Some(y)) = (as_int(x), as_int(y)) {
        let sum = x + y;
        if let Ok(v) = i64::try_from(sum) {
            return Ok(Value::from(v));
        }
        if let Ok(v) = u64::try_from(sum) {
            return Ok(Value::from(v));
        }
        return Err(ComputeError::overflow(format!("{} + {} exceeds 64 bits", x, y)));
    }

    let (Some(x), Some(y)) = (x.as_f64(), y.as_f64()) else {
        return Err(ComputeError::type_mismatch("number is not representable"));
    };
    Number::from_f64(x + y)
        .map(Value::Number)
        .ok_or_else(|| ComputeError::overflow(format!("{} + {} is not finite", x, y)))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Runs a synchronous function on tokio's blocking pool
pub struct BlockingCompute<F> {
    name: String,
    func: Arc<F>,
}

impl<F> BlockingCompute<F>
where
    F: Fn(Value) -> Result<Value, ComputeError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl<F> ComputeFunction for BlockingCompute<F>
where
    F: Fn(Value) -> Result<Value, ComputeError> + Send + Sync + 'static,
{
    async fn compute(&self, input: Value) -> Result<Value, ComputeError> {
        let func = self.func.clone();
        match tokio::task::spawn_blocking(move || func(input)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ComputeError::new(
                PANIC_KIND,
                panic_message(e.into_panic().as_ref()),
            )),
            Err(e) => Err(ComputeError::new("Cancelled", e.to_string())),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_integers() {
        assert_eq!(AddOperands::add(&json!({"a": 2, "b": 3})).unwrap(), json!(5));
        assert_eq!(AddOperands::add(&json!({"a": -7, "b": 3})).unwrap(), json!(-4));
    }

    #[test]
    fn test_add_floats() {
        assert_eq!(AddOperands::add(&json!({"a": 1.5, "b": 2})).unwrap(), json!(3.5));
    }

    #[test]
    fn test_add_large_unsigned() {
        let sum = AddOperands::add(&json!({"a": u64::MAX - 1, "b": 1})).unwrap();
        assert_eq!(sum, json!(u64::MAX));
    }

    #[test]
    fn test_add_overflow() {
        let err = AddOperands::add(&json!({"a": u64::MAX, "b": 1})).unwrap_err();
        assert_eq!(err.kind, "Overflow");
    }

    #[test]
    fn test_add_booleans_as_integers() {
        assert_eq!(AddOperands::add(&json!({"a": true, "b": 1})).unwrap(), json!(2));
        assert_eq!(AddOperands::add(&json!({"a": true, "b": true})).unwrap(), json!(2));
        assert_eq!(AddOperands::add(&json!({"a": false, "b": 1.5})).unwrap(), json!(1.5));

        let err = AddOperands::add(&json!({"a": true, "b": "x"})).unwrap_err();
        assert_eq!(err.kind, "TypeMismatch");
        assert_eq!(err.message, "cannot add bool and string");
    }

    #[test]
    fn test_concatenation() {
        assert_eq!(
            AddOperands::add(&json!({"a": "foo", "b": "bar"})).unwrap(),
            json!("foobar")
        );
        assert_eq!(
            AddOperands::add(&json!({"a": [1], "b": [2, 3]})).unwrap(),
            json!([1, 2, 3])
        );
    }

    #[test]
    fn test_type_mismatch() {
        let err = AddOperands::add(&json!({"a": "x", "b": 3})).unwrap_err();
        assert_eq!(err.kind, "TypeMismatch");
        assert!(err.partial.is_none());
        assert_eq!(err.message, "cannot add string and number");
    }

    #[test]
    fn test_missing_operand() {
        let err = AddOperands::add(&json!({"a": 1})).unwrap_err();
        assert_eq!(err.kind, "MissingOperand");
        assert!(err.message.contains("'b'"));
    }

    #[test]
    fn test_invalid_input() {
        let err = AddOperands::add(&json!([1, 2])).unwrap_err();
        assert_eq!(err.kind, "InvalidInput");
    }

    #[test]
    fn test_error_display() {
        let err = ComputeError::type_mismatch("nope").with_partial(json!(1));
        assert_eq!(err.to_string(), "TypeMismatch: nope");
        assert_eq!(err.partial, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_blocking_compute() {
        let double = BlockingCompute::new("double", |input: Value| {
            input
                .as_i64()
                .map(|n| json!(n * 2))
                .ok_or_else(|| ComputeError::invalid_input("not an integer"))
        });

        assert_eq!(double.name(), "double");
        assert_eq!(double.compute(json!(21)).await.unwrap(), json!(42));
        assert_eq!(
            double.compute(json!("x")).await.unwrap_err().kind,
            "InvalidInput"
        );
    }

    #[tokio::test]
    async fn test_blocking_compute_panic() {
        let boom = BlockingCompute::new("boom", |_input: Value| -> Result<Value, ComputeError> {
            panic!("kaboom")
        });

        let err = boom.compute(json!(null)).await.unwrap_err();
        assert_eq!(err.kind, PANIC_KIND);
        assert_eq!(err.message, "kaboom");
    }
}
