//! Column codecs.
//!
//! Each structured column has exactly one codec interface with an explicit `dump`/`load`
//! contract. `dump` accepts either the structured shape or an already serialized string, which
//! is stored unchanged. Anything else is an [`CodecError::InvalidFieldValue`].
//!
//! The `job_class` column is handled by [`JobRegistry`](crate::core::registry::JobRegistry),
//! which maps stable string keys to registered jobs.
use crate::core::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while converting between column text and structured values.
#[derive(Error, Debug)]
pub enum CodecError {
    /// A value of the wrong shape was given to a codec, or a stored column could not be read back.
    #[error("Invalid value for {field}: {reason}")]
    InvalidFieldValue { field: &'static str, reason: String },
}

impl CodecError {
    pub fn invalid(field: &'static str, reason: impl fmt::Display) -> Self {
        CodecError::InvalidFieldValue {
            field,
            reason: reason.to_string(),
        }
    }
}

/// Codec for the `arguments` column.
pub trait ArgumentCodec: Send + Sync + fmt::Debug {
    /// Serialize a sequence of arguments. A string is taken to be pre-serialized and returned as is.
    fn dump(&self, arguments: &Value) -> Result<String, CodecError>;
    /// Parse the stored text back into the argument sequence.
    fn load(&self, raw: &str) -> Result<Vec<Value>, CodecError>;
}

/// Codec for the `exception_executions` column.
pub trait ExceptionExecutionsCodec: Send + Sync + fmt::Debug {
    fn dump(&self, exception_executions: &Value) -> Result<String, CodecError>;
    fn load(&self, raw: &str) -> Result<BTreeMap<String, u32>, CodecError>;
}

/// Arguments stored as a JSON array.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonArguments;

impl ArgumentCodec for JsonArguments {
    fn dump(&self, arguments: &Value) -> Result<String, CodecError> {
        match arguments {
            Value::Array(_) => serde_json::to_string(arguments)
                .map_err(|e| CodecError::invalid("arguments", e)),
            Value::String(raw) => Ok(raw.clone()),
            other => Err(CodecError::invalid(
                "arguments",
                format!("expected an array or a string, got {other}"),
            )),
        }
    }

    fn load(&self, raw: &str) -> Result<Vec<Value>, CodecError> {
        match serde_json::from_str::<Value>(raw).map_err(|e| CodecError::invalid("arguments", e))? {
            Value::Array(items) => Ok(items),
            other => Err(CodecError::invalid(
                "arguments",
                format!("expected a JSON array, got {other}"),
            )),
        }
    }
}

/// Exception executions stored as a JSON object of counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonExceptionExecutions;

impl ExceptionExecutionsCodec for JsonExceptionExecutions {
    fn dump(&self, exception_executions: &Value) -> Result<String, CodecError> {
        match exception_executions {
            Value::Object(_) => serde_json::to_string(exception_executions)
                .map_err(|e| CodecError::invalid("exception_executions", e)),
            Value::String(raw) => Ok(raw.clone()),
            other => Err(CodecError::invalid(
                "exception_executions",
                format!("expected an object or a string, got {other}"),
            )),
        }
    }

    fn load(&self, raw: &str) -> Result<BTreeMap<String, u32>, CodecError> {
        serde_json::from_str(raw).map_err(|e| CodecError::invalid("exception_executions", e))
    }
}

/// The codecs a coordinator uses, selected once at construction time.
#[derive(Debug, Clone)]
pub struct Codecs {
    pub arguments: Arc<dyn ArgumentCodec>,
    pub exception_executions: Arc<dyn ExceptionExecutionsCodec>,
}

impl Default for Codecs {
    fn default() -> Self {
        Self {
            arguments: Arc::new(JsonArguments),
            exception_executions: Arc::new(JsonExceptionExecutions),
        }
    }
}
