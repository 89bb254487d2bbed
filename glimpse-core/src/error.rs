use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{Family, MemoryClass};

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between a normalized request and a normalized result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("model '{key}' is a {family} model and cannot serve {request} requests")]
    FamilyMismatch {
        key: String,
        family: Family,
        request: &'static str,
    },

    #[error("mode '{mode}' is not supported by model '{key}'")]
    InvalidMode { key: String, mode: String },

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error(
        "cannot load '{key}' ({class:?}): {requested} memory units requested, \
         {committed}/{budget} already committed"
    )]
    CapacityExceeded {
        key: String,
        class: MemoryClass,
        requested: u32,
        committed: u32,
        budget: u32,
    },

    #[error("all {0} request slots are busy")]
    Busy(usize),

    #[error("failed to load model '{key}': {cause:#}")]
    LoadFailed {
        key: String,
        cause: Arc<anyhow::Error>,
    },

    #[error("inference failed on model '{key}': {cause:#}")]
    InferenceFailed {
        key: String,
        cause: Arc<anyhow::Error>,
    },

    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownModel(_) => ErrorKind::UnknownModel,
            Error::FamilyMismatch { .. } => ErrorKind::FamilyMismatch,
            Error::InvalidMode { .. } => ErrorKind::InvalidMode,
            Error::InvalidParameter { .. } | Error::Config(_) => ErrorKind::InvalidParameter,
            Error::CapacityExceeded { .. } | Error::Busy(_) => ErrorKind::ServiceUnavailable,
            Error::LoadFailed { .. } => ErrorKind::LoadFailed,
            Error::InferenceFailed { .. } => ErrorKind::InferenceFailed,
            Error::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// Failure categories exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownModel,
    FamilyMismatch,
    InvalidMode,
    InvalidParameter,
    ServiceUnavailable,
    LoadFailed,
    InferenceFailed,
    Timeout,
}

impl ErrorKind {
    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::ServiceUnavailable | ErrorKind::Timeout)
    }
}

/// The single failure shape handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub error_kind: ErrorKind,
    pub message: String,
    pub correlation_id: Uuid,
}

impl Failure {
    pub fn new(error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_kind,
            message: message.into(),
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Backend errors are not echoed verbatim; the caller gets a category and the
    /// correlation id that ties it to the log line.
    pub fn from_error(err: &Error) -> Self {
        let kind = err.kind();
        let message = match err {
            Error::LoadFailed { key, .. } => format!("model '{key}' failed to load"),
            Error::InferenceFailed { key, .. } => format!("inference failed on model '{key}'"),
            other => other.to_string(),
        };
        Self::new(kind, message)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({:?}, correlation id {})",
            self.message, self.error_kind, self.correlation_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_detail_is_not_exposed() {
        let err = Error::LoadFailed {
            key: "blip-large".to_string(),
            cause: Arc::new(anyhow::anyhow!("connection reset by peer at 10.0.0.3")),
        };
        let failure = Failure::from_error(&err);
        assert_eq!(failure.error_kind, ErrorKind::LoadFailed);
        assert!(!failure.message.contains("10.0.0.3"));
        // the internal display keeps the full chain for logs
        assert!(err.to_string().contains("10.0.0.3"));
    }

    #[test]
    fn validation_messages_pass_through() {
        let err = Error::invalid_parameter("temperature", "must lie in (0, 2], got 5");
        let failure = Failure::from_error(&err);
        assert_eq!(failure.error_kind, ErrorKind::InvalidParameter);
        assert!(failure.message.contains("temperature"));
    }

    #[test]
    fn only_capacity_and_timeout_are_retryable() {
        assert!(Error::Busy(4).kind().is_retryable());
        assert!(Error::Timeout(Duration::from_millis(50)).kind().is_retryable());
        assert!(!Error::UnknownModel("x".into()).kind().is_retryable());
        assert!(!ErrorKind::LoadFailed.is_retryable());
    }

    #[test]
    fn kinds_serialize_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ServiceUnavailable).unwrap();
        assert_eq!(json, "\"service_unavailable\"");
    }
}
