//! # Error model
//!
//! Every failure that can surface to a writer is a [`ResponseError`]: a
//! request correlation id, a closed [`ErrorKind`], a human message, and an
//! optional underlying cause. Kinds are deliberately coarse: they name the
//! contract that was broken, not the module that noticed.

use serde::{Deserialize, Serialize};

/// The closed set of failure kinds the gateway reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("parse error")]
    Parse,
    #[error("unknown stage")]
    UnknownStage,
    #[error("missing key")]
    MissingKey,
    #[error("missing value")]
    MissingValue,
    #[error("missing json")]
    MissingJson,
    #[error("invalid integer")]
    InvalidInteger,
    #[error("invalid json")]
    InvalidJson,
    #[error("not found")]
    NotFound,
    #[error("unknown ref")]
    UnknownRef,
    #[error("no value")]
    NoValue,
    #[error("invalid key type")]
    InvalidKeyType,
    #[error("timeout")]
    Timeout,
    #[error("shutdown")]
    Shutdown,
    #[error("internal error")]
    Internal,
}

/// An error reply correlated to a request.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{rid}: {kind}: {message}")]
pub struct ResponseError {
    /// Correlation id of the request that failed.
    pub rid: String,
    pub kind: ErrorKind,
    pub message: String,
    /// Underlying cause, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ResponseError {
    pub fn new(kind: ErrorKind, rid: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rid: rid.into(),
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl ToString) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn request_id(&self) -> &str {
        &self.rid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_rid_and_kind() {
        let err = ResponseError::new(ErrorKind::Timeout, "R1", "request timed out");
        assert_eq!(err.to_string(), "R1: timeout: request timed out");
    }

    #[test]
    fn test_error_cause_is_optional() {
        let err = ResponseError::new(ErrorKind::Internal, "R1", "boom").with_cause("worker panic");
        assert_eq!(err.cause.as_deref(), Some("worker panic"));

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "internal");
        assert_eq!(json["cause"], "worker panic");

        let bare = ResponseError::new(ErrorKind::NotFound, "R2", "missing");
        let json = serde_json::to_value(&bare).unwrap();
        assert!(json.get("cause").is_none());
    }
}
