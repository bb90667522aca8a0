//! # Record requests
//!
//! The closed sum of operations a pipeline stage can become. The generator
//! emits these, the stream pool carries them opaquely, and the stage workers
//! dispatch on the variant.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::params::Parameter;
use crate::response::Response;

/// A typed stage operation, correlated by `rid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordRequest {
    /// Exact match by one field. The value is carried untyped as a string
    /// and compared against each record value's canonical string form.
    Find {
        doc: String,
        rid: String,
        key: String,
        value: String,
    },
    /// Bounded scan; `amount = -1` means all.
    FindN {
        doc: String,
        rid: String,
        amount: i64,
        skip: i64,
    },
    /// Project the listed (possibly dotted) paths from the previous stage's
    /// result.
    Collects { rid: String, keys: Vec<String> },
    /// Merge the parameter map into each record of the previous stage's
    /// result and persist.
    Mutate {
        doc: String,
        rid: String,
        parameter: Parameter,
    },
}

impl RecordRequest {
    /// The correlation id this request carries.
    pub fn rid(&self) -> &str {
        match self {
            Self::Find { rid, .. }
            | Self::FindN { rid, .. }
            | Self::Collects { rid, .. }
            | Self::Mutate { rid, .. } => rid,
        }
    }

    /// The stage name this request answers to.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Find { .. } => "find",
            Self::FindN { .. } => "findN",
            Self::Collects { .. } => "collects",
            Self::Mutate { .. } => "mutate",
        }
    }

    /// Whether this request consumes the previous stage's reply.
    pub fn is_dependent(&self) -> bool {
        matches!(self, Self::Collects { .. } | Self::Mutate { .. })
    }
}

// =============================================================================
// The threaded envelope
// =============================================================================

/// A request in flight through a stream pool, carrying the previous stage's
/// reply for dependent stages and an optional per-request wait budget that
/// overrides the pool default.
#[derive(Debug, Clone)]
pub struct Request {
    pub record: RecordRequest,
    pub last_response: Option<Response>,
    pub wait: Option<Duration>,
}

impl Request {
    pub fn new(record: RecordRequest) -> Self {
        Self {
            record,
            last_response: None,
            wait: None,
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn rid(&self) -> &str {
        self.record.rid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_names_and_dependence() {
        let find = RecordRequest::Find {
            doc: "users".into(),
            rid: "r".into(),
            key: "id".into(),
            value: "1".into(),
        };
        assert_eq!(find.name(), "find");
        assert!(!find.is_dependent());

        let collects = RecordRequest::Collects {
            rid: "r".into(),
            keys: vec!["name".into()],
        };
        assert_eq!(collects.name(), "collects");
        assert!(collects.is_dependent());
        assert_eq!(collects.rid(), "r");
    }
}
