//! # Responses and the writer seam

use serde::{Deserialize, Serialize};

use crate::error::ResponseError;
use crate::params::Parameters;

/// A reply to a single request: the originating request's tag, its
/// correlation id, and a sequence of record-shaped maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Tag of the request variant that produced this reply (or a shaper's
    /// own tag, e.g. `batch`).
    pub kind: String,
    pub rid: String,
    pub data: Parameters,
}

impl Response {
    pub fn new(kind: impl Into<String>, rid: impl Into<String>, data: Parameters) -> Self {
        Self {
            kind: kind.into(),
            rid: rid.into(),
            data,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.rid
    }
}

// =============================================================================
// Writer seam
// =============================================================================

/// The outbound seam every reply flows through. Shapers decorate writers;
/// the protocol layer supplies the terminal one.
#[async_trait::async_trait]
pub trait ResponseWriter: Send + Sync {
    async fn write(&self, reply: Result<Response, ResponseError>);
}
