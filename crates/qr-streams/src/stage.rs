//! # Stages
//!
//! A stage transforms items flowing through a pool. Stages dispatch on the
//! request variant they own and pass everything else through untouched, so
//! a pool wires one stage per operation into a single linear chain.

use qr_core::{Request, Response, ResponseError};

/// One datum traversing a pool: a request on its way to being answered, or
/// a response on its way out.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Request(Request),
    Response(Response),
}

impl StreamItem {
    /// The correlation id this item carries.
    pub fn rid(&self) -> &str {
        match self {
            Self::Request(req) => req.rid(),
            Self::Response(res) => res.request_id(),
        }
    }
}

/// A pool stage. `process` must be side-effect-free except through the
/// store and backend the stage owns.
#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    async fn process(&self, item: StreamItem) -> Result<StreamItem, ResponseError>;
}

/// The fixed identity stage at a pool's head and tail.
pub struct Identity;

#[async_trait::async_trait]
impl Stage for Identity {
    async fn process(&self, item: StreamItem) -> Result<StreamItem, ResponseError> {
        Ok(item)
    }
}
