//! # qr-core — The shared vocabulary of QUARRY
//!
//! Everything the gateway passes between its moving parts lives here: the
//! dynamic record maps the stores cache, the closed [`RecordRequest`] sum the
//! generator emits and the stage workers dispatch on, the [`Response`] and
//! [`ResponseError`] types that flow back out, and the [`RequestContext`]
//! envelope decoded from the wire.
//!
//! Records are schema-agnostic property bags (`serde_json` maps); the only
//! structural requirement anywhere in the system is the store-configured
//! primary-key field.

pub mod context;
pub mod error;
pub mod params;
pub mod request;
pub mod response;

pub use context::RequestContext;
pub use error::{ErrorKind, ResponseError};
pub use params::{Parameter, Parameters, Value};
pub use request::{RecordRequest, Request};
pub use response::{Response, ResponseWriter};
