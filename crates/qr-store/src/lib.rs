//! # qr-store — The working set of QUARRY
//!
//! Two engine-scoped singletons live here:
//!
//! - the [`Store`]: an in-memory cache of records keyed by a configured
//!   primary-key field, with secondary reference indexes, taint/delete
//!   journals feeding the diff ledger, and an optional time-decayed sweep;
//! - the [`DiffLedger`]: an append-only list of tag-stamped record-key
//!   change-sets answering "what changed since tag T".
//!
//! Both hand out deep copies on read; callers can never alias stored state.

pub mod diff;
pub mod store;

pub use diff::{DiffEntry, DiffLedger};
pub use store::{Store, StoreError};
