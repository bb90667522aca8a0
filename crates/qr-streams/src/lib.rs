//! # qr-streams — The stage plumbing of QUARRY
//!
//! A [`StreamPool`] applies each record request through a linear chain of
//! stage workers and returns a single reply (or error) correlated by `rid`.
//! The pool, not the stages, enforces the per-pipeline contract:
//! sequential execution, `lastResponse` threading into dependent stages,
//! wait budgets, and abort-on-error.
//!
//! Observers may subscribe to the pool's tail and see a copy of every
//! response and error traversing it; a slow observer lags and drops (with a
//! warning) rather than back-pressuring the hot path.

pub mod pool;
pub mod stage;

pub use pool::{Observer, PoolBuilder, PoolConfig, StreamPool};
pub use stage::{Identity, Stage, StreamItem};
