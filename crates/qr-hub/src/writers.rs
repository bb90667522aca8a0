//! # Response shapers
//!
//! Decorators over the outbound [`ResponseWriter`]:
//!
//! - [`BatchWriter`] collects a fixed number of replies (data or error,
//!   in arrival order) and flushes a single combined response downstream;
//! - [`JsonShapeWriter`] drains the store's taint journal into the diff
//!   ledger and wraps the reply in the wire envelope, attaching diff
//!   metadata when the client asked for it.
//!
//! All writes to a given downstream writer are serialized here.

use std::sync::Arc;

use serde_json::json;

use qr_core::params::{Parameter, Parameters, Value};
use qr_core::{RequestContext, Response, ResponseError, ResponseWriter};
use qr_store::{DiffLedger, Store};

fn records_value(records: Parameters) -> Value {
    Value::Array(records.into_iter().map(Value::Object).collect())
}

// =============================================================================
// Batch
// =============================================================================

#[derive(Default)]
struct BatchState {
    collected: usize,
    data: Parameters,
    flushed: bool,
}

/// Accumulates `total` replies and flushes them downstream as one response,
/// slots filled in arrival order.
pub struct BatchWriter {
    downstream: Arc<dyn ResponseWriter>,
    rid: String,
    total: usize,
    state: tokio::sync::Mutex<BatchState>,
}

impl BatchWriter {
    pub fn new(downstream: Arc<dyn ResponseWriter>, rid: impl Into<String>, total: usize) -> Self {
        Self {
            downstream,
            rid: rid.into(),
            total: total.max(1),
            state: tokio::sync::Mutex::new(BatchState::default()),
        }
    }
}

#[async_trait::async_trait]
impl ResponseWriter for BatchWriter {
    async fn write(&self, reply: Result<Response, ResponseError>) {
        let flush = {
            let mut state = self.state.lock().await;
            if state.flushed {
                tracing::warn!(rid = self.rid.as_str(), "write after batch flush, dropped");
                return;
            }

            let mut slot = Parameter::new();
            match reply {
                Ok(res) => {
                    slot.insert("data".into(), records_value(res.data));
                }
                Err(err) => {
                    slot.insert("error".into(), json!(err.kind));
                    slot.insert("message".into(), Value::String(err.message));
                }
            }
            state.data.push(slot);
            state.collected += 1;

            if state.collected >= self.total {
                state.flushed = true;
                Some(std::mem::take(&mut state.data))
            } else {
                None
            }
        };

        if let Some(data) = flush {
            self.downstream
                .write(Ok(Response::new("batch", self.rid.clone(), data)))
                .await;
        }
    }
}

// =============================================================================
// JSON shape
// =============================================================================

/// Wraps replies in the wire envelope and maintains the diff ledger.
pub struct JsonShapeWriter {
    downstream: Arc<dyn ResponseWriter>,
    store: Arc<Store>,
    ledger: Arc<DiffLedger>,
    ctx: RequestContext,
}

impl JsonShapeWriter {
    pub fn new(
        downstream: Arc<dyn ResponseWriter>,
        store: Arc<Store>,
        ledger: Arc<DiffLedger>,
        ctx: RequestContext,
    ) -> Self {
        Self {
            downstream,
            store,
            ledger,
            ctx,
        }
    }

    /// Move freshly tainted record keys into the ledger as a new change-set.
    async fn drain_tainted(&self) {
        let tainted = self.store.tainted_records().await;
        if tainted.is_empty() {
            return;
        }
        let tag = self.ledger.put(tainted).await;
        self.store.clear_tainted().await;
        tracing::debug!(tag = tag.as_str(), "drained taint journal into diff ledger");
    }

    async fn diff_fields(&self, envelope: &mut Parameter) {
        let tags = self.ledger.keys().await;
        let Some(latest) = tags.last() else { return };

        envelope.insert("delta_id".into(), Value::String(latest.clone()));

        let known = !self.ctx.diff_tag.is_empty() && self.ledger.has(&self.ctx.diff_tag).await;
        let deltas: Vec<String> = if known {
            envelope.insert(
                "last_delta_id".into(),
                Value::String(self.ctx.diff_tag.clone()),
            );
            if self.ctx.diff_watch.is_empty() {
                self.ledger.pull_from(&self.ctx.diff_tag).await
            } else {
                let changes = self
                    .ledger
                    .analyze_with(&self.ctx.diff_tag, &self.ctx.diff_watch)
                    .await;
                self.ctx
                    .diff_watch
                    .iter()
                    .filter(|key| changes.get(*key).copied().unwrap_or(false))
                    .cloned()
                    .collect()
            }
        } else if self.ctx.diff_watch.is_empty() {
            // no usable tag: report the latest change-set wholesale
            self.ledger.get(latest).await
        } else {
            let changes = self.ledger.analyze(&self.ctx.diff_watch).await;
            self.ctx
                .diff_watch
                .iter()
                .filter(|key| changes.get(*key).copied().unwrap_or(false))
                .cloned()
                .collect()
        };

        envelope.insert("deltas".into(), json!(deltas));
    }
}

#[async_trait::async_trait]
impl ResponseWriter for JsonShapeWriter {
    async fn write(&self, reply: Result<Response, ResponseError>) {
        self.drain_tainted().await;

        let res = match reply {
            Ok(res) => res,
            Err(err) => {
                // errors pass through unshaped
                self.downstream.write(Err(err)).await;
                return;
            }
        };

        let mut envelope = Parameter::new();
        envelope.insert(
            "record_key".into(),
            Value::String(self.store.key().to_string()),
        );
        envelope.insert(
            "request_id".into(),
            Value::String(self.ctx.request_id.clone()),
        );
        envelope.insert("batch".into(), Value::Bool(self.ctx.queries.len() > 1));
        envelope.insert("total".into(), json!(res.data.len()));

        if self.ctx.diffs {
            self.diff_fields(&mut envelope).await;
        }

        envelope.insert("results".into(), records_value(res.data));

        self.downstream
            .write(Ok(Response::new(
                "json",
                self.ctx.request_id.clone(),
                vec![envelope],
            )))
            .await;
    }
}
