//! # Dispatch router
//!
//! Two-level route table: root → sub-path → `{generator, handler}` binding.
//! `serve` turns stage tokens into requests via the binding's generator and
//! hands them to the handler in a detached task behind a panic barrier.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use qr_core::error::ErrorKind;
use qr_core::{RecordRequest, ResponseError, ResponseWriter};

use crate::generator::Generator;

/// A routed document processor: receives the generated requests for one
/// pipeline and writes replies through the supplied writer.
#[async_trait::async_trait]
pub trait DocumentHandler: Send + Sync {
    async fn handle(&self, requests: Vec<RecordRequest>, writer: Arc<dyn ResponseWriter>);
}

#[derive(Clone)]
struct Binding {
    generator: Arc<dyn Generator>,
    handler: Arc<dyn DocumentHandler>,
}

#[derive(Default)]
pub struct DispatchRouter {
    routes: RwLock<HashMap<String, HashMap<String, Binding>>>,
}

impl DispatchRouter {
    /// Attach a generator/handler pair at `(root, sub)`.
    pub async fn document(
        &self,
        root: &str,
        sub: &str,
        generator: Arc<dyn Generator>,
        handler: Arc<dyn DocumentHandler>,
    ) {
        let mut routes = self.routes.write().await;
        routes
            .entry(root.to_string())
            .or_default()
            .insert(sub.to_string(), Binding { generator, handler });
        tracing::info!(root, sub, "registered document route");
    }

    /// Dispatch one parsed pipeline. Replies arrive asynchronously through
    /// the writer; a handler panic is converted into an internal error.
    pub async fn serve(
        &self,
        root: &str,
        sub: &str,
        rid: &str,
        stages: Vec<String>,
        writer: Arc<dyn ResponseWriter>,
    ) {
        let binding = {
            let routes = self.routes.read().await;
            routes.get(root).and_then(|subs| subs.get(sub)).cloned()
        };

        let Some(binding) = binding else {
            writer
                .write(Err(ResponseError::new(
                    ErrorKind::NotFound,
                    rid,
                    format!("no document registered at '{root}.{sub}'"),
                )))
                .await;
            return;
        };

        let requests = match binding.generator.generate(rid, sub, &stages) {
            Ok(requests) => requests,
            Err(err) => {
                writer.write(Err(err)).await;
                return;
            }
        };

        let rid = rid.to_string();
        let handler = binding.handler;
        tokio::spawn(async move {
            let inner_writer = writer.clone();
            let task = tokio::spawn(async move { handler.handle(requests, inner_writer).await });

            if let Err(join_err) = task.await {
                if !join_err.is_panic() {
                    return;
                }
                let payload = join_err.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "opaque panic payload".to_string());

                tracing::error!(rid = rid.as_str(), "document handler panicked: {message}");
                writer
                    .write(Err(ResponseError::new(
                        ErrorKind::Internal,
                        &rid,
                        "document handler panicked",
                    )
                    .with_cause(message)))
                    .await;
            }
        });
    }
}
