//! # Engine
//!
//! The top-level façade. Per incoming [`RequestContext`]: choose the
//! outbound writer stack (JSON-shape unless the client opted out, batched
//! when the context carries more than one query), parse each pipeline, and
//! dispatch it through the router. Replies arrive asynchronously through
//! the writer.

use std::sync::Arc;

use qr_core::error::ErrorKind;
use qr_core::{RequestContext, ResponseError, ResponseWriter};
use qr_store::{DiffLedger, Store};

use crate::generator::Generator;
use crate::parser;
use crate::router::{DispatchRouter, DocumentHandler};
use crate::writers::{BatchWriter, JsonShapeWriter};

pub struct Engine {
    router: DispatchRouter,
    store: Arc<Store>,
    ledger: Arc<DiffLedger>,
}

impl Engine {
    pub fn new(store: Arc<Store>, ledger: Arc<DiffLedger>) -> Self {
        Self {
            router: DispatchRouter::default(),
            store,
            ledger,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<DiffLedger> {
        &self.ledger
    }

    /// Open a registration handle for one route root.
    pub fn route(&self, root: &str) -> Route<'_> {
        Route {
            engine: self,
            root: root.to_string(),
        }
    }

    /// Serve one request context. Every query gets exactly one reply (or
    /// error) through the writer; batched contexts fold them into one.
    pub async fn serve(&self, ctx: RequestContext, writer: Arc<dyn ResponseWriter>) {
        tracing::info!(
            request_id = ctx.request_id.as_str(),
            queries = ctx.queries.len(),
            diffs = ctx.diffs,
            "serving request context"
        );

        if ctx.queries.is_empty() {
            writer
                .write(Err(ResponseError::new(
                    ErrorKind::Parse,
                    &ctx.request_id,
                    "malformed request: no queries",
                )))
                .await;
            return;
        }

        let mut writer = writer;
        if !ctx.no_json {
            writer = Arc::new(JsonShapeWriter::new(
                writer,
                self.store.clone(),
                self.ledger.clone(),
                ctx.clone(),
            ));
        }
        if ctx.queries.len() > 1 {
            writer = Arc::new(BatchWriter::new(
                writer,
                ctx.request_id.clone(),
                ctx.queries.len(),
            ));
        }

        for query in &ctx.queries {
            match parser::parse_query(query) {
                Err(reason) => {
                    tracing::warn!(
                        request_id = ctx.request_id.as_str(),
                        query = query.as_str(),
                        "pipeline failed to parse: {reason}"
                    );
                    writer
                        .write(Err(ResponseError::new(
                            ErrorKind::Parse,
                            &ctx.request_id,
                            reason,
                        )))
                        .await;
                }
                Ok(mut tokens) => {
                    let stages = tokens.split_off(2);
                    let sub = tokens.pop().expect("parser guarantees two coordinates");
                    let root = tokens.pop().expect("parser guarantees two coordinates");
                    self.router
                        .serve(&root, &sub, &ctx.request_id, stages, writer.clone())
                        .await;
                }
            }
        }
    }
}

/// Fluent registration of documents under one root.
pub struct Route<'a> {
    engine: &'a Engine,
    root: String,
}

impl Route<'_> {
    pub async fn document(
        &self,
        sub: &str,
        generator: Arc<dyn Generator>,
        handler: Arc<dyn DocumentHandler>,
    ) -> &Self {
        self.engine
            .router
            .document(&self.root, sub, generator, handler)
            .await;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::source::MemorySource;
    use crate::docs::{Document, DocumentConfig};
    use crate::generator;
    use qr_core::params::{pull_path, Parameter, Value};
    use qr_core::Response;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct SpyWriter(mpsc::UnboundedSender<Result<Response, ResponseError>>);

    #[async_trait::async_trait]
    impl ResponseWriter for SpyWriter {
        async fn write(&self, reply: Result<Response, ResponseError>) {
            let _ = self.0.send(reply);
        }
    }

    fn record(v: Value) -> Parameter {
        v.as_object().unwrap().clone()
    }

    async fn engine() -> Engine {
        let store = Store::new("id");
        let ledger = DiffLedger::new();
        let source = MemorySource::new();
        source
            .seed(
                "greetings",
                vec![record(json!({"id": 1, "greeting": "Hello World!"}))],
            )
            .await;
        source
            .seed(
                "users",
                vec![
                    record(json!({"id": 1, "name": "Ada", "age": 37})),
                    record(json!({"id": 2, "name": "Grace", "age": 45})),
                ],
            )
            .await;

        let engine = Engine::new(store.clone(), ledger);
        let route = engine.route("docs");
        for doc in ["greetings", "users"] {
            route
                .document(
                    doc,
                    generator::basic(),
                    Document::new(DocumentConfig {
                        store: store.clone(),
                        source: source.clone(),
                        workers: 4,
                        wait: Duration::from_secs(5),
                    }),
                )
                .await;
        }
        engine
    }

    async fn run(engine: &Engine, ctx: RequestContext) -> Result<Response, ResponseError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.serve(ctx, Arc::new(SpyWriter(tx))).await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("engine produced no reply in time")
            .expect("writer channel closed without a reply")
    }

    fn ctx(request_id: &str, queries: &[&str]) -> RequestContext {
        RequestContext {
            request_id: request_id.into(),
            queries: queries.iter().map(|s| s.to_string()).collect(),
            ..RequestContext::default()
        }
    }

    #[tokio::test]
    async fn test_findone_round_trip() {
        let engine = engine().await;
        let reply = run(&engine, ctx("R1", &["docs.greetings.find(id,1)"]))
            .await
            .unwrap();

        let envelope = &reply.data[0];
        assert_eq!(envelope["request_id"], json!("R1"));
        assert_eq!(envelope["batch"], json!(false));
        assert_eq!(envelope["total"], json!(1));
        assert_eq!(
            envelope["results"],
            json!([{"id": 1, "greeting": "Hello World!"}])
        );
    }

    #[tokio::test]
    async fn test_batched_mixed_queries() {
        let engine = engine().await;
        let reply = run(
            &engine,
            ctx("R2", &["docs.users.find(id,1)", "docs.users.findN(0)"]),
        )
        .await
        .unwrap();

        let envelope = &reply.data[0];
        assert_eq!(envelope["batch"], json!(true));

        let results = envelope["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        for slot in results {
            let slot = slot.as_object().unwrap();
            assert!(
                slot.contains_key("data") || slot.contains_key("error"),
                "slot must be data or error: {slot:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_batch_folds_failures_per_slot() {
        let engine = engine().await;
        let reply = run(
            &engine,
            ctx("R2b", &["docs.users.find(id,1)", "docs.users.teleport()"]),
        )
        .await
        .unwrap();

        let results = reply.data[0]["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        let errored: Vec<_> = results
            .iter()
            .filter(|slot| slot.get("error").is_some())
            .collect();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0]["error"], json!("unknown_stage"));
    }

    #[tokio::test]
    async fn test_chained_collects_projects() {
        let engine = engine().await;
        let reply = run(&engine, ctx("R3", &["docs.users.find(id,1).collects(name)"]))
            .await
            .unwrap();

        let results = reply.data[0]["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["name"], json!("Ada"));
        assert!(results[0].get("age").is_none());
    }

    #[tokio::test]
    async fn test_malformed_pipeline_is_an_error_reply() {
        let engine = engine().await;
        let err = run(&engine, ctx("R4", &["doc.greetings"])).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
        assert_eq!(err.request_id(), "R4");
    }

    #[tokio::test]
    async fn test_empty_context_is_malformed() {
        let engine = engine().await;
        let err = run(&engine, ctx("R5", &[])).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
    }

    #[tokio::test]
    async fn test_unrouted_document_not_found() {
        let engine = engine().await;
        let err = run(&engine, ctx("R6", &["docs.ghosts.findN(0)"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_diff_pull_since_tag() {
        let engine = engine().await;
        let t1 = engine
            .ledger()
            .put(vec!["1".into(), "2".into(), "3".into()])
            .await;
        let t2 = engine
            .ledger()
            .put(vec!["1".into(), "12".into(), "31".into()])
            .await;

        let mut context = ctx("R7", &["docs.greetings.findN(0)"]);
        context.diffs = true;
        context.diff_tag = t1.clone();

        let reply = run(&engine, context).await.unwrap();
        let envelope = &reply.data[0];

        assert_eq!(envelope["delta_id"], json!(t2));
        assert_eq!(envelope["last_delta_id"], json!(t1));
        let deltas = envelope["deltas"].as_array().unwrap();
        for key in ["1", "12", "31"] {
            assert!(deltas.contains(&json!(key)), "missing delta {key}");
        }
        // duplicates removed
        assert_eq!(deltas.len(), 3);
    }

    #[tokio::test]
    async fn test_diff_analyze_with_watch_list() {
        let engine = engine().await;
        let t1 = engine
            .ledger()
            .put(vec!["1".into(), "2".into(), "3".into()])
            .await;
        engine
            .ledger()
            .put(vec!["1".into(), "12".into(), "31".into()])
            .await;

        let mut context = ctx("R8", &["docs.greetings.findN(0)"]);
        context.diffs = true;
        context.diff_tag = t1;
        context.diff_watch = vec!["1".into(), "99".into()];

        let reply = run(&engine, context).await.unwrap();
        assert_eq!(reply.data[0]["deltas"], json!(["1"]));
    }

    #[tokio::test]
    async fn test_no_json_writes_raw_replies() {
        let engine = engine().await;
        let mut context = ctx("R9", &["docs.greetings.find(id,1)"]);
        context.no_json = true;

        let reply = run(&engine, context).await.unwrap();
        assert_eq!(reply.kind, "find");
        assert_eq!(reply.data[0].get("greeting"), Some(&json!("Hello World!")));
    }

    #[tokio::test]
    async fn test_mutate_pipeline_updates_store_and_ledger() {
        let engine = engine().await;
        let reply = run(
            &engine,
            ctx("R10", &[r#"docs.users.find(id,1).mutate({"name":"alex"})"#]),
        )
        .await
        .unwrap();

        let results = reply.data[0]["results"].as_array().unwrap();
        assert_eq!(results[0]["name"], json!("alex"));
        assert_eq!(results[0]["age"], json!(37));

        // the mutation reached the store
        let cached = engine.store().get("1").await.unwrap();
        assert_eq!(cached.get("name"), Some(&json!("alex")));

        // and the write was drained into the ledger by the shaper
        assert!(engine.store().tainted_records().await.is_empty());
        assert!(!engine.ledger().keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_chained_findn_windows_previous_reply() {
        let engine = engine().await;
        let reply = run(&engine, ctx("R11", &["docs.users.findN(-1).findN(1,1)"]))
            .await
            .unwrap();

        let results = reply.data[0]["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["name"], json!("Grace"));
    }

    #[tokio::test]
    async fn test_collects_of_dotted_paths_end_to_end() {
        let store = Store::new("id");
        let ledger = DiffLedger::new();
        let source = MemorySource::new();
        source
            .seed(
                "users",
                vec![record(
                    json!({"id": 1, "name": "Ada", "address": {"state": "lagos", "country": "NG"}}),
                )],
            )
            .await;

        let engine = Engine::new(store.clone(), ledger);
        engine
            .route("docs")
            .document(
                "users",
                generator::basic(),
                Document::new(DocumentConfig {
                    store,
                    source,
                    workers: 2,
                    wait: Duration::from_secs(5),
                }),
            )
            .await;

        let reply = run(
            &engine,
            ctx("R12", &["docs.users.find(id,1).collects(name,address.state)"]),
        )
        .await
        .unwrap();

        let results = reply.data[0]["results"].as_array().unwrap();
        let item = results[0].as_object().unwrap();
        assert_eq!(item["name"], json!("Ada"));
        assert_eq!(pull_path(item, "address.state"), Some(json!("lagos")));
        assert_eq!(pull_path(item, "address.country"), None);
    }
}
