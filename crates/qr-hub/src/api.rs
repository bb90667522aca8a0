//! # HTTP handlers
//!
//! The thin protocol skin over the engine. `POST /query` decodes the JSON
//! envelope; `GET /query` accepts the form-style `coquery=<pipeline>`
//! submission. The reply's `X-Coquery-Request-ID` header echoes the
//! request id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use qr_core::params::Value;
use qr_core::{RequestContext, Response, ResponseError, ResponseWriter};

use crate::engine::Engine;

pub struct AppState {
    pub engine: Engine,
    pub start_time: Instant,
    /// Upper bound on how long a handler waits for the engine's reply.
    pub reply_timeout: Duration,
}

/// Terminal writer: forwards the engine's single final reply to the
/// waiting HTTP handler.
struct ChannelWriter(mpsc::UnboundedSender<Result<Response, ResponseError>>);

#[async_trait::async_trait]
impl ResponseWriter for ChannelWriter {
    async fn write(&self, reply: Result<Response, ResponseError>) {
        if self.0.send(reply).is_err() {
            tracing::warn!("reply arrived after the http client went away");
        }
    }
}

// =============================================================================
// Query submission
// =============================================================================

pub async fn handle_query(
    State(state): State<Arc<AppState>>,
    Json(ctx): Json<RequestContext>,
) -> HttpResponse {
    run_context(state, ctx).await
}

/// Form-style submission: `GET /query?coquery=<pipeline>&requestid=<id>`.
#[derive(Deserialize)]
pub struct FormQuery {
    coquery: Option<String>,
    requestid: Option<String>,
    #[serde(default)]
    diffs: bool,
    diff_tag: Option<String>,
    #[serde(default)]
    no_json: bool,
}

pub async fn handle_form_query(
    State(state): State<Arc<AppState>>,
    Query(form): Query<FormQuery>,
) -> HttpResponse {
    let Some(query) = form.coquery.filter(|q| !q.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "parse", "message": "missing coquery parameter"})),
        )
            .into_response();
    };

    let ctx = RequestContext {
        request_id: form
            .requestid
            .filter(|rid| !rid.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().as_simple().to_string()),
        queries: vec![query],
        diffs: form.diffs,
        diff_tag: form.diff_tag.unwrap_or_default(),
        diff_watch: Vec::new(),
        no_json: form.no_json,
    };

    run_context(state, ctx).await
}

async fn run_context(state: Arc<AppState>, ctx: RequestContext) -> HttpResponse {
    let request_id = ctx.request_id.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();

    state.engine.serve(ctx, Arc::new(ChannelWriter(tx))).await;

    let reply = tokio::time::timeout(state.reply_timeout, rx.recv()).await;
    let headers = [("x-coquery-request-id", request_id.clone())];

    match reply {
        Err(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            headers,
            Json(json!({
                "error": "timeout",
                "message": "no reply within the gateway budget",
                "request_id": request_id,
            })),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            headers,
            Json(json!({
                "error": "internal",
                "message": "engine produced no reply",
                "request_id": request_id,
            })),
        )
            .into_response(),
        Ok(Some(Err(err))) => (
            StatusCode::BAD_REQUEST,
            headers,
            Json(json!({
                "error": err.kind,
                "message": err.message,
                "request_id": err.rid,
            })),
        )
            .into_response(),
        Ok(Some(Ok(res))) => {
            // a shaped reply is a single envelope; raw replies keep their list
            let body = if res.data.len() == 1 {
                Value::Object(res.data.into_iter().next().unwrap())
            } else {
                Value::Array(res.data.into_iter().map(Value::Object).collect())
            };
            (StatusCode::OK, headers, Json(body)).into_response()
        }
    }
}

// =============================================================================
// Status
// =============================================================================

#[derive(Serialize)]
pub struct SystemStatus {
    version: &'static str,
    record_key: String,
    records: usize,
    diff_tags: usize,
    uptime_seconds: u64,
    timestamp: String,
}

pub async fn api_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let store = state.engine.store();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        record_key: store.key().to_string(),
        records: store.length().await,
        diff_tags: state.engine.ledger().keys().await.len(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
