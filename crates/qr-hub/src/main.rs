//! # qr-hub — The QUARRY gateway service
//!
//! Boots the record store, diff ledger, and engine; registers the
//! configured document routes over an in-memory source; and serves the
//! query endpoint.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qr_core::params::Parameters;
use qr_store::{DiffLedger, Store};

mod api;
mod docs;
mod engine;
mod generator;
mod parser;
mod router;
mod writers;

use docs::source::MemorySource;
use docs::{Document, DocumentConfig};
use engine::Engine;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "qr-hub", version, about = "QUARRY query-composition gateway")]
struct Args {
    /// Server bind address
    #[arg(long, default_value = "127.0.0.1:3300")]
    bind: String,

    /// Path to config file
    #[arg(long, default_value = "qr-hub.toml")]
    config: PathBuf,

    /// JSON seed file: an object mapping document names to record arrays
    #[arg(long)]
    seed: Option<PathBuf>,
}

// =============================================================================
// Config
// =============================================================================

#[derive(Deserialize, Default, Clone)]
struct Config {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    streams: StreamConfig,
    #[serde(default)]
    docs: DocsConfig,
}

#[derive(Deserialize, Clone)]
struct ServerConfig {
    #[serde(default = "default_reply_timeout")]
    reply_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            reply_timeout_secs: default_reply_timeout(),
        }
    }
}

#[derive(Deserialize, Clone)]
struct StoreConfig {
    #[serde(default = "default_record_key")]
    record_key: String,
    /// Record TTL; unset keeps records until deleted.
    ttl_secs: Option<u64>,
    /// Diff entry age limit; unset keeps the ledger forever.
    diff_max_age_secs: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            record_key: default_record_key(),
            ttl_secs: None,
            diff_max_age_secs: None,
        }
    }
}

#[derive(Deserialize, Clone)]
struct StreamConfig {
    #[serde(default = "default_workers")]
    workers: usize,
    #[serde(default = "default_wait")]
    wait_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            wait_secs: default_wait(),
        }
    }
}

#[derive(Deserialize, Clone)]
struct DocsConfig {
    #[serde(default = "default_root")]
    root: String,
    #[serde(default = "default_documents")]
    documents: Vec<String>,
}

impl Default for DocsConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            documents: default_documents(),
        }
    }
}

fn default_reply_timeout() -> u64 {
    150
}
fn default_record_key() -> String {
    "id".into()
}
fn default_workers() -> usize {
    8
}
fn default_wait() -> u64 {
    120
}
fn default_root() -> String {
    "docs".into()
}
fn default_documents() -> Vec<String> {
    vec!["users".into()]
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "qr_hub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config: Config = if args.config.exists() {
        let content = std::fs::read_to_string(&args.config).unwrap_or_default();
        toml::from_str(&content).unwrap_or_default()
    } else {
        Config::default()
    };

    let store = match config.store.ttl_secs {
        Some(secs) => Store::expirable(&config.store.record_key, Duration::from_secs(secs)),
        None => Store::new(&config.store.record_key),
    };
    let ledger = match config.store.diff_max_age_secs {
        Some(secs) => DiffLedger::expirable(Duration::from_secs(secs)),
        None => DiffLedger::new(),
    };

    let source = MemorySource::new();
    let mut documents = config.docs.documents.clone();

    if let Some(path) = &args.seed {
        match load_seed(path) {
            Ok(collections) => {
                for (doc, records) in collections {
                    tracing::info!(doc = doc.as_str(), records = records.len(), "seeded document");
                    if !documents.contains(&doc) {
                        documents.push(doc.clone());
                    }
                    source.seed(&doc, records).await;
                }
            }
            Err(reason) => {
                tracing::error!("failed to load seed file {:?}: {reason}", path);
                std::process::exit(1);
            }
        }
    }

    let engine = Engine::new(store.clone(), ledger.clone());
    {
        let route = engine.route(&config.docs.root);
        for doc in &documents {
            route
                .document(
                    doc,
                    generator::basic(),
                    Document::new(DocumentConfig {
                        store: store.clone(),
                        source: source.clone(),
                        workers: config.streams.workers,
                        wait: Duration::from_secs(config.streams.wait_secs),
                    }),
                )
                .await;
        }
    }

    let state = Arc::new(api::AppState {
        engine,
        start_time: Instant::now(),
        reply_timeout: Duration::from_secs(config.server.reply_timeout_secs),
    });

    let app = Router::new()
        .route("/query", post(api::handle_query).get(api::handle_form_query))
        .route("/api/status", get(api::api_status))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = args.bind.parse().expect("invalid bind address");
    tracing::info!("qr-hub v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  query endpoint:  http://{addr}/query");
    tracing::info!("  status:          http://{addr}/api/status");
    tracing::info!(
        "  routes:          {}.{{{}}}",
        config.docs.root,
        documents.join(", ")
    );

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

fn load_seed(path: &PathBuf) -> Result<HashMap<String, Parameters>, String> {
    let content = std::fs::read_to_string(path).map_err(|err| err.to_string())?;
    serde_json::from_str(&content).map_err(|err| err.to_string())
}
