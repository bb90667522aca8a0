//! # Routed documents
//!
//! A [`Document`] assembles one routed sub-path: a stream pool wired with
//! the four stage processors over a shared record store and a backing
//! [`DocumentSource`]. The router hands it generated requests; the pool
//! enforces the pipeline contract.

pub mod source;
pub mod stages;

use std::sync::Arc;
use std::time::Duration;

use qr_streams::{PoolBuilder, PoolConfig, StreamPool};

use qr_core::{RecordRequest, Request, ResponseWriter};
use qr_store::Store;

use crate::router::DocumentHandler;
use source::DocumentSource;
use stages::{CollectsStage, FindNStage, FindStage, MutateStage};

/// Everything a document needs to come up.
pub struct DocumentConfig {
    pub store: Arc<Store>,
    pub source: Arc<dyn DocumentSource>,
    /// Worker tasks per pool stage.
    pub workers: usize,
    /// Default wait budget per request.
    pub wait: Duration,
}

pub struct Document {
    pool: Arc<StreamPool>,
}

impl Document {
    pub fn new(config: DocumentConfig) -> Arc<Self> {
        let pool = PoolBuilder::new(PoolConfig {
            workers: config.workers,
            wait: config.wait,
        })
        .stage(FindStage {
            store: config.store.clone(),
            source: config.source.clone(),
        })
        .stage(FindNStage {
            store: config.store.clone(),
            source: config.source.clone(),
        })
        .stage(CollectsStage)
        .stage(MutateStage {
            store: config.store,
            source: config.source,
        })
        .build();

        Arc::new(Self { pool })
    }
}

#[async_trait::async_trait]
impl DocumentHandler for Document {
    async fn handle(&self, requests: Vec<RecordRequest>, writer: Arc<dyn ResponseWriter>) {
        let requests = requests.into_iter().map(Request::new).collect();
        self.pool.handle(requests, writer).await;
    }
}
