//! # Document sources
//!
//! The backing-store seam. The gateway only ever talks to a
//! [`DocumentSource`]; the stock [`MemorySource`] keeps named collections
//! in process, which is all the hub needs to run standalone (and all the
//! tests need to run hermetically).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use qr_core::params::{canonical_string, pull_path, Parameter, Parameters};

/// A backing document store, addressed by collection name.
#[async_trait::async_trait]
pub trait DocumentSource: Send + Sync {
    /// All records in `doc` whose value at `key` matches `value` untyped.
    async fn find_by(&self, doc: &str, key: &str, value: &str) -> Result<Parameters, String>;

    /// Number of records in `doc`.
    async fn count(&self, doc: &str) -> Result<usize, String>;

    /// Up to `amount` records from `doc` after skipping `skip`;
    /// `amount = -1` means all.
    async fn fetch(&self, doc: &str, amount: i64, skip: usize) -> Result<Parameters, String>;

    /// Insert or replace the record matching it on the `key` field.
    async fn upsert(&self, doc: &str, key: &str, record: Parameter) -> Result<(), String>;
}

// =============================================================================
// In-memory source
// =============================================================================

/// Named in-process collections. An unknown collection reads as empty and
/// is created on first upsert.
pub struct MemorySource {
    collections: RwLock<HashMap<String, Parameters>>,
}

impl MemorySource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            collections: RwLock::new(HashMap::new()),
        })
    }

    /// Replace the contents of a collection.
    pub async fn seed(&self, doc: &str, records: Parameters) {
        let mut collections = self.collections.write().await;
        collections.insert(doc.to_string(), records);
    }

    pub async fn collection_names(&self) -> Vec<String> {
        let collections = self.collections.read().await;
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait::async_trait]
impl DocumentSource for MemorySource {
    async fn find_by(&self, doc: &str, key: &str, value: &str) -> Result<Parameters, String> {
        let collections = self.collections.read().await;
        let Some(records) = collections.get(doc) else {
            return Ok(Vec::new());
        };

        Ok(records
            .iter()
            .filter(|rec| {
                pull_path(rec, key)
                    .map(|v| canonical_string(&v) == value)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn count(&self, doc: &str) -> Result<usize, String> {
        let collections = self.collections.read().await;
        Ok(collections.get(doc).map(|records| records.len()).unwrap_or(0))
    }

    async fn fetch(&self, doc: &str, amount: i64, skip: usize) -> Result<Parameters, String> {
        let collections = self.collections.read().await;
        let Some(records) = collections.get(doc) else {
            return Ok(Vec::new());
        };

        let take = if amount < 0 { usize::MAX } else { amount as usize };
        Ok(records.iter().skip(skip).take(take).cloned().collect())
    }

    async fn upsert(&self, doc: &str, key: &str, record: Parameter) -> Result<(), String> {
        let target = record
            .get(key)
            .map(canonical_string)
            .ok_or_else(|| format!("record has no '{key}' field"))?;

        let mut collections = self.collections.write().await;
        let records = collections.entry(doc.to_string()).or_default();

        match records.iter_mut().find(|rec| {
            rec.get(key)
                .map(|v| canonical_string(v) == target)
                .unwrap_or(false)
        }) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }
}
