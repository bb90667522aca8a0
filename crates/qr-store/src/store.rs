//! # Record store
//!
//! In-memory mapping of primary-key → record with secondary reference
//! indexes, taint/delete journals, insertion-order scans, and an optional
//! TTL sweep. All reads return deep copies.
//!
//! Primary keys are normalized to their canonical string form, so a record
//! stored with `{"id": 1}` is addressable as `"1"`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use qr_core::error::ErrorKind;
use qr_core::params::{canonical_string, is_scalar_key, merge_maps, pull_path, Parameter, Parameters, Value};
use qr_core::ResponseError;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record has no '{0}' field")]
    MissingKey(String),
    #[error("record key must be a string or number")]
    InvalidKeyType,
    #[error("no record for key '{0}'")]
    NotFound(String),
    #[error("no reference index built for '{0}'")]
    UnknownRef(String),
    #[error("reference index '{0}' has no entry for '{1}'")]
    NoValue(String, String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingKey(_) => ErrorKind::MissingKey,
            Self::InvalidKeyType => ErrorKind::InvalidKeyType,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::UnknownRef(_) => ErrorKind::UnknownRef,
            Self::NoValue(_, _) => ErrorKind::NoValue,
        }
    }

    /// Attach a correlation id, producing a writable error reply.
    pub fn into_response(self, rid: &str) -> ResponseError {
        ResponseError::new(self.kind(), rid, self.to_string())
    }
}

// =============================================================================
// Store
// =============================================================================

struct Slot {
    record: Parameter,
    /// Activity counter: incremented on get/add/ref access, decremented by
    /// the TTL sweep. A record needs one access per interval to survive.
    hits: u64,
}

#[derive(Default)]
struct Shelf {
    records: HashMap<String, Slot>,
    /// Insertion order, for stable `select` enumeration.
    order: Vec<String>,
    /// field path → value form → primary keys holding that value.
    refs: HashMap<String, HashMap<String, HashSet<String>>>,
    tainted: HashSet<String>,
    deleted: HashSet<String>,
}

pub struct Store {
    key: String,
    inner: RwLock<Shelf>,
}

impl Store {
    /// A store keyed on the given primary-key field.
    pub fn new(key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            inner: RwLock::new(Shelf::default()),
        })
    }

    /// A store whose records decay: a background sweeper wakes every
    /// `max_age` and deletes records that saw no access in the interval.
    pub fn expirable(key: impl Into<String>, max_age: Duration) -> Arc<Self> {
        let store = Self::new(key);

        let weak = Arc::downgrade(&store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(max_age);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else { break };
                store.sweep().await;
            }
        });

        store
    }

    /// The configured primary-key field name.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn key_of(&self, rec: &Parameter) -> Result<String, StoreError> {
        if rec.is_empty() {
            return Err(StoreError::MissingKey(self.key.clone()));
        }
        let value = rec
            .get(&self.key)
            .ok_or_else(|| StoreError::MissingKey(self.key.clone()))?;
        if !is_scalar_key(value) {
            return Err(StoreError::InvalidKeyType);
        }
        Ok(canonical_string(value))
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Insert the record, or merge it into the existing record under the
    /// same key. Marks the record active and tainted.
    pub async fn add(&self, rec: Parameter) -> Result<(), StoreError> {
        let key = self.key_of(&rec)?;
        let mut shelf = self.inner.write().await;
        upsert(&mut shelf, key, rec, true);
        Ok(())
    }

    /// Insert (or merge) the record and index its value at `field` into the
    /// `field` reference index, creating the index if absent.
    pub async fn add_ref(&self, rec: Parameter, field: &str) -> Result<(), StoreError> {
        self.mod_ref_by(rec, field, true).await
    }

    /// Like [`add_ref`](Self::add_ref), with explicit control over whether
    /// the write lands in the taint journal.
    pub async fn mod_ref_by(
        &self,
        rec: Parameter,
        field: &str,
        taint: bool,
    ) -> Result<(), StoreError> {
        let key = self.key_of(&rec)?;
        let mut shelf = self.inner.write().await;
        shelf.refs.entry(field.to_string()).or_default();
        upsert(&mut shelf, key, rec, taint);
        Ok(())
    }

    /// Scan the store once, populating the `field` reference index.
    /// Idempotent: an already-built index is left alone, so duplicate
    /// concurrent builds collapse into one.
    pub async fn build_ref(&self, field: &str) {
        let mut shelf = self.inner.write().await;
        if shelf.refs.contains_key(field) {
            return;
        }

        let mut index: HashMap<String, HashSet<String>> = HashMap::new();
        for (key, slot) in &shelf.records {
            if let Some(value) = pull_path(&slot.record, field) {
                index.entry(canonical_string(&value)).or_default().insert(key.clone());
            }
        }
        shelf.refs.insert(field.to_string(), index);
    }

    /// Remove the record (addressed by its primary key) from the store.
    pub async fn remove(&self, rec: &Parameter) -> Result<(), StoreError> {
        let key = self.key_of(rec)?;
        self.delete(&key).await;
        Ok(())
    }

    /// Remove the record under `key`: out of the map, out of the taint
    /// journal and every reference index, into the delete journal.
    pub async fn delete(&self, key: &str) {
        let mut shelf = self.inner.write().await;
        evict(&mut shelf, key);
    }

    /// Remove the listed fields from the stored record, leaving the record
    /// present. A nested map value recurses; any other value removes the
    /// whole field.
    pub async fn remove_by_key(&self, rec: &Parameter) -> Result<(), StoreError> {
        let key = self.key_of(rec)?;
        let mut shelf = self.inner.write().await;
        let slot = shelf
            .records
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        for (field, value) in rec {
            if field == &self.key {
                continue;
            }
            strip_fields(&mut slot.record, field, value, false);
        }

        shelf.tainted.insert(key.clone());
        reindex(&mut shelf, &key);
        Ok(())
    }

    /// Remove the listed fields, but only where the stored value equals the
    /// supplied value.
    pub async fn remove_by_value(&self, rec: &Parameter) -> Result<(), StoreError> {
        let key = self.key_of(rec)?;
        let mut shelf = self.inner.write().await;
        let slot = shelf
            .records
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        for (field, value) in rec {
            if field == &self.key {
                continue;
            }
            strip_fields(&mut slot.record, field, value, true);
        }

        shelf.tainted.insert(key.clone());
        reindex(&mut shelf, &key);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// A deep copy of the record under `key`. Refreshes its activity counter.
    pub async fn get(&self, key: &str) -> Result<Parameter, StoreError> {
        let mut shelf = self.inner.write().await;
        let slot = shelf
            .records
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        slot.hits += 1;
        Ok(slot.record.clone())
    }

    /// Deep copies of all records whose value at `field` equals `value`,
    /// looked up through the `field` reference index.
    pub async fn get_by_ref(&self, field: &str, value: &str) -> Result<Parameters, StoreError> {
        let mut shelf = self.inner.write().await;
        let keys: Vec<String> = {
            let index = shelf
                .refs
                .get(field)
                .ok_or_else(|| StoreError::UnknownRef(field.to_string()))?;
            let members = index
                .get(value)
                .filter(|m| !m.is_empty())
                .ok_or_else(|| StoreError::NoValue(field.to_string(), value.to_string()))?;
            members.iter().cloned().collect()
        };

        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(slot) = shelf.records.get_mut(&key) {
                slot.hits += 1;
                found.push(slot.record.clone());
            }
        }
        Ok(found)
    }

    /// Up to `amount` record copies in insertion order, starting after
    /// `skip`. `amount = -1` means all.
    pub async fn select(&self, amount: i64, skip: usize) -> Parameters {
        let shelf = self.inner.read().await;
        let take = if amount < 0 { usize::MAX } else { amount as usize };
        shelf
            .order
            .iter()
            .skip(skip)
            .take(take)
            .filter_map(|key| shelf.records.get(key).map(|slot| slot.record.clone()))
            .collect()
    }

    pub async fn length(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn has(&self, key: &str) -> bool {
        self.inner.read().await.records.contains_key(key)
    }

    pub async fn has_record(&self, rec: &Parameter) -> bool {
        match self.key_of(rec) {
            Ok(key) => self.has(&key).await,
            Err(_) => false,
        }
    }

    // -------------------------------------------------------------------------
    // Journals
    // -------------------------------------------------------------------------

    /// Snapshot of the taint journal, sorted for stable iteration.
    pub async fn tainted_records(&self) -> Vec<String> {
        let shelf = self.inner.read().await;
        let mut keys: Vec<String> = shelf.tainted.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshot of the delete journal, sorted for stable iteration.
    pub async fn deleted_records(&self) -> Vec<String> {
        let shelf = self.inner.read().await;
        let mut keys: Vec<String> = shelf.deleted.iter().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn clear_tainted(&self) {
        self.inner.write().await.tainted.clear();
    }

    pub async fn clear_deleted(&self) {
        self.inner.write().await.deleted.clear();
    }

    // -------------------------------------------------------------------------
    // TTL sweep
    // -------------------------------------------------------------------------

    async fn sweep(&self) {
        let mut shelf = self.inner.write().await;

        let doomed: Vec<String> = shelf
            .records
            .iter()
            .filter(|(_, slot)| slot.hits <= 1)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            evict(&mut shelf, key);
        }
        for slot in shelf.records.values_mut() {
            slot.hits -= 1;
        }

        if !doomed.is_empty() {
            tracing::debug!(swept = doomed.len(), "store sweep evicted idle records");
        }
    }
}

// =============================================================================
// Locked helpers
// =============================================================================

fn upsert(shelf: &mut Shelf, key: String, rec: Parameter, taint: bool) {
    match shelf.records.get_mut(&key) {
        Some(slot) => {
            merge_maps(&mut slot.record, &rec);
            slot.hits += 1;
        }
        None => {
            shelf.records.insert(key.clone(), Slot { record: rec, hits: 1 });
            shelf.order.push(key.clone());
        }
    }

    if taint {
        shelf.tainted.insert(key.clone());
    }
    reindex(shelf, &key);
}

/// Re-derive every built reference index's view of one record: drop stale
/// memberships, insert the current value.
fn reindex(shelf: &mut Shelf, key: &str) {
    let Shelf { records, refs, .. } = shelf;
    let Some(slot) = records.get(key) else { return };

    for (field, index) in refs.iter_mut() {
        for members in index.values_mut() {
            members.remove(key);
        }
        if let Some(value) = pull_path(&slot.record, field) {
            index
                .entry(canonical_string(&value))
                .or_default()
                .insert(key.to_string());
        }
        index.retain(|_, members| !members.is_empty());
    }
}

fn evict(shelf: &mut Shelf, key: &str) {
    if shelf.records.remove(key).is_none() {
        return;
    }
    shelf.order.retain(|k| k != key);
    shelf.tainted.remove(key);
    shelf.deleted.insert(key.to_string());

    for index in shelf.refs.values_mut() {
        for members in index.values_mut() {
            members.remove(key);
        }
        index.retain(|_, members| !members.is_empty());
    }
}

/// Remove `field` from the record. A nested-map value recurses into the
/// stored map; otherwise the whole field goes. With `match_value`, a leaf is
/// only removed when the stored value equals the supplied one.
fn strip_fields(record: &mut Parameter, field: &str, value: &Value, match_value: bool) {
    match (record.get_mut(field), value) {
        (Some(Value::Object(stored)), Value::Object(nested)) => {
            for (inner_field, inner_value) in nested {
                strip_fields(stored, inner_field, inner_value, match_value);
            }
        }
        (Some(stored), supplied) => {
            if !match_value || stored == supplied {
                record.remove(field);
            }
        }
        (None, _) => {}
    }
}
