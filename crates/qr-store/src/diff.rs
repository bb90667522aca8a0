//! # Diff ledger
//!
//! Append-only sequence of tag-stamped record-key change-sets. Tags are
//! opaque; ordering is the insertion index. The expirable variant marks
//! over-age entries expired on the next read and prunes them physically on
//! the next append.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub tag: String,
    pub keys: Vec<String>,
    inserted_at: Instant,
    expired: bool,
}

pub struct DiffLedger {
    max_age: Option<Duration>,
    inner: RwLock<Vec<DiffEntry>>,
}

impl DiffLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            max_age: None,
            inner: RwLock::new(Vec::new()),
        })
    }

    /// A ledger whose entries expire once older than `max_age`.
    pub fn expirable(max_age: Duration) -> Arc<Self> {
        Arc::new(Self {
            max_age: Some(max_age),
            inner: RwLock::new(Vec::new()),
        })
    }

    fn mark_expired(&self, entries: &mut [DiffEntry]) {
        if let Some(max_age) = self.max_age {
            for entry in entries.iter_mut() {
                if !entry.expired && entry.inserted_at.elapsed() >= max_age {
                    entry.expired = true;
                }
            }
        }
    }

    /// Append a change-set, returning its fresh tag. An empty input still
    /// yields a tag but stores nothing.
    pub async fn put(&self, keys: Vec<String>) -> String {
        let tag = uuid::Uuid::new_v4().as_simple().to_string();

        let mut entries = self.inner.write().await;
        self.mark_expired(&mut entries);
        entries.retain(|entry| !entry.expired);

        if keys.is_empty() {
            return tag;
        }

        entries.push(DiffEntry {
            tag: tag.clone(),
            keys,
            inserted_at: Instant::now(),
            expired: false,
        });
        tag
    }

    pub async fn has(&self, tag: &str) -> bool {
        let mut entries = self.inner.write().await;
        self.mark_expired(&mut entries);
        entries.iter().any(|entry| !entry.expired && entry.tag == tag)
    }

    /// The keys of the single entry under `tag`, or empty.
    pub async fn get(&self, tag: &str) -> Vec<String> {
        let mut entries = self.inner.write().await;
        self.mark_expired(&mut entries);
        entries
            .iter()
            .find(|entry| !entry.expired && entry.tag == tag)
            .map(|entry| entry.keys.clone())
            .unwrap_or_default()
    }

    /// The deduplicated union of every entry strictly after `tag`. An
    /// unknown (or expired) tag yields empty.
    pub async fn pull_from(&self, tag: &str) -> Vec<String> {
        let mut entries = self.inner.write().await;
        self.mark_expired(&mut entries);

        let Some(position) = entries
            .iter()
            .position(|entry| !entry.expired && entry.tag == tag)
        else {
            return Vec::new();
        };

        let mut seen = std::collections::HashSet::new();
        let mut keys = Vec::new();
        for entry in entries.iter().skip(position + 1).filter(|e| !e.expired) {
            for key in &entry.keys {
                if seen.insert(key.clone()) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }

    /// For each input key: does it appear anywhere in the (unexpired) ledger?
    pub async fn analyze(&self, keys: &[String]) -> HashMap<String, bool> {
        let mut entries = self.inner.write().await;
        self.mark_expired(&mut entries);

        keys.iter()
            .map(|key| {
                let changed = entries
                    .iter()
                    .any(|entry| !entry.expired && entry.keys.contains(key));
                (key.clone(), changed)
            })
            .collect()
    }

    /// Like [`analyze`](Self::analyze), limited to entries strictly after
    /// `tag`. An unknown tag reports every key unchanged.
    pub async fn analyze_with(&self, tag: &str, keys: &[String]) -> HashMap<String, bool> {
        let mut entries = self.inner.write().await;
        self.mark_expired(&mut entries);

        let position = entries
            .iter()
            .position(|entry| !entry.expired && entry.tag == tag);

        keys.iter()
            .map(|key| {
                let changed = position.is_some_and(|pos| {
                    entries
                        .iter()
                        .skip(pos + 1)
                        .any(|entry| !entry.expired && entry.keys.contains(key))
                });
                (key.clone(), changed)
            })
            .collect()
    }

    /// The ordered list of live tags.
    pub async fn keys(&self) -> Vec<String> {
        let mut entries = self.inner.write().await;
        self.mark_expired(&mut entries);
        entries
            .iter()
            .filter(|entry| !entry.expired)
            .map(|entry| entry.tag.clone())
            .collect()
    }

    /// Every record key across all live entries, duplicates included.
    pub async fn diffs(&self) -> Vec<String> {
        let mut entries = self.inner.write().await;
        self.mark_expired(&mut entries);
        entries
            .iter()
            .filter(|entry| !entry.expired)
            .flat_map(|entry| entry.keys.iter().cloned())
            .collect()
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let ledger = DiffLedger::new();
        let tag = ledger.put(keys(&["1", "2", "3"])).await;

        assert!(ledger.has(&tag).await);
        assert_eq!(ledger.get(&tag).await, keys(&["1", "2", "3"]));
        assert!(ledger.get("unknown").await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_put_returns_tag_without_storing() {
        let ledger = DiffLedger::new();
        let tag = ledger.put(Vec::new()).await;
        assert!(!ledger.has(&tag).await);
        assert!(ledger.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_tags_are_ordered_by_insertion() {
        let ledger = DiffLedger::new();
        let t1 = ledger.put(keys(&["1"])).await;
        let t2 = ledger.put(keys(&["2"])).await;
        let t3 = ledger.put(keys(&["3"])).await;

        assert_eq!(ledger.keys().await, vec![t1, t2, t3]);
    }

    #[tokio::test]
    async fn test_pull_from_unions_later_entries() {
        let ledger = DiffLedger::new();
        let t1 = ledger.put(keys(&["1", "2", "3"])).await;
        ledger.put(keys(&["1", "12", "31"])).await;

        let pulled = ledger.pull_from(&t1).await;
        assert_eq!(pulled, keys(&["1", "12", "31"]));
        assert!(ledger.pull_from("unknown").await.is_empty());
    }

    #[tokio::test]
    async fn test_pull_from_equals_union_of_later_gets() {
        let ledger = DiffLedger::new();
        let mut tags = Vec::new();
        tags.push(ledger.put(keys(&["a", "b"])).await);
        tags.push(ledger.put(keys(&["b", "c"])).await);
        tags.push(ledger.put(keys(&["d"])).await);

        let pulled = ledger.pull_from(&tags[0]).await;

        let mut union = Vec::new();
        for tag in &tags[1..] {
            for key in ledger.get(tag).await {
                if !union.contains(&key) {
                    union.push(key);
                }
            }
        }
        assert_eq!(pulled, union);
    }

    #[tokio::test]
    async fn test_analyze_whole_ledger() {
        let ledger = DiffLedger::new();
        ledger.put(keys(&["1", "2", "3"])).await;
        ledger.put(keys(&["1", "12", "31"])).await;

        let changes = ledger.analyze(&keys(&["12", "31", "99"])).await;
        assert!(changes["12"]);
        assert!(changes["31"]);
        assert!(!changes["99"]);
    }

    #[tokio::test]
    async fn test_analyze_with_scopes_to_later_entries() {
        let ledger = DiffLedger::new();
        let t1 = ledger.put(keys(&["1", "2", "3"])).await;
        ledger.put(keys(&["1", "12", "31"])).await;

        let changes = ledger.analyze_with(&t1, &keys(&["1", "2", "99"])).await;
        assert!(changes["1"]);
        assert!(!changes["2"]); // only in the entry at t1 itself
        assert!(!changes["99"]);
    }

    #[tokio::test]
    async fn test_diffs_flattens_with_duplicates() {
        let ledger = DiffLedger::new();
        ledger.put(keys(&["1", "2", "3"])).await;
        ledger.put(keys(&["1", "12", "31"])).await;

        assert_eq!(ledger.diffs().await.len(), 6);

        ledger.clear().await;
        assert!(ledger.diffs().await.is_empty());
    }

    #[tokio::test]
    async fn test_expirable_entries_vanish() {
        let ledger = DiffLedger::expirable(Duration::from_millis(40));
        let t1 = ledger.put(keys(&["1"])).await;
        assert!(ledger.has(&t1).await);

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(!ledger.has(&t1).await);
        assert!(ledger.keys().await.is_empty());
        assert!(ledger.pull_from(&t1).await.is_empty());
    }
}
