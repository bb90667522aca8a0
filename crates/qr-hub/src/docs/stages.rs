//! # Document stages
//!
//! One pool stage per request variant, each implementing the cache-first
//! read discipline: answer from the record store when it can, fall back to
//! the document source, and feed what the source returned back into the
//! store on the way out.

use std::sync::Arc;

use qr_streams::{Stage, StreamItem};

use qr_core::error::ErrorKind;
use qr_core::params::{merge_maps, place_path, pull_path, Parameter, Parameters};
use qr_core::{RecordRequest, Response, ResponseError};
use qr_store::{Store, StoreError};

use super::source::DocumentSource;

fn source_fault(rid: &str, what: &str, cause: String) -> ResponseError {
    ResponseError::new(ErrorKind::Internal, rid, format!("{what} failed against the backend"))
        .with_cause(cause)
}

// =============================================================================
// find
// =============================================================================

pub struct FindStage {
    pub store: Arc<Store>,
    pub source: Arc<dyn DocumentSource>,
}

#[async_trait::async_trait]
impl Stage for FindStage {
    async fn process(&self, item: StreamItem) -> Result<StreamItem, ResponseError> {
        let req = match item {
            StreamItem::Request(req) => req,
            other => return Ok(other),
        };
        let RecordRequest::Find { doc, rid, key, value } = &req.record else {
            return Ok(StreamItem::Request(req));
        };

        // reference-index hit serves straight from the working set
        match self.store.get_by_ref(key, value).await {
            Ok(records) => {
                tracing::debug!(rid = rid.as_str(), key = key.as_str(), "find served from store");
                return Ok(StreamItem::Response(Response::new("find", rid.clone(), records)));
            }
            Err(StoreError::UnknownRef(_)) | Err(StoreError::NoValue(_, _)) => {}
            Err(err) => return Err(err.into_response(rid)),
        }

        let found = self
            .source
            .find_by(doc, key, value)
            .await
            .map_err(|cause| source_fault(rid, "find", cause))?;

        for record in &found {
            if let Err(err) = self.store.add_ref(record.clone(), key).await {
                tracing::warn!(rid = rid.as_str(), "could not index found record: {err}");
            }
        }

        Ok(StreamItem::Response(Response::new("find", rid.clone(), found)))
    }
}

// =============================================================================
// findN
// =============================================================================

pub struct FindNStage {
    pub store: Arc<Store>,
    pub source: Arc<dyn DocumentSource>,
}

#[async_trait::async_trait]
impl Stage for FindNStage {
    async fn process(&self, item: StreamItem) -> Result<StreamItem, ResponseError> {
        let req = match item {
            StreamItem::Request(req) => req,
            other => return Ok(other),
        };
        let RecordRequest::FindN { doc, rid, amount, skip } = &req.record else {
            return Ok(StreamItem::Request(req));
        };

        let skip = (*skip).max(0) as usize;

        // chained onto a previous stage: window over its reply
        if let Some(last) = &req.last_response {
            let window: Parameters = if skip >= last.data.len() {
                Vec::new()
            } else {
                let tail = &last.data[skip..];
                let take = if *amount < 0 { tail.len() } else { (*amount as usize).min(tail.len()) };
                tail[..take].to_vec()
            };
            return Ok(StreamItem::Response(Response::new("findN", rid.clone(), window)));
        }

        let total = self
            .source
            .count(doc)
            .await
            .map_err(|cause| source_fault(rid, "count", cause))?;
        let amount = if *amount < 0 { total as i64 } else { *amount };

        // working set already covers the window
        if amount as usize + skip <= self.store.length().await {
            let records = self.store.select(amount, skip).await;
            tracing::debug!(rid = rid.as_str(), n = records.len(), "findN served from store");
            return Ok(StreamItem::Response(Response::new("findN", rid.clone(), records)));
        }

        let found = self
            .source
            .fetch(doc, amount, skip)
            .await
            .map_err(|cause| source_fault(rid, "fetch", cause))?;

        for record in &found {
            if let Err(err) = self.store.add(record.clone()).await {
                tracing::warn!(rid = rid.as_str(), "could not cache fetched record: {err}");
            }
        }

        Ok(StreamItem::Response(Response::new("findN", rid.clone(), found)))
    }
}

// =============================================================================
// collects
// =============================================================================

pub struct CollectsStage;

#[async_trait::async_trait]
impl Stage for CollectsStage {
    async fn process(&self, item: StreamItem) -> Result<StreamItem, ResponseError> {
        let req = match item {
            StreamItem::Request(req) => req,
            other => return Ok(other),
        };
        let RecordRequest::Collects { rid, keys } = &req.record else {
            return Ok(StreamItem::Request(req));
        };

        let Some(last) = &req.last_response else {
            return Err(ResponseError::new(
                ErrorKind::NotFound,
                rid,
                "collects requires a previous response",
            ));
        };

        let mut records = Parameters::with_capacity(last.data.len());
        for record in &last.data {
            let mut item = Parameter::new();
            // absent keys are skipped, not errors
            for key in keys {
                if let Some(value) = pull_path(record, key) {
                    place_path(&mut item, key, value);
                }
            }
            records.push(item);
        }

        Ok(StreamItem::Response(Response::new("collects", rid.clone(), records)))
    }
}

// =============================================================================
// mutate
// =============================================================================

pub struct MutateStage {
    pub store: Arc<Store>,
    pub source: Arc<dyn DocumentSource>,
}

#[async_trait::async_trait]
impl Stage for MutateStage {
    async fn process(&self, item: StreamItem) -> Result<StreamItem, ResponseError> {
        let req = match item {
            StreamItem::Request(req) => req,
            other => return Ok(other),
        };
        let RecordRequest::Mutate { doc, rid, parameter } = &req.record else {
            return Ok(StreamItem::Request(req));
        };

        let previous: Parameters = req
            .last_response
            .as_ref()
            .map(|res| res.data.clone())
            .unwrap_or_default();

        // nothing selected: upsert the parameter itself by primary key
        if previous.is_empty() {
            self.store
                .add(parameter.clone())
                .await
                .map_err(|err| err.into_response(rid))?;
            self.persist(doc, rid, parameter.clone()).await;
            return Ok(StreamItem::Response(Response::new(
                "mutate",
                rid.clone(),
                vec![parameter.clone()],
            )));
        }

        let mut mutated = Parameters::with_capacity(previous.len());
        for mut record in previous {
            merge_maps(&mut record, parameter);
            self.store
                .add(record.clone())
                .await
                .map_err(|err| err.into_response(rid))?;
            self.persist(doc, rid, record.clone()).await;
            mutated.push(record);
        }

        Ok(StreamItem::Response(Response::new("mutate", rid.clone(), mutated)))
    }
}

impl MutateStage {
    /// Push a mutated record to the backend. Cache state is already
    /// updated; a backend failure is logged, not fatal.
    async fn persist(&self, doc: &str, rid: &str, record: Parameter) {
        if let Err(cause) = self.source.upsert(doc, self.store.key(), record).await {
            tracing::warn!(rid, doc, "backend upsert failed: {cause}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::source::MemorySource;
    use qr_core::Request;
    use serde_json::json;

    fn record(v: serde_json::Value) -> Parameter {
        v.as_object().unwrap().clone()
    }

    async fn seeded() -> (Arc<Store>, Arc<MemorySource>) {
        let store = Store::new("id");
        let source = MemorySource::new();
        source
            .seed(
                "users",
                vec![
                    record(json!({"id": 1, "name": "Ada", "age": 37})),
                    record(json!({"id": 2, "name": "Grace", "age": 45})),
                ],
            )
            .await;
        (store, source)
    }

    fn find_req(value: &str) -> Request {
        Request::new(RecordRequest::Find {
            doc: "users".into(),
            rid: "R1".into(),
            key: "id".into(),
            value: value.into(),
        })
    }

    fn expect_response(item: StreamItem) -> Response {
        match item {
            StreamItem::Response(res) => res,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_find_falls_back_to_source_then_caches() {
        let (store, source) = seeded().await;
        let stage = FindStage { store: store.clone(), source };

        let res = expect_response(
            stage
                .process(StreamItem::Request(find_req("1")))
                .await
                .unwrap(),
        );
        assert_eq!(res.data.len(), 1);
        assert_eq!(res.data[0].get("name"), Some(&json!("Ada")));

        // the fallback indexed the record, so the store answers now
        assert!(store.get_by_ref("id", "1").await.is_ok());

        let res = expect_response(
            stage
                .process(StreamItem::Request(find_req("1")))
                .await
                .unwrap(),
        );
        assert_eq!(res.data[0].get("name"), Some(&json!("Ada")));
    }

    #[tokio::test]
    async fn test_find_passes_foreign_requests_through() {
        let (store, source) = seeded().await;
        let stage = FindStage { store, source };

        let req = Request::new(RecordRequest::Collects {
            rid: "R1".into(),
            keys: vec!["name".into()],
        });
        match stage.process(StreamItem::Request(req)).await.unwrap() {
            StreamItem::Request(req) => assert_eq!(req.record.name(), "collects"),
            other => panic!("expected a pass-through, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_find_n_fetches_and_caches() {
        let (store, source) = seeded().await;
        let stage = FindNStage { store: store.clone(), source };

        let req = Request::new(RecordRequest::FindN {
            doc: "users".into(),
            rid: "R1".into(),
            amount: -1,
            skip: 0,
        });
        let res = expect_response(stage.process(StreamItem::Request(req)).await.unwrap());
        assert_eq!(res.data.len(), 2);
        assert_eq!(store.length().await, 2);
    }

    #[tokio::test]
    async fn test_find_n_windows_a_previous_reply() {
        let (store, source) = seeded().await;
        let stage = FindNStage { store, source };

        let mut req = Request::new(RecordRequest::FindN {
            doc: "users".into(),
            rid: "R1".into(),
            amount: 1,
            skip: 1,
        });
        req.last_response = Some(Response::new(
            "find",
            "R1",
            vec![
                record(json!({"id": 1})),
                record(json!({"id": 2})),
                record(json!({"id": 3})),
            ],
        ));

        let res = expect_response(stage.process(StreamItem::Request(req)).await.unwrap());
        assert_eq!(res.data.len(), 1);
        assert_eq!(res.data[0].get("id"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_find_n_window_clamps_out_of_range() {
        let (store, source) = seeded().await;
        let stage = FindNStage { store, source };

        let mut req = Request::new(RecordRequest::FindN {
            doc: "users".into(),
            rid: "R1".into(),
            amount: 10,
            skip: 9,
        });
        req.last_response = Some(Response::new("find", "R1", vec![record(json!({"id": 1}))]));

        let res = expect_response(stage.process(StreamItem::Request(req)).await.unwrap());
        assert!(res.data.is_empty());
    }

    #[tokio::test]
    async fn test_collects_projects_dotted_paths() {
        let stage = CollectsStage;
        let mut req = Request::new(RecordRequest::Collects {
            rid: "R1".into(),
            keys: vec!["name".into(), "address.state".into()],
        });
        req.last_response = Some(Response::new(
            "find",
            "R1",
            vec![record(
                json!({"id": 1, "name": "Ada", "age": 37, "address": {"state": "lagos", "country": "NG"}}),
            )],
        ));

        let res = expect_response(stage.process(StreamItem::Request(req)).await.unwrap());
        let item = &res.data[0];
        assert_eq!(item.get("name"), Some(&json!("Ada")));
        assert_eq!(pull_path(item, "address.state"), Some(json!("lagos")));
        assert!(item.get("age").is_none());
        assert_eq!(pull_path(item, "address.country"), None);
    }

    #[tokio::test]
    async fn test_collects_without_previous_response_fails() {
        let stage = CollectsStage;
        let req = Request::new(RecordRequest::Collects {
            rid: "R1".into(),
            keys: vec!["name".into()],
        });

        let err = stage.process(StreamItem::Request(req)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_mutate_merges_and_persists() {
        let (store, source) = seeded().await;
        let stage = MutateStage { store: store.clone(), source: source.clone() };

        let mut req = Request::new(RecordRequest::Mutate {
            doc: "users".into(),
            rid: "R1".into(),
            parameter: record(json!({"name": "alex"})),
        });
        req.last_response = Some(Response::new(
            "find",
            "R1",
            vec![record(json!({"id": 1, "name": "Ada", "age": 37}))],
        ));

        let res = expect_response(stage.process(StreamItem::Request(req)).await.unwrap());
        assert_eq!(res.data[0].get("name"), Some(&json!("alex")));
        assert_eq!(res.data[0].get("age"), Some(&json!(37)));

        // cache and backend both hold the mutation
        assert_eq!(store.get("1").await.unwrap().get("name"), Some(&json!("alex")));
        let hits = source.find_by("users", "id", "1").await.unwrap();
        assert_eq!(hits[0].get("name"), Some(&json!("alex")));
        // and the write is journaled for the diff ledger
        assert_eq!(store.tainted_records().await, vec!["1"]);
    }

    #[tokio::test]
    async fn test_mutate_with_nothing_selected_upserts_parameter() {
        let (store, source) = seeded().await;
        let stage = MutateStage { store: store.clone(), source: source.clone() };

        let req = Request::new(RecordRequest::Mutate {
            doc: "users".into(),
            rid: "R1".into(),
            parameter: record(json!({"id": 9, "name": "new"})),
        });

        let res = expect_response(stage.process(StreamItem::Request(req)).await.unwrap());
        assert_eq!(res.data.len(), 1);
        assert!(store.get("9").await.is_ok());
        assert_eq!(source.find_by("users", "id", "9").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mutate_without_key_fails() {
        let (store, source) = seeded().await;
        let stage = MutateStage { store, source };

        let req = Request::new(RecordRequest::Mutate {
            doc: "users".into(),
            rid: "R1".into(),
            parameter: record(json!({"name": "keyless"})),
        });

        let err = stage.process(StreamItem::Request(req)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingKey);
    }
}
