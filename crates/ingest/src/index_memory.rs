//! In-memory search index for tests and local runs.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering as AtomicOrdering},
    },
};

use {async_trait::async_trait, serde_json::Value};

use crate::{
    Error, Result,
    index::{BulkOutcome, Hit, IndexStore, SearchHits, SearchRequest, TermFilter},
};

/// `BTreeMap` keeps document iteration stable across runs.
#[derive(Default)]
pub struct InMemoryIndex {
    indices: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    rejected: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent call fails with a backend error while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, AtomicOrdering::SeqCst);
    }

    /// Bulk upserts of this document id are counted as failed.
    pub fn reject_document(&self, doc_id: impl Into<String>) {
        self.rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc_id.into());
    }

    pub fn get(&self, index: &str, doc_id: &str) -> Option<Value> {
        let indices = self.indices.lock().unwrap_or_else(|e| e.into_inner());
        indices.get(index).and_then(|docs| docs.get(doc_id)).cloned()
    }

    /// All documents of an index, ordered by id.
    pub fn documents(&self, index: &str) -> Vec<(String, Value)> {
        let indices = self.indices.lock().unwrap_or_else(|e| e.into_inner());
        indices
            .get(index)
            .map(|docs| docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            return Err(Error::backend(
                "in-memory index",
                std::io::Error::other("index unavailable"),
            ));
        }
        Ok(())
    }
}

fn matches(doc: &Value, filter: &[TermFilter]) -> bool {
    filter.iter().all(|f| doc.get(&f.field) == Some(&f.value))
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => x
                    .as_f64()
                    .partial_cmp(&y.as_f64())
                    .unwrap_or(Ordering::Equal),
            }
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl IndexStore for InMemoryIndex {
    async fn bulk_upsert(&self, index: &str, docs: Vec<(String, Value)>) -> Result<BulkOutcome> {
        self.check_available()?;
        let rejected = self.rejected.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut indices = self.indices.lock().unwrap_or_else(|e| e.into_inner());
        let target = indices.entry(index.to_string()).or_default();

        let mut outcome = BulkOutcome::default();
        for (id, doc) in docs {
            if rejected.contains(&id) {
                outcome.failed += 1;
            } else {
                target.insert(id, doc);
                outcome.success += 1;
            }
        }
        Ok(outcome)
    }

    async fn search(&self, index: &str, request: SearchRequest) -> Result<SearchHits> {
        self.check_available()?;
        let indices = self.indices.lock().unwrap_or_else(|e| e.into_inner());
        let Some(docs) = indices.get(index) else {
            return Ok(SearchHits::default());
        };

        let mut hits: Vec<Hit> = docs
            .iter()
            .filter(|(_, doc)| matches(doc, &request.filter))
            .map(|(id, doc)| Hit {
                id: id.clone(),
                source: doc.clone(),
            })
            .collect();
        let total = hits.len() as u64;

        if let Some(sort) = &request.sort {
            hits.sort_by(|a, b| {
                let ord = compare_values(a.source.get(&sort.field), b.source.get(&sort.field));
                if sort.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }

        let hits = hits
            .into_iter()
            .skip(request.from)
            .take(request.size)
            .collect();
        Ok(SearchHits { hits, total })
    }

    async fn count(&self, index: &str, filter: Vec<TermFilter>) -> Result<u64> {
        self.check_available()?;
        let indices = self.indices.lock().unwrap_or_else(|e| e.into_inner());
        Ok(indices
            .get(index)
            .map(|docs| docs.values().filter(|doc| matches(doc, &filter)).count() as u64)
            .unwrap_or(0))
    }
}
