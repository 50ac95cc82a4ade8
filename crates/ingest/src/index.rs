//! Search index contract.

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use crate::Result;

/// Exact-match filter on a top-level document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermFilter {
    pub field: String,
    pub value: Value,
}

impl TermFilter {
    #[must_use]
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// All filters must match.
    pub filter: Vec<TermFilter>,
    pub sort: Option<SortSpec>,
    pub from: usize,
    pub size: usize,
}

impl SearchRequest {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            filter: Vec::new(),
            sort: None,
            from: 0,
            size,
        }
    }

    #[must_use]
    pub fn term(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.push(TermFilter::new(field, value));
        self
    }

    #[must_use]
    pub fn sort_desc(mut self, field: impl Into<String>) -> Self {
        self.sort = Some(SortSpec {
            field: field.into(),
            descending: true,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub id: String,
    pub source: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchHits {
    pub hits: Vec<Hit>,
    pub total: u64,
}

/// Per-request bulk result. Partial failure is reported, not raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub success: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for BulkOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.success += rhs.success;
        self.failed += rhs.failed;
    }
}

/// Search index backend. Upserts are keyed by document id and idempotent.
#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn bulk_upsert(&self, index: &str, docs: Vec<(String, Value)>) -> Result<BulkOutcome>;
    async fn search(&self, index: &str, request: SearchRequest) -> Result<SearchHits>;
    async fn count(&self, index: &str, filter: Vec<TermFilter>) -> Result<u64>;
}
