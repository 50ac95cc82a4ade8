//! Object storage contract and an in-memory implementation.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;

use crate::{Error, Result};

/// Durable storage for offloaded media.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `object_name` and return its durable URL.
    async fn upload(&self, object_name: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;
}

/// `<base>/<bucket>/<object>`, the public URL shape of an S3-style store.
#[must_use]
pub fn object_url(base_url: &str, bucket: &str, object_name: &str) -> String {
    format!("{}/{bucket}/{object_name}", base_url.trim_end_matches('/'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

pub struct InMemoryObjectStore {
    base_url: String,
    bucket: String,
    objects: Mutex<HashMap<String, StoredObject>>,
    failing: AtomicBool,
}

impl InMemoryObjectStore {
    pub fn new(base_url: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bucket: bucket.into(),
            objects: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every upload fail while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, object_name: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(object_name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn upload(&self, object_name: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::backend(
                format!("upload {object_name}"),
                std::io::Error::other("object store unavailable"),
            ));
        }
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(object_name.to_string(), StoredObject {
                bytes,
                content_type: content_type.to_string(),
            });
        Ok(object_url(&self.base_url, &self.bucket, object_name))
    }
}
