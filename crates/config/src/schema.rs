//! Config schema types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeleindexConfig {
    pub index: IndexConfig,
    pub storage: StorageConfig,
    pub listener: ListenerConfig,
    pub backfill: BackfillConfig,
    pub sync: SyncConfig,
    pub database: DatabaseConfig,
    pub metrics: MetricsConfig,
}

/// Search index naming and bulk sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Index holding one document per message.
    pub messages: String,
    /// Index holding the channel catalogue.
    pub channels: String,
    /// Documents per bulk request.
    pub bulk_chunk_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            messages: "messages".into(),
            channels: "channels".into(),
            bulk_chunk_size: 500,
        }
    }
}

/// Object storage for offloaded media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: String,
    /// Base of durable URLs, e.g. `http://localhost:9000`.
    pub public_base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "telegram-images".into(),
            public_base_url: "http://localhost:9000".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// How often the loop re-reads the persisted status for external stops.
    pub poll_interval_ms: u64,
    /// Upper bound on concurrently running message jobs.
    pub max_in_flight: usize,
    pub download_images: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_in_flight: 16,
            download_images: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub page_size: usize,
    pub page_delay_ms: u64,
    pub window_page_delay_ms: u64,
    /// Concurrent normalizations inside one page.
    pub media_parallelism: usize,
    pub max_batch_size: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            page_delay_ms: 100,
            window_page_delay_ms: 200,
            media_parallelism: 4,
            max_batch_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub default_max_parallel: usize,
    pub max_parallel_limit: usize,
    /// Seconds a finished task stays pollable.
    pub task_retention_secs: u64,
    /// Finished tasks kept regardless of age; older ones are evicted first.
    pub max_finished_tasks: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_max_parallel: 5,
            max_parallel_limit: 20,
            task_retention_secs: 3600,
            max_finished_tasks: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Status store connection URL.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://teleindex.db?mode=rwc".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled.
    pub enabled: bool,
    /// Additional labels to add to all metrics.
    pub labels: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            labels: BTreeMap::new(),
        }
    }
}
