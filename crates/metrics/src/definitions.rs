//! Metric name and label definitions.
//!
//! Every metric recorded by the ingest engine is named here so dashboards
//! have one place to look.

/// Live listener metrics
pub mod listener {
    /// Push events received from the platform
    pub const EVENTS_RECEIVED_TOTAL: &str = "teleindex_listener_events_received_total";
    /// Events dropped by the media policy filter
    pub const EVENTS_FILTERED_TOTAL: &str = "teleindex_listener_events_filtered_total";
    /// Processing jobs dispatched
    pub const JOBS_DISPATCHED_TOTAL: &str = "teleindex_listener_jobs_dispatched_total";
    /// Processing jobs currently running
    pub const JOBS_IN_FLIGHT: &str = "teleindex_listener_jobs_in_flight";
    /// Listener loop starts (including resumes)
    pub const STARTS_TOTAL: &str = "teleindex_listener_starts_total";
    /// Listener loops that ended with an error
    pub const FAILURES_TOTAL: &str = "teleindex_listener_failures_total";
    /// Channels currently monitored
    pub const MONITORED_CHANNELS: &str = "teleindex_listener_monitored_channels";
}

/// Reconciliation and backfill metrics
pub mod sync {
    /// Per-channel reconciliations, labelled by action
    pub const RECONCILIATIONS_TOTAL: &str = "teleindex_sync_reconciliations_total";
    /// Messages normalized and retained by backfill
    pub const MESSAGES_PROCESSED_TOTAL: &str = "teleindex_sync_messages_processed_total";
    /// Messages skipped because normalization failed
    pub const MESSAGES_FAILED_TOTAL: &str = "teleindex_sync_messages_failed_total";
    /// Platform pages fetched
    pub const PAGES_FETCHED_TOTAL: &str = "teleindex_sync_pages_fetched_total";
    /// Duration of a single channel backfill in seconds
    pub const BACKFILL_DURATION_SECONDS: &str = "teleindex_sync_backfill_duration_seconds";
}

/// Search index metrics
pub mod index {
    /// Documents upserted successfully
    pub const DOCUMENTS_UPSERTED_TOTAL: &str = "teleindex_index_documents_upserted_total";
    /// Documents rejected by the index
    pub const DOCUMENTS_FAILED_TOTAL: &str = "teleindex_index_documents_failed_total";
    /// Bulk request duration in seconds
    pub const BULK_DURATION_SECONDS: &str = "teleindex_index_bulk_duration_seconds";
}

/// Media offload metrics
pub mod media {
    /// Media objects uploaded to object storage
    pub const UPLOADS_TOTAL: &str = "teleindex_media_uploads_total";
    /// Media download or upload failures
    pub const FAILURES_TOTAL: &str = "teleindex_media_failures_total";
    /// Bytes uploaded to object storage
    pub const BYTES_TOTAL: &str = "teleindex_media_bytes_total";
}

/// Common label keys
pub mod labels {
    pub const ACTION: &str = "action";
}

/// Histogram buckets
pub mod buckets {
    /// Bulk index requests, 5ms to 60s
    pub const BULK_DURATION: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    /// Whole-channel backfills, 100ms to 1h
    pub const BACKFILL_DURATION: &[f64] = &[
        0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0,
    ];
}
