//! Metrics names and recorder setup for teleindex.
//!
//! The ingest crate records through the `metrics` facade; nothing is exported
//! unless a recorder is installed with [`init_metrics`]. With the `prometheus`
//! feature the recorder renders the Prometheus text format.
//!
//! ```rust,ignore
//! use teleindex_metrics::{counter, sync};
//!
//! counter!(sync::MESSAGES_PROCESSED_TOTAL).increment(42);
//! ```

mod definitions;
mod error;
mod recorder;

pub use {
    definitions::*,
    error::{Error, Result},
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
