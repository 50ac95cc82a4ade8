//! Progress snapshots and the sinks that receive them.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub current: usize,
    pub total: usize,
    pub status: String,
    /// `floor(current / total * 100)`, clamped to `[0, 100]`; 0 when `total` is 0.
    pub percentage: u8,
}

impl SyncProgress {
    #[must_use]
    pub fn new(current: usize, total: usize, status: impl Into<String>) -> Self {
        Self {
            current,
            total,
            status: status.into(),
            percentage: percentage(current, total),
        }
    }
}

#[must_use]
pub fn percentage(current: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (current as u128 * 100) / total as u128;
    pct.min(100) as u8
}

/// Receives progress updates. Implementations must be cheap and non-blocking.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: SyncProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(SyncProgress) + Send + Sync,
{
    fn report(&self, progress: SyncProgress) {
        self(progress);
    }
}

/// Discards every update.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: SyncProgress) {}
}

/// Keeps every update, in order.
#[derive(Default)]
pub struct ProgressLog {
    entries: Mutex<Vec<SyncProgress>>,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<SyncProgress> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<SyncProgress> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }
}

impl ProgressSink for ProgressLog {
    fn report(&self, progress: SyncProgress) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(progress);
    }
}
