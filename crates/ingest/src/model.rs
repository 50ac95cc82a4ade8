//! Canonical records, listener status and sync reports.

use std::collections::BTreeMap;

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

/// A channel in the `channels` index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: i64,
    pub title: String,
    pub username: Option<String>,
    /// Best effort: the platform's latest message id.
    pub message_count: i64,
}

impl ChannelRecord {
    #[must_use]
    pub fn doc_id(&self) -> String {
        self.id.to_string()
    }
}

/// A message in the `messages` index, identified by `(channel_id, message_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub channel_id: i64,
    pub message_id: i64,
    pub sender_name: String,
    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,
    pub text: String,
    /// Durable URLs or platform-native markers.
    #[serde(rename = "image_urls", default)]
    pub media_references: Vec<String>,
    /// Object names in storage, only set when media was offloaded.
    #[serde(rename = "images", default)]
    pub object_paths: Vec<String>,
    pub indexed_at: DateTime<Utc>,
}

impl MessageRecord {
    #[must_use]
    pub fn doc_id(&self) -> String {
        message_doc_id(self.channel_id, self.message_id)
    }
}

#[must_use]
pub fn message_doc_id(channel_id: i64, message_id: i64) -> String {
    format!("{channel_id}_{message_id}")
}

/// Whether media is fetched into object storage or only referenced by marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaPolicy {
    Offload,
    Markers,
}

impl MediaPolicy {
    #[must_use]
    pub fn from_download_images(download_images: bool) -> Self {
        if download_images {
            Self::Offload
        } else {
            Self::Markers
        }
    }

    #[must_use]
    pub fn offloads(self) -> bool {
        self == Self::Offload
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerPhase {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Persisted listener run state. One instance per deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerStatus {
    pub is_running: bool,
    pub phase: ListenerPhase,
    pub download_images: bool,
    pub monitored_channels: usize,
    pub channels: Vec<i64>,
    pub task_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Default for ListenerStatus {
    fn default() -> Self {
        Self {
            is_running: false,
            phase: ListenerPhase::Stopped,
            download_images: true,
            monitored_channels: 0,
            channels: Vec::new(),
            task_id: None,
            started_at: None,
            stopped_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    NotRunning,
    Stopping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerStats {
    pub status: ListenerStatus,
    pub monitored: Vec<i64>,
}

/// Indexed totals for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub channel_id: i64,
    pub total_messages: u64,
    pub last_message_id: Option<i64>,
    pub has_data: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Skip,
    FullSync,
    IncrementalSync,
    Error,
}

impl SyncAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::FullSync => "full_sync",
            Self::IncrementalSync => "incremental_sync",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters produced by one backfill run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub messages_processed: usize,
    pub messages_failed: usize,
    pub images_downloaded: usize,
    pub images_failed: usize,
    pub index_success: usize,
    pub index_failed: usize,
}

/// Result of reconciling one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub channel_id: i64,
    pub action: SyncAction,
    pub reason: String,
    pub success: bool,
    #[serde(flatten)]
    pub report: BackfillReport,
}

impl SyncOutcome {
    #[must_use]
    pub fn new(channel_id: i64, action: SyncAction, reason: impl Into<String>, success: bool) -> Self {
        Self {
            channel_id,
            action,
            reason: reason.into(),
            success,
            report: BackfillReport::default(),
        }
    }

    #[must_use]
    pub fn with_report(mut self, report: BackfillReport) -> Self {
        self.report = report;
        self
    }
}

/// Aggregate over a multi-channel reconciliation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSummary {
    pub success: bool,
    pub message: String,
    pub channels_processed: usize,
    pub channels_successful: usize,
    pub channels_failed: usize,
    pub total_messages_processed: usize,
    pub total_images_downloaded: usize,
    pub actions_summary: BTreeMap<SyncAction, usize>,
    pub results: Vec<SyncOutcome>,
    pub cancelled: bool,
}

impl SyncSummary {
    #[must_use]
    pub fn empty(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Self::default()
        }
    }

    /// Fold outcomes into totals.
    #[must_use]
    pub fn from_outcomes(results: Vec<SyncOutcome>, cancelled: bool) -> Self {
        let mut summary = Self {
            success: true,
            cancelled,
            channels_processed: results.len(),
            ..Self::default()
        };
        for outcome in &results {
            if outcome.success {
                summary.channels_successful += 1;
            } else {
                summary.channels_failed += 1;
            }
            summary.total_messages_processed += outcome.report.messages_processed;
            summary.total_images_downloaded += outcome.report.images_downloaded;
            *summary.actions_summary.entry(outcome.action).or_default() += 1;
        }
        summary.message = format!(
            "processed {} channels: {} successful, {} failed",
            summary.channels_processed, summary.channels_successful, summary.channels_failed
        );
        summary.results = results;
        summary
    }
}
