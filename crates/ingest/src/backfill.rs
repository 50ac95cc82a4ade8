//! Paginated historical fetch-and-index.
//!
//! Pages come newest-first. [`BatchSyncEngine::backfill`] walks back until it
//! meets the cutoff id; [`BatchSyncEngine::sync_window`] processes an explicit
//! `offset`/`size` window in flushable chunks.

use std::{sync::Arc, time::Duration};

use {
    serde::{Deserialize, Serialize},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use teleindex_metrics::{counter, histogram, sync as sync_metrics};

use crate::{
    Error, Result,
    model::{BackfillReport, MediaPolicy, MessageRecord},
    normalize::{Normalized, Normalizer, SkipReason},
    platform::{MessagingPlatform, RawMessage},
    progress::{NoProgress, ProgressSink, SyncProgress},
    scheduler::{TaskScheduler, UnitOutcome},
    writer::IndexWriter,
};

#[derive(Debug, Clone)]
pub struct BackfillSettings {
    pub page_size: usize,
    pub page_delay: Duration,
    pub window_page_delay: Duration,
    pub media_parallelism: usize,
    pub max_batch_size: usize,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self::from(&teleindex_config::BackfillConfig::default())
    }
}

impl From<&teleindex_config::BackfillConfig> for BackfillSettings {
    fn from(cfg: &teleindex_config::BackfillConfig) -> Self {
        Self {
            page_size: cfg.page_size.max(1),
            page_delay: Duration::from_millis(cfg.page_delay_ms),
            window_page_delay: Duration::from_millis(cfg.window_page_delay_ms),
            media_parallelism: cfg.media_parallelism.max(1),
            max_batch_size: cfg.max_batch_size.max(1),
        }
    }
}

/// An explicit window of a channel's history, counted from the newest message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRequest {
    pub size: usize,
    pub offset: usize,
    pub batch_size: usize,
    pub media_policy: MediaPolicy,
    pub index_messages: bool,
}

impl WindowRequest {
    pub fn validate(&self, max_batch_size: usize) -> Result<()> {
        if self.size == 0 {
            return Err(Error::validation("size must be greater than zero"));
        }
        if self.batch_size == 0 || self.batch_size > max_batch_size {
            return Err(Error::validation(format!(
                "batch_size must be between 1 and {max_batch_size}"
            )));
        }
        if !self.index_messages && !self.media_policy.offloads() {
            return Err(Error::validation(
                "at least one of message indexing or media offload must be enabled",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowReport {
    pub channel_id: i64,
    pub processed: usize,
    pub failed: usize,
    pub images_downloaded: usize,
    pub images_failed: usize,
    pub index_success: usize,
    pub index_failed: usize,
    pub has_more: bool,
    /// Oldest message id reached.
    pub last_message_id: Option<i64>,
}

pub struct BatchSyncEngine {
    platform: Arc<dyn MessagingPlatform>,
    normalizer: Arc<Normalizer>,
    writer: Arc<IndexWriter>,
    settings: BackfillSettings,
}

impl BatchSyncEngine {
    pub fn new(
        platform: Arc<dyn MessagingPlatform>,
        normalizer: Arc<Normalizer>,
        writer: Arc<IndexWriter>,
        settings: BackfillSettings,
    ) -> Self {
        Self {
            platform,
            normalizer,
            writer,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &BackfillSettings {
        &self.settings
    }

    /// Fetch and index every message with an id above `cutoff`.
    ///
    /// Platform errors abort the run; per-message failures are counted.
    pub async fn backfill(
        &self,
        channel_id: i64,
        cutoff: i64,
        policy: MediaPolicy,
    ) -> Result<BackfillReport> {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        let mut report = BackfillReport::default();
        let mut records = Vec::new();
        let mut offset_id = 0i64;

        loop {
            let page = self
                .platform
                .get_messages(channel_id, self.settings.page_size, offset_id)
                .await?;
            #[cfg(feature = "metrics")]
            counter!(sync_metrics::PAGES_FETCHED_TOTAL).increment(1);

            let Some(oldest) = page.last().map(|m| m.id) else {
                break;
            };
            let reached_cutoff = page.iter().any(|m| m.id <= cutoff);
            let fresh: Vec<RawMessage> = page.into_iter().take_while(|m| m.id > cutoff).collect();
            debug!(channel_id, offset_id, fetched = fresh.len(), "backfill page");

            self.normalize_page(channel_id, fresh, policy, &mut report, &mut records)
                .await;

            // A cursor that does not move back would loop forever.
            if reached_cutoff || (offset_id != 0 && oldest >= offset_id) {
                break;
            }
            offset_id = oldest;
            tokio::time::sleep(self.settings.page_delay).await;
        }

        report.messages_processed = records.len();
        if !records.is_empty() {
            let outcome = self.writer.write(&records).await?;
            report.index_success = outcome.success;
            report.index_failed = outcome.failed;
        }

        #[cfg(feature = "metrics")]
        {
            counter!(sync_metrics::MESSAGES_PROCESSED_TOTAL)
                .increment(report.messages_processed as u64);
            counter!(sync_metrics::MESSAGES_FAILED_TOTAL).increment(report.messages_failed as u64);
            histogram!(sync_metrics::BACKFILL_DURATION_SECONDS)
                .record(started.elapsed().as_secs_f64());
        }
        info!(
            channel_id,
            cutoff,
            processed = report.messages_processed,
            failed = report.messages_failed,
            indexed = report.index_success,
            "backfill finished"
        );
        Ok(report)
    }

    /// Normalize one page with bounded fan-out, keeping newest-first order.
    async fn normalize_page(
        &self,
        channel_id: i64,
        page: Vec<RawMessage>,
        policy: MediaPolicy,
        report: &mut BackfillReport,
        records: &mut Vec<MessageRecord>,
    ) {
        let ids: Vec<i64> = page.iter().map(|m| m.id).collect();
        let units: Vec<_> = page
            .into_iter()
            .map(|raw| {
                let normalizer = Arc::clone(&self.normalizer);
                async move { normalizer.normalize(&raw, channel_id, policy).await }
            })
            .collect();

        let outcome = TaskScheduler::new(self.settings.media_parallelism)
            .run(units, &NoProgress, &CancellationToken::new())
            .await;

        for unit in outcome.into_ordered() {
            let message_id = ids.get(unit.index).copied().unwrap_or_default();
            match unit.outcome {
                UnitOutcome::Completed(Ok(normalized)) => {
                    report.images_downloaded += normalized.images_downloaded;
                    records.push(normalized.record);
                },
                UnitOutcome::Completed(Err(reason)) => {
                    warn!(channel_id, message_id, %reason, "skipping message");
                    report.messages_failed += 1;
                    if matches!(reason, SkipReason::Media(_)) {
                        report.images_failed += 1;
                    }
                },
                UnitOutcome::Panicked(message) => {
                    warn!(channel_id, message_id, %message, "normalization panicked");
                    report.messages_failed += 1;
                },
            }
        }
    }

    /// Process `request.size` messages after skipping `request.offset`.
    pub async fn sync_window(
        &self,
        channel_id: i64,
        request: &WindowRequest,
        progress: &dyn ProgressSink,
    ) -> Result<WindowReport> {
        request.validate(self.settings.max_batch_size)?;

        let mut report = WindowReport {
            channel_id,
            ..WindowReport::default()
        };
        let mut cursor = 0i64;
        let mut exhausted = false;

        let mut to_skip = request.offset;
        while to_skip > 0 {
            let limit = to_skip.min(self.settings.page_size);
            let page = self.platform.get_messages(channel_id, limit, cursor).await?;
            let Some(oldest) = page.last().map(|m| m.id) else {
                exhausted = true;
                break;
            };
            cursor = oldest;
            to_skip -= page.len().min(to_skip);
            if page.len() < limit {
                exhausted = true;
                break;
            }
            tokio::time::sleep(self.settings.window_page_delay).await;
        }

        let mut consumed = 0usize;
        while !exhausted && consumed < request.size {
            let limit = request.batch_size.min(request.size - consumed);
            let page = self.platform.get_messages(channel_id, limit, cursor).await?;
            let Some(oldest) = page.last().map(|m| m.id) else {
                exhausted = true;
                break;
            };
            let short = page.len() < limit;
            cursor = oldest;

            let mut records = Vec::with_capacity(page.len());
            for raw in &page {
                consumed += 1;
                match self
                    .normalizer
                    .normalize(raw, channel_id, request.media_policy)
                    .await
                {
                    Ok(Normalized {
                        record,
                        images_downloaded,
                    }) => {
                        report.processed += 1;
                        report.images_downloaded += images_downloaded;
                        records.push(record);
                    },
                    Err(reason) => {
                        warn!(channel_id, message_id = raw.id, %reason, "skipping message");
                        report.failed += 1;
                        if matches!(reason, SkipReason::Media(_)) {
                            report.images_failed += 1;
                        }
                    },
                }
                progress.report(SyncProgress::new(
                    consumed,
                    request.size,
                    format!("Processed message {}", raw.id),
                ));
            }

            if request.index_messages && !records.is_empty() {
                let outcome = self.writer.write(&records).await?;
                report.index_success += outcome.success;
                report.index_failed += outcome.failed;
                progress.report(SyncProgress::new(
                    consumed,
                    request.size,
                    format!("Indexed {} messages", outcome.success),
                ));
            }

            if short {
                exhausted = true;
            } else if consumed < request.size {
                tokio::time::sleep(self.settings.window_page_delay).await;
            }
        }

        report.last_message_id = (cursor != 0).then_some(cursor);
        report.has_more = !exhausted
            && consumed == request.size
            && !self
                .platform
                .get_messages(channel_id, 1, cursor)
                .await?
                .is_empty();

        info!(
            channel_id,
            processed = report.processed,
            failed = report.failed,
            has_more = report.has_more,
            "window sync finished"
        );
        Ok(report)
    }
}
