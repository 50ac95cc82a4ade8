//! Smart sync: compare the platform's latest id with the index's and backfill
//! the gap.

use std::sync::Arc;

use {
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
};

#[cfg(feature = "metrics")]
use teleindex_metrics::{counter, labels, sync as sync_metrics};

use crate::{
    Error, Result,
    backfill::BatchSyncEngine,
    directory::ChannelDirectory,
    model::{MediaPolicy, SyncAction, SyncOutcome, SyncSummary},
    progress::ProgressSink,
    scheduler::{TaskScheduler, UnitOutcome},
    writer::IndexWriter,
};

/// What to do with one channel, decided from the two latest ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    NotAccessible,
    FullSync,
    UpToDate,
    Incremental { cutoff: i64, remote: i64 },
    /// The index is ahead of the platform. Never deletes.
    IndexAhead { index: i64, remote: i64 },
}

impl SyncDecision {
    #[must_use]
    pub fn action(self) -> SyncAction {
        match self {
            Self::FullSync => SyncAction::FullSync,
            Self::Incremental { .. } => SyncAction::IncrementalSync,
            Self::NotAccessible | Self::UpToDate | Self::IndexAhead { .. } => SyncAction::Skip,
        }
    }

    #[must_use]
    pub fn reason(self) -> String {
        match self {
            Self::NotAccessible => "channel not accessible".into(),
            Self::FullSync => "no data in index".into(),
            Self::UpToDate => "last message ids are equal".into(),
            Self::Incremental { cutoff, remote } => {
                format!("synced messages {}..={remote}", cutoff + 1)
            },
            Self::IndexAhead { index, remote } => {
                format!("index has a higher message id ({index}) than the platform ({remote})")
            },
        }
    }

    /// Cutoff for the backfill this decision needs, if any.
    #[must_use]
    pub fn cutoff(self) -> Option<i64> {
        match self {
            Self::FullSync => Some(0),
            Self::Incremental { cutoff, .. } => Some(cutoff),
            _ => None,
        }
    }
}

#[must_use]
pub fn decide(remote_last_id: Option<i64>, index_last_id: Option<i64>) -> SyncDecision {
    match (remote_last_id, index_last_id) {
        (None, _) => SyncDecision::NotAccessible,
        (Some(_), None) => SyncDecision::FullSync,
        (Some(remote), Some(index)) if remote == index => SyncDecision::UpToDate,
        (Some(remote), Some(index)) if remote > index => SyncDecision::Incremental {
            cutoff: index,
            remote,
        },
        (Some(remote), Some(index)) => SyncDecision::IndexAhead { index, remote },
    }
}

pub struct ReconciliationEngine {
    directory: Arc<ChannelDirectory>,
    writer: Arc<IndexWriter>,
    backfill: Arc<BatchSyncEngine>,
    max_parallel_limit: usize,
}

impl ReconciliationEngine {
    pub fn new(
        directory: Arc<ChannelDirectory>,
        writer: Arc<IndexWriter>,
        backfill: Arc<BatchSyncEngine>,
        max_parallel_limit: usize,
    ) -> Self {
        Self {
            directory,
            writer,
            backfill,
            max_parallel_limit: max_parallel_limit.max(1),
        }
    }

    /// Reject a fan-out bound outside `1..=max_parallel_limit`.
    pub fn check_parallelism(&self, max_parallel: usize) -> Result<()> {
        if max_parallel == 0 || max_parallel > self.max_parallel_limit {
            return Err(Error::validation(format!(
                "max_parallel must be between 1 and {}",
                self.max_parallel_limit
            )));
        }
        Ok(())
    }

    /// Reconcile one channel. Failures become an `error` outcome.
    pub async fn reconcile(&self, channel_id: i64, policy: MediaPolicy) -> SyncOutcome {
        let remote = self
            .directory
            .remote_last_id(channel_id)
            .await
            .unwrap_or_else(|e| {
                warn!(channel_id, error = %e, "could not read latest platform id");
                None
            });
        let index = self
            .writer
            .last_indexed_id(channel_id)
            .await
            .unwrap_or_else(|e| {
                warn!(channel_id, error = %e, "could not read latest indexed id");
                None
            });

        let decision = decide(remote, index);
        info!(channel_id, ?remote, ?index, ?decision, "reconciling channel");
        if let SyncDecision::IndexAhead { .. } = decision {
            warn!(channel_id, "index ahead of platform, skipping");
        }

        let outcome = match decision.cutoff() {
            None => SyncOutcome::new(
                channel_id,
                decision.action(),
                decision.reason(),
                decision != SyncDecision::NotAccessible,
            ),
            Some(cutoff) => match self.backfill.backfill(channel_id, cutoff, policy).await {
                Ok(report) => {
                    SyncOutcome::new(channel_id, decision.action(), decision.reason(), true)
                        .with_report(report)
                },
                Err(e) => {
                    error!(channel_id, error = %e, "backfill failed");
                    SyncOutcome::new(channel_id, SyncAction::Error, e.to_string(), false)
                },
            },
        };

        #[cfg(feature = "metrics")]
        counter!(sync_metrics::RECONCILIATIONS_TOTAL, labels::ACTION => outcome.action.as_str())
            .increment(1);
        outcome
    }

    /// Reconcile many channels with bounded parallelism.
    ///
    /// With no ids, every reachable channel is synced.
    pub async fn reconcile_all(
        self: &Arc<Self>,
        channel_ids: Option<Vec<i64>>,
        max_parallel: usize,
        policy: MediaPolicy,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        self.check_parallelism(max_parallel)?;

        let channel_ids = match channel_ids {
            Some(ids) if !ids.is_empty() => ids,
            _ => self.directory.reachable_channel_ids().await,
        };
        if channel_ids.is_empty() {
            return Ok(SyncSummary::empty("no channels found to sync"));
        }

        info!(channels = channel_ids.len(), max_parallel, "starting smart sync");
        let units: Vec<_> = channel_ids
            .iter()
            .map(|&channel_id| {
                let engine = Arc::clone(self);
                async move { engine.reconcile(channel_id, policy).await }
            })
            .collect();

        let report = TaskScheduler::new(max_parallel)
            .with_label("channels")
            .run(units, progress, cancel)
            .await;
        let cancelled = report.cancelled;

        let results = report
            .into_ordered()
            .into_iter()
            .map(|unit| {
                let channel_id = channel_ids.get(unit.index).copied().unwrap_or_default();
                match unit.outcome {
                    UnitOutcome::Completed(outcome) => outcome,
                    UnitOutcome::Panicked(message) => {
                        SyncOutcome::new(channel_id, SyncAction::Error, message, false)
                    },
                }
            })
            .collect();

        let summary = SyncSummary::from_outcomes(results, cancelled);
        info!(
            processed = summary.channels_processed,
            successful = summary.channels_successful,
            failed = summary.channels_failed,
            cancelled,
            "smart sync finished"
        );
        Ok(summary)
    }
}
