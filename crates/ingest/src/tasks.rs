//! Background task registry for sync jobs.
//!
//! A task runs on the tokio runtime and is tracked by id. Finished tasks stay
//! pollable for the [`TaskRetention`] window and are pruned on the next
//! enqueue or listing. Cancellation is cooperative: [`TaskRegistry::cancel`]
//! only flips the task's token, and the job decides where to stop.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    chrono::{DateTime, Utc},
    futures::FutureExt,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result,
    backfill::{BatchSyncEngine, WindowRequest},
    model::MediaPolicy,
    progress::{ProgressSink, SyncProgress},
    reconcile::ReconciliationEngine,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Progress,
    Success,
    Failure,
    Cancelled,
}

impl TaskState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub kind: String,
    pub state: TaskState,
    pub progress: Option<SyncProgress>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

type SharedSnapshot = Arc<Mutex<TaskSnapshot>>;

fn update(snapshot: &SharedSnapshot, f: impl FnOnce(&mut TaskSnapshot)) {
    f(&mut snapshot.lock().unwrap_or_else(|e| e.into_inner()));
}

/// Handle a running task uses to report progress and observe cancellation.
#[derive(Clone)]
pub struct TaskContext {
    task_id: String,
    snapshot: SharedSnapshot,
    cancel: CancellationToken,
}

impl TaskContext {
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

impl ProgressSink for TaskContext {
    fn report(&self, progress: SyncProgress) {
        update(&self.snapshot, |s| {
            if !s.state.is_terminal() {
                s.state = TaskState::Progress;
                s.progress = Some(progress);
            }
        });
    }
}

struct TaskEntry {
    snapshot: SharedSnapshot,
    cancel: CancellationToken,
}

/// How long finished tasks stay pollable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRetention {
    pub ttl: Duration,
    /// Finished tasks kept at most, newest first, even inside the TTL.
    pub max_finished: usize,
}

impl Default for TaskRetention {
    fn default() -> Self {
        Self::from(&teleindex_config::SyncConfig::default())
    }
}

impl From<&teleindex_config::SyncConfig> for TaskRetention {
    fn from(cfg: &teleindex_config::SyncConfig) -> Self {
        Self {
            ttl: Duration::from_secs(cfg.task_retention_secs),
            max_finished: cfg.max_finished_tasks,
        }
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    retention: TaskRetention,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: TaskRetention) -> Self {
        Self {
            tasks: Mutex::default(),
            retention,
        }
    }

    /// Drop finished tasks past the TTL, then the oldest beyond the cap.
    fn prune(&self, tasks: &mut HashMap<String, TaskEntry>) {
        let now = Utc::now();
        let mut finished: Vec<(DateTime<Utc>, String)> = tasks
            .iter()
            .filter_map(|(id, entry)| {
                let snapshot = entry.snapshot.lock().unwrap_or_else(|e| e.into_inner());
                snapshot
                    .finished_at
                    .filter(|_| snapshot.state.is_terminal())
                    .map(|at| (at, id.clone()))
            })
            .collect();
        finished.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let mut evicted = 0usize;
        for (rank, (finished_at, id)) in finished.into_iter().enumerate() {
            let expired = (now - finished_at)
                .to_std()
                .is_ok_and(|age| age > self.retention.ttl);
            if expired || rank >= self.retention.max_finished {
                tasks.remove(&id);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, remaining = tasks.len(), "pruned finished tasks");
        }
    }

    /// Spawn `job` and return its task id.
    ///
    /// `Err(Error::Cancelled)`, or any result produced after the token was
    /// flipped, ends the task as `cancelled`. A panic ends it as `failure`.
    pub fn enqueue<F, Fut>(&self, kind: &str, job: F) -> String
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let task_id = uuid::Uuid::new_v4().to_string();
        let snapshot = Arc::new(Mutex::new(TaskSnapshot {
            task_id: task_id.clone(),
            kind: kind.to_string(),
            state: TaskState::Pending,
            progress: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }));
        let cancel = CancellationToken::new();
        let ctx = TaskContext {
            task_id: task_id.clone(),
            snapshot: Arc::clone(&snapshot),
            cancel: cancel.clone(),
        };

        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            self.prune(&mut tasks);
            tasks.insert(task_id.clone(), TaskEntry {
                snapshot: Arc::clone(&snapshot),
                cancel: cancel.clone(),
            });
        }

        let fut = job(ctx);
        let id = task_id.clone();
        let kind = kind.to_string();
        tokio::spawn(async move {
            info!(task_id = %id, %kind, "task started");
            let outcome = AssertUnwindSafe(fut).catch_unwind().await;
            update(&snapshot, |s| {
                s.finished_at = Some(Utc::now());
                match outcome {
                    Ok(Ok(value)) if cancel.is_cancelled() => {
                        s.state = TaskState::Cancelled;
                        s.result = Some(value);
                    },
                    Ok(Ok(value)) => {
                        s.state = TaskState::Success;
                        s.result = Some(value);
                    },
                    Ok(Err(Error::Cancelled)) => s.state = TaskState::Cancelled,
                    Ok(Err(e)) => {
                        s.state = TaskState::Failure;
                        s.error = Some(e.to_string());
                    },
                    Err(_) => {
                        s.state = TaskState::Failure;
                        s.error = Some("task panicked".to_string());
                    },
                }
            });
            let state = snapshot.lock().unwrap_or_else(|e| e.into_inner()).state;
            match state {
                TaskState::Failure => warn!(task_id = %id, %kind, "task failed"),
                _ => info!(task_id = %id, %kind, ?state, "task finished"),
            }
        });
        task_id
    }

    #[must_use]
    pub fn poll(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .map(|entry| entry.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    /// Request cancellation. Returns `false` for unknown or finished tasks.
    pub fn cancel(&self, task_id: &str) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = tasks.get(task_id) else {
            return false;
        };
        if entry
            .snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
            .is_terminal()
        {
            return false;
        }
        entry.cancel.cancel();
        info!(task_id, "task cancellation requested");
        true
    }

    /// Every tracked task, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        self.prune(&mut tasks);
        let mut all: Vec<TaskSnapshot> = tasks
            .values()
            .map(|entry| entry.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .collect();
        all.sort_by_key(|s| s.created_at);
        all
    }
}

/// Smart sync and window sync as registry tasks.
pub struct SyncTasks {
    registry: Arc<TaskRegistry>,
    reconciler: Arc<ReconciliationEngine>,
    backfill: Arc<BatchSyncEngine>,
    default_max_parallel: usize,
}

impl SyncTasks {
    pub fn new(
        registry: Arc<TaskRegistry>,
        reconciler: Arc<ReconciliationEngine>,
        backfill: Arc<BatchSyncEngine>,
        default_max_parallel: usize,
    ) -> Self {
        Self {
            registry,
            reconciler,
            backfill,
            default_max_parallel,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Reconcile `channel_ids` (every reachable channel when `None`).
    pub fn smart_sync(
        &self,
        channel_ids: Option<Vec<i64>>,
        max_parallel: Option<usize>,
        download_images: bool,
    ) -> Result<String> {
        let max_parallel = max_parallel.unwrap_or(self.default_max_parallel);
        self.reconciler.check_parallelism(max_parallel)?;
        let policy = MediaPolicy::from_download_images(download_images);
        let reconciler = Arc::clone(&self.reconciler);

        Ok(self.registry.enqueue("smart_sync", move |ctx| async move {
            let summary = reconciler
                .reconcile_all(channel_ids, max_parallel, policy, &ctx, ctx.cancel_token())
                .await?;
            Ok(serde_json::to_value(summary)?)
        }))
    }

    /// Sync an explicit history window of one channel.
    pub fn sync_channel(&self, channel_id: i64, request: WindowRequest) -> Result<String> {
        request.validate(self.backfill.settings().max_batch_size)?;
        let backfill = Arc::clone(&self.backfill);

        Ok(self.registry.enqueue("sync_channel", move |ctx| async move {
            let report = backfill.sync_window(channel_id, &request, &ctx).await?;
            Ok(serde_json::to_value(report)?)
        }))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::test_support::Fixture};

    async fn finished(registry: &TaskRegistry, task_id: &str) -> TaskSnapshot {
        for _ in 0..400 {
            let snapshot = registry.poll(task_id).unwrap();
            if snapshot.state.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {task_id} did not finish");
    }

    #[tokio::test]
    async fn smart_sync_task_reports_summary_and_progress() {
        let fx = Fixture::new();
        fx.platform.add_channel(1, "One", 12);
        fx.platform.add_channel(2, "Two", 3);

        let task_id = fx.tasks.smart_sync(None, Some(2), false).unwrap();
        let snapshot = finished(fx.tasks.registry(), &task_id).await;
        assert_eq!(snapshot.state, TaskState::Success);
        assert_eq!(snapshot.kind, "smart_sync");
        let result = snapshot.result.unwrap();
        assert_eq!(result["channels_processed"], 2);
        assert_eq!(result["total_messages_processed"], 15);
        assert_eq!(
            snapshot.progress.unwrap().status,
            "Completed 2/2 channels"
        );
    }

    #[tokio::test]
    async fn smart_sync_rejects_bad_parallelism_up_front() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.tasks.smart_sync(None, Some(21), true),
            Err(Error::Validation { .. })
        ));
        assert!(fx.tasks.smart_sync(None, Some(0), true).is_err());
        assert!(fx.tasks.registry().list().is_empty());
    }

    #[tokio::test]
    async fn sync_channel_runs_window() {
        let fx = Fixture::new();
        fx.platform.add_channel(4, "Four", 60);
        let request = WindowRequest {
            size: 50,
            offset: 0,
            batch_size: 25,
            media_policy: MediaPolicy::Markers,
            index_messages: true,
        };

        let task_id = fx.tasks.sync_channel(4, request.clone()).unwrap();
        let snapshot = finished(fx.tasks.registry(), &task_id).await;
        assert_eq!(snapshot.state, TaskState::Success);
        let result = snapshot.result.unwrap();
        assert_eq!(result["processed"], 50);
        assert_eq!(result["has_more"], true);

        let invalid = WindowRequest {
            batch_size: 0,
            ..request
        };
        assert!(fx.tasks.sync_channel(4, invalid).is_err());
    }

    #[tokio::test]
    async fn failures_and_panics_are_recorded() {
        let registry = TaskRegistry::new();
        let failed = registry.enqueue("boom", |_| async { Err(Error::message("boom")) });
        let snapshot = finished(&registry, &failed).await;
        assert_eq!(snapshot.state, TaskState::Failure);
        assert_eq!(snapshot.error.as_deref(), Some("boom"));
        assert!(snapshot.finished_at.is_some());

        async fn explode() -> Result<Value> {
            panic!("exploded")
        }
        let panicked = registry.enqueue("panic", |_| explode());
        assert_eq!(finished(&registry, &panicked).await.state, TaskState::Failure);
    }

    #[tokio::test]
    async fn finished_tasks_beyond_cap_are_evicted() {
        let registry = TaskRegistry::with_retention(TaskRetention {
            ttl: Duration::from_secs(3600),
            max_finished: 2,
        });
        let mut done = Vec::new();
        for i in 0..4 {
            let task_id = registry.enqueue("quick", move |_| async move { Ok(Value::from(i)) });
            finished(&registry, &task_id).await;
            done.push(task_id);
        }
        let running = registry.enqueue("wait", |ctx| async move {
            ctx.cancelled().await;
            Err(Error::Cancelled)
        });

        let listed: Vec<String> = registry.list().into_iter().map(|s| s.task_id).collect();
        assert_eq!(listed, [done[2].clone(), done[3].clone(), running.clone()]);
        assert!(registry.poll(&done[0]).is_none());
        assert!(registry.poll(&done[1]).is_none());
        assert!(registry.cancel(&running));
    }

    #[tokio::test]
    async fn expired_tasks_are_evicted_but_running_ones_stay() {
        let registry = TaskRegistry::with_retention(TaskRetention {
            ttl: Duration::ZERO,
            max_finished: 100,
        });
        let quick = registry.enqueue("quick", |_| async { Ok(Value::Null) });
        finished(&registry, &quick).await;
        let running = registry.enqueue("wait", |ctx| async move {
            ctx.cancelled().await;
            Err(Error::Cancelled)
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task_id, running);
        assert!(registry.poll(&quick).is_none());
    }

    #[tokio::test]
    async fn cancel_is_cooperative() {
        let registry = TaskRegistry::new();
        let task_id = registry.enqueue("wait", |ctx| async move {
            ctx.report(SyncProgress::new(1, 2, "waiting"));
            ctx.cancelled().await;
            Err(Error::Cancelled)
        });

        assert!(!registry.cancel("missing"));
        assert!(registry.cancel(&task_id));
        let snapshot = finished(&registry, &task_id).await;
        assert_eq!(snapshot.state, TaskState::Cancelled);
        assert!(!registry.cancel(&task_id));
        assert_eq!(registry.list().len(), 1);
        assert!(registry.poll("missing").is_none());
    }
}
