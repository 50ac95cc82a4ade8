//! Persisted listener status and the monitored channel set.
//!
//! [`ListenerStateManager`] owns both keys. Status writes are read-modify-write
//! cycles committed with [`StatusStore::compare_and_set`] and retried from a
//! fresh read when another writer (another manager, possibly in another
//! process such as the admin CLI) got in between. Each cycle also refreshes
//! the channel snapshot (`monitored_channels`, `channels`), so the snapshot
//! matches the set once writers go quiet.

use std::sync::Arc;

use {
    chrono::Utc,
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result,
    model::{ListenerPhase, ListenerStats, ListenerStatus, StopOutcome},
    store::{LISTENER_CHANNELS_KEY, LISTENER_STATUS_KEY, StatusStore},
};

/// Attempts before a contended status write gives up.
const MAX_WRITE_ATTEMPTS: usize = 16;

pub struct ListenerStateManager {
    store: Arc<dyn StatusStore>,
    /// Serializes writers inside this process so they do not retry against
    /// each other.
    lock: Mutex<()>,
}

impl ListenerStateManager {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Current status; the default when nothing is stored or the stored value
    /// does not parse.
    pub async fn status(&self) -> Result<ListenerStatus> {
        Ok(self.load().await?.1)
    }

    async fn load(&self) -> Result<(Option<String>, ListenerStatus)> {
        let raw = self.store.get(LISTENER_STATUS_KEY).await?;
        let status = match raw.as_deref() {
            None => ListenerStatus::default(),
            Some(text) => serde_json::from_str(text).unwrap_or_else(|e| {
                warn!(error = %e, "stored listener status is unreadable, using default");
                ListenerStatus::default()
            }),
        };
        Ok((raw, status))
    }

    /// Apply `change` to the latest status and commit it only if nobody wrote
    /// in the meantime. An `Err` from `change` aborts without writing.
    async fn update<T>(
        &self,
        mut change: impl FnMut(&mut ListenerStatus) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.lock.lock().await;
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let (raw, current) = self.load().await?;
            let mut next = current.clone();
            let value = change(&mut next)?;
            self.refresh_snapshot(&mut next).await?;
            if next == current {
                return Ok(value);
            }
            let encoded = serde_json::to_string(&next)?;
            if self
                .store
                .compare_and_set(LISTENER_STATUS_KEY, raw.as_deref(), &encoded)
                .await?
            {
                return Ok(value);
            }
            debug!(attempt, "listener status changed underneath, retrying");
        }
        Err(Error::message("listener status kept changing concurrently"))
    }

    /// Check that no listener runs and mark a new run as starting, atomically
    /// across every manager sharing the store.
    pub async fn begin_start(&self, download_images: bool) -> Result<ListenerStatus> {
        let status = self
            .update(|status| {
                if status.is_running {
                    return Err(Error::AlreadyRunning);
                }
                status.is_running = true;
                status.phase = ListenerPhase::Starting;
                status.download_images = download_images;
                status.task_id = Some(uuid::Uuid::new_v4().to_string());
                status.started_at = Some(Utc::now());
                status.stopped_at = None;
                status.error = None;
                Ok(status.clone())
            })
            .await?;
        info!(task_id = ?status.task_id, download_images, "listener starting");
        Ok(status)
    }

    /// Take over a run persisted as running by a previous process.
    ///
    /// Returns the refreshed status with a new task handle, or `None` when the
    /// persisted status is not running.
    pub async fn claim_resume(&self) -> Result<Option<ListenerStatus>> {
        let mut previous = None;
        let claimed = self
            .update(|status| {
                if !status.is_running {
                    return Ok(None);
                }
                previous = status.task_id.take();
                status.phase = ListenerPhase::Starting;
                status.task_id = Some(uuid::Uuid::new_v4().to_string());
                status.started_at = Some(Utc::now());
                status.error = None;
                Ok(Some(status.clone()))
            })
            .await?;
        if let Some(ref status) = claimed {
            info!(previous = ?previous, task_id = ?status.task_id, "resuming listener");
        }
        Ok(claimed)
    }

    /// Persist `running` for `task_id` with a fresh channel snapshot.
    ///
    /// Returns `false` if another run owns the status by now.
    pub async fn mark_running(&self, task_id: &str) -> Result<bool> {
        self.update(|status| {
            if status.task_id.as_deref() != Some(task_id) || !status.is_running {
                return Ok(false);
            }
            status.phase = ListenerPhase::Running;
            Ok(true)
        })
        .await
    }

    /// Persist the final `stopped` state for `task_id`.
    ///
    /// A run that no longer owns the status leaves it untouched and gets
    /// `false` back.
    pub async fn mark_stopped(&self, task_id: &str, error: Option<String>) -> Result<bool> {
        self.update(|status| {
            if status.task_id.as_deref() != Some(task_id) {
                debug!(task_id, current = ?status.task_id, "stale run, not writing stop");
                return Ok(false);
            }
            if status.phase == ListenerPhase::Stopped && !status.is_running {
                return Ok(true);
            }
            status.is_running = false;
            status.phase = ListenerPhase::Stopped;
            if status.stopped_at.is_none() || error.is_some() {
                status.stopped_at = Some(Utc::now());
            }
            if error.is_some() {
                status.error = error.clone();
            }
            Ok(true)
        })
        .await
    }

    /// Flip the persisted flag so the running loop winds down.
    pub async fn request_stop(&self) -> Result<StopOutcome> {
        let outcome = self
            .update(|status| {
                if !status.is_running {
                    return Ok(StopOutcome::NotRunning);
                }
                status.is_running = false;
                status.phase = ListenerPhase::Stopping;
                status.stopped_at = Some(Utc::now());
                Ok(StopOutcome::Stopping)
            })
            .await?;
        if outcome == StopOutcome::Stopping {
            info!("listener stop requested");
        }
        Ok(outcome)
    }

    /// Add a channel to the monitored set. Returns `true` if it was new.
    pub async fn add_channel(&self, channel_id: i64) -> Result<bool> {
        let added = self
            .store
            .set_add(LISTENER_CHANNELS_KEY, &channel_id.to_string())
            .await?;
        if added {
            self.persist_snapshot().await?;
            debug!(channel_id, "channel added to monitoring");
        }
        Ok(added)
    }

    /// Remove a channel from the monitored set. Returns `true` if it was present.
    pub async fn remove_channel(&self, channel_id: i64) -> Result<bool> {
        let removed = self
            .store
            .set_remove(LISTENER_CHANNELS_KEY, &channel_id.to_string())
            .await?;
        if removed {
            self.persist_snapshot().await?;
            debug!(channel_id, "channel removed from monitoring");
        }
        Ok(removed)
    }

    pub async fn is_monitored(&self, channel_id: i64) -> Result<bool> {
        Ok(self.monitored_channels().await?.contains(&channel_id))
    }

    /// Monitored channel ids, ascending. Unparseable members are skipped.
    pub async fn monitored_channels(&self) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self
            .store
            .set_members(LISTENER_CHANNELS_KEY)
            .await?
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn stats(&self) -> Result<ListenerStats> {
        Ok(ListenerStats {
            status: self.status().await?,
            monitored: self.monitored_channels().await?,
        })
    }

    async fn refresh_snapshot(&self, status: &mut ListenerStatus) -> Result<()> {
        let channels = self.monitored_channels().await?;
        status.monitored_channels = channels.len();
        status.channels = channels;
        Ok(())
    }

    async fn persist_snapshot(&self) -> Result<()> {
        self.update(|_| Ok(())).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::store_memory::InMemoryStatusStore,
        async_trait::async_trait,
        futures::future::BoxFuture,
    };

    fn manager() -> Arc<ListenerStateManager> {
        Arc::new(ListenerStateManager::new(Arc::new(InMemoryStatusStore::new())))
    }

    /// Runs an armed future right before the next status write reaches the
    /// shared store, standing in for a second process acting between our read
    /// and our write.
    struct InterleavedStore {
        inner: Arc<InMemoryStatusStore>,
        before_write: std::sync::Mutex<Option<BoxFuture<'static, ()>>>,
    }

    impl InterleavedStore {
        fn new(inner: Arc<InMemoryStatusStore>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                before_write: std::sync::Mutex::new(None),
            })
        }

        fn arm(&self, fut: impl Future<Output = ()> + Send + 'static) {
            *self.before_write.lock().unwrap() = Some(Box::pin(fut));
        }
    }

    #[async_trait]
    impl StatusStore for InterleavedStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn compare_and_set(
            &self,
            key: &str,
            expected: Option<&str>,
            value: &str,
        ) -> Result<bool> {
            let armed = self.before_write.lock().unwrap().take();
            if let Some(fut) = armed {
                fut.await;
            }
            self.inner.compare_and_set(key, expected, value).await
        }

        async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
            self.inner.set_add(key, member).await
        }

        async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
            self.inner.set_remove(key, member).await
        }

        async fn set_members(&self, key: &str) -> Result<Vec<String>> {
            self.inner.set_members(key).await
        }
    }

    /// A listener-side manager wrapped in an interleaving store, and an
    /// admin-side manager writing straight to the shared store.
    fn two_processes() -> (
        Arc<InterleavedStore>,
        ListenerStateManager,
        Arc<ListenerStateManager>,
    ) {
        let shared = Arc::new(InMemoryStatusStore::new());
        let interleaved = InterleavedStore::new(Arc::clone(&shared));
        let listener_side = ListenerStateManager::new(interleaved.clone());
        let admin_side = Arc::new(ListenerStateManager::new(shared));
        (interleaved, listener_side, admin_side)
    }

    #[tokio::test]
    async fn concurrent_starts_admit_exactly_one() {
        let state = manager();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = Arc::clone(&state);
            handles.push(tokio::spawn(async move { state.begin_start(true).await }));
        }
        let mut ok = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(Error::AlreadyRunning) => rejected += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(rejected, 7);
    }

    #[tokio::test]
    async fn stop_then_final_stop_by_owner() {
        let state = manager();
        assert_eq!(state.request_stop().await.unwrap(), StopOutcome::NotRunning);

        let started = state.begin_start(false).await.unwrap();
        let task_id = started.task_id.clone().unwrap();
        assert!(state.mark_running(&task_id).await.unwrap());
        assert_eq!(state.status().await.unwrap().phase, ListenerPhase::Running);

        assert_eq!(state.request_stop().await.unwrap(), StopOutcome::Stopping);
        let stopping = state.status().await.unwrap();
        assert!(!stopping.is_running);
        assert_eq!(stopping.phase, ListenerPhase::Stopping);
        assert!(stopping.stopped_at.is_some());

        assert!(!state.mark_stopped("someone-else", None).await.unwrap());
        assert!(state.mark_stopped(&task_id, None).await.unwrap());
        let stopped = state.status().await.unwrap();
        assert_eq!(stopped.phase, ListenerPhase::Stopped);
        assert_eq!(stopped.stopped_at, stopping.stopped_at);
        assert!(!stopped.download_images);
    }

    #[tokio::test]
    async fn failure_records_error() {
        let state = manager();
        let task_id = state.begin_start(true).await.unwrap().task_id.unwrap();
        state
            .mark_stopped(&task_id, Some("stream ended".into()))
            .await
            .unwrap();
        let status = state.status().await.unwrap();
        assert!(!status.is_running);
        assert_eq!(status.error.as_deref(), Some("stream ended"));
        assert!(status.stopped_at.is_some());
    }

    #[tokio::test]
    async fn channel_set_and_snapshot_stay_consistent() {
        let state = manager();
        assert!(state.add_channel(30).await.unwrap());
        assert!(state.add_channel(4).await.unwrap());
        assert!(!state.add_channel(4).await.unwrap());

        let status = state.status().await.unwrap();
        assert_eq!(status.channels, [4, 30]);
        assert_eq!(status.monitored_channels, 2);

        assert!(state.remove_channel(30).await.unwrap());
        assert!(!state.remove_channel(30).await.unwrap());
        let stats = state.stats().await.unwrap();
        assert_eq!(stats.monitored, [4]);
        assert_eq!(stats.status.channels, [4]);
        assert!(state.is_monitored(4).await.unwrap());
    }

    #[tokio::test]
    async fn external_stop_survives_concurrent_channel_add() {
        let (interleaved, listener_side, admin_side) = two_processes();
        let task_id = listener_side.begin_start(true).await.unwrap().task_id.unwrap();
        assert!(listener_side.mark_running(&task_id).await.unwrap());

        let admin = Arc::clone(&admin_side);
        interleaved.arm(async move {
            assert_eq!(admin.request_stop().await.unwrap(), StopOutcome::Stopping);
        });
        assert!(listener_side.add_channel(9).await.unwrap());

        let status = admin_side.status().await.unwrap();
        assert!(!status.is_running);
        assert_eq!(status.phase, ListenerPhase::Stopping);
        assert_eq!(status.channels, [9]);
    }

    #[tokio::test]
    async fn final_stop_keeps_channel_added_concurrently() {
        let (interleaved, listener_side, admin_side) = two_processes();
        let task_id = listener_side.begin_start(false).await.unwrap().task_id.unwrap();

        let admin = Arc::clone(&admin_side);
        interleaved.arm(async move {
            assert!(admin.add_channel(12).await.unwrap());
        });
        assert!(listener_side.mark_stopped(&task_id, None).await.unwrap());

        let status = admin_side.status().await.unwrap();
        assert_eq!(status.phase, ListenerPhase::Stopped);
        assert_eq!(status.channels, [12]);
        assert_eq!(status.monitored_channels, 1);
    }

    #[tokio::test]
    async fn start_race_across_processes_admits_one() {
        let (interleaved, listener_side, admin_side) = two_processes();

        let other = Arc::clone(&admin_side);
        interleaved.arm(async move {
            other.begin_start(true).await.unwrap();
        });
        assert!(matches!(
            listener_side.begin_start(true).await,
            Err(Error::AlreadyRunning)
        ));
        assert!(admin_side.status().await.unwrap().is_running);
    }

    #[tokio::test]
    async fn resume_claims_only_running_status() {
        let state = manager();
        assert!(state.claim_resume().await.unwrap().is_none());

        let first = state.begin_start(false).await.unwrap();
        let claimed = state.claim_resume().await.unwrap().unwrap();
        assert_ne!(claimed.task_id, first.task_id);
        assert!(!claimed.download_images);
        assert!(claimed.is_running);
    }
}
