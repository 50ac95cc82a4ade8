//! Live ingestion loop.
//!
//! One loop per process. Starting goes through
//! [`ListenerStateManager::begin_start`], whose compare-and-set write admits a
//! single run even across processes sharing the store. The loop stops on its
//! [`CancellationToken`]. A watcher task re-reads the persisted status every
//! poll interval and cancels that token once the run was stopped or replaced
//! elsewhere, so a loop waiting for a job slot still notices.

use std::{sync::Arc, time::Duration};

use {
    futures::{StreamExt, stream::BoxStream},
    tokio::{
        sync::Mutex,
        task::JoinHandle,
        time::{MissedTickBehavior, interval},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use teleindex_metrics::{counter, gauge, listener as listener_metrics};

use crate::{
    Result,
    directory::ChannelDirectory,
    media::MediaKind,
    model::{ListenerStats, ListenerStatus, MediaPolicy, StopOutcome},
    normalize::{Normalizer, SkipReason},
    platform::{MessagingPlatform, PlatformEvent, RawMessage},
    scheduler::BoundedDispatcher,
    state::ListenerStateManager,
    writer::IndexWriter,
};

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub poll_interval: Duration,
    pub max_in_flight: usize,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self::from(&teleindex_config::ListenerConfig::default())
    }
}

impl From<&teleindex_config::ListenerConfig> for ListenerSettings {
    fn from(cfg: &teleindex_config::ListenerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
            max_in_flight: cfg.max_in_flight.max(1),
        }
    }
}

struct LiveLoop {
    task_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Normalize and index one live message.
///
/// A media failure falls back to markers so the text still lands.
struct LiveJob {
    normalizer: Arc<Normalizer>,
    writer: Arc<IndexWriter>,
}

impl LiveJob {
    async fn run(&self, channel_id: i64, message: RawMessage, policy: MediaPolicy) {
        let normalized = match self.normalizer.normalize(&message, channel_id, policy).await {
            Ok(normalized) => normalized,
            Err(SkipReason::Media(reason)) => {
                warn!(channel_id, message_id = message.id, %reason, "media offload failed, indexing with markers");
                match self
                    .normalizer
                    .normalize(&message, channel_id, MediaPolicy::Markers)
                    .await
                {
                    Ok(normalized) => normalized,
                    Err(reason) => {
                        warn!(channel_id, message_id = message.id, %reason, "dropping live message");
                        return;
                    },
                }
            },
            Err(reason) => {
                warn!(channel_id, message_id = message.id, %reason, "dropping live message");
                return;
            },
        };

        match self.writer.write(std::slice::from_ref(&normalized.record)).await {
            Ok(outcome) if outcome.failed == 0 => {
                debug!(channel_id, message_id = message.id, "indexed live message");
            },
            Ok(_) => warn!(channel_id, message_id = message.id, "index rejected live message"),
            Err(e) => error!(channel_id, message_id = message.id, error = %e, "failed to index live message"),
        }
    }
}

pub struct Listener {
    state: Arc<ListenerStateManager>,
    directory: Arc<ChannelDirectory>,
    platform: Arc<dyn MessagingPlatform>,
    job: Arc<LiveJob>,
    settings: ListenerSettings,
    live: Mutex<Option<LiveLoop>>,
}

impl Listener {
    pub fn new(
        state: Arc<ListenerStateManager>,
        directory: Arc<ChannelDirectory>,
        platform: Arc<dyn MessagingPlatform>,
        normalizer: Arc<Normalizer>,
        writer: Arc<IndexWriter>,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            state,
            directory,
            platform,
            job: Arc::new(LiveJob { normalizer, writer }),
            settings,
            live: Mutex::new(None),
        }
    }

    /// Start a run. Fails with [`crate::Error::AlreadyRunning`] if the
    /// persisted status says one is active.
    pub async fn start(self: &Arc<Self>, download_images: bool) -> Result<ListenerStatus> {
        let status = self.state.begin_start(download_images).await?;
        let mut live = self.live.lock().await;
        self.launch(&mut live, status).await
    }

    /// Relaunch a run persisted as running when this process has no loop.
    ///
    /// Returns `true` if a loop was launched.
    pub async fn resume_if_needed(self: &Arc<Self>) -> Result<bool> {
        let mut live = self.live.lock().await;
        if live.as_ref().is_some_and(|l| !l.handle.is_finished()) {
            return Ok(false);
        }
        let Some(status) = self.state.claim_resume().await? else {
            return Ok(false);
        };
        self.launch(&mut live, status).await?;
        Ok(true)
    }

    /// Request a stop. Does not wait for in-flight jobs.
    pub async fn stop(&self) -> Result<StopOutcome> {
        let outcome = self.state.request_stop().await?;
        if let Some(live) = self.live.lock().await.as_ref() {
            debug!(task_id = %live.task_id, "cancelling live loop");
            live.cancel.cancel();
        }
        Ok(outcome)
    }

    /// Whether this process has a loop that has not exited.
    pub async fn is_live(&self) -> bool {
        self.live
            .lock()
            .await
            .as_ref()
            .is_some_and(|l| !l.handle.is_finished())
    }

    pub async fn status(&self) -> Result<ListenerStatus> {
        self.state.status().await
    }

    pub async fn stats(&self) -> Result<ListenerStats> {
        self.state.stats().await
    }

    pub async fn add_channel(&self, channel_id: i64) -> Result<bool> {
        self.state.add_channel(channel_id).await
    }

    pub async fn remove_channel(&self, channel_id: i64) -> Result<bool> {
        self.state.remove_channel(channel_id).await
    }

    pub async fn monitored_channels(&self) -> Result<Vec<i64>> {
        self.state.monitored_channels().await
    }

    /// Discover channels, subscribe and spawn the loop for `status.task_id`.
    async fn launch(
        self: &Arc<Self>,
        live: &mut Option<LiveLoop>,
        status: ListenerStatus,
    ) -> Result<ListenerStatus> {
        let Some(task_id) = status.task_id.clone() else {
            return Err(crate::Error::message("listener status has no task id"));
        };

        let stream = match self.prepare(&task_id).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(%task_id, error = %e, "listener failed to start");
                self.state.mark_stopped(&task_id, Some(e.to_string())).await?;
                #[cfg(feature = "metrics")]
                counter!(listener_metrics::FAILURES_TOTAL).increment(1);
                return Err(e);
            },
        };

        if let Some(previous) = live.take() {
            previous.cancel.cancel();
        }
        let cancel = CancellationToken::new();
        let policy = MediaPolicy::from_download_images(status.download_images);
        let handle = tokio::spawn(Arc::clone(self).run_loop(
            task_id.clone(),
            policy,
            stream,
            cancel.clone(),
        ));
        *live = Some(LiveLoop {
            task_id: task_id.clone(),
            cancel,
            handle,
        });

        #[cfg(feature = "metrics")]
        counter!(listener_metrics::STARTS_TOTAL).increment(1);
        info!(%task_id, download_images = status.download_images, "listener running");
        self.state.status().await
    }

    async fn prepare(&self, task_id: &str) -> Result<BoxStream<'static, PlatformEvent>> {
        let channels = self.directory.discover_into_monitoring().await?;
        let stream = self.platform.subscribe().await?;
        self.state.mark_running(task_id).await?;
        #[cfg(feature = "metrics")]
        gauge!(listener_metrics::MONITORED_CHANNELS).set(channels.len() as f64);
        info!(%task_id, channels = channels.len(), "subscribed to live events");
        Ok(stream)
    }

    async fn run_loop(
        self: Arc<Self>,
        task_id: String,
        policy: MediaPolicy,
        mut events: BoxStream<'static, PlatformEvent>,
        cancel: CancellationToken,
    ) {
        let mut dispatcher = BoundedDispatcher::new(self.settings.max_in_flight);
        tokio::spawn(watch_status(
            Arc::clone(&self.state),
            task_id.clone(),
            self.settings.poll_interval,
            cancel.clone(),
        ));

        let failure = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(%task_id, "listener cancelled");
                    break None;
                },
                event = events.next() => match event {
                    Some(event) => self.handle_event(event, policy, &mut dispatcher, &cancel).await,
                    None => {
                        warn!(%task_id, "event stream ended");
                        break Some("event stream ended".to_string());
                    },
                },
            }
        };
        // Ends the watcher when the stream closed on its own.
        cancel.cancel();

        // In-flight jobs finish on their own; nobody waits for them.
        tokio::spawn(dispatcher.drain());

        #[cfg(feature = "metrics")]
        counter!(listener_metrics::FAILURES_TOTAL).increment(u64::from(failure.is_some()));
        match self.state.mark_stopped(&task_id, failure).await {
            Ok(true) => info!(%task_id, "listener stopped"),
            Ok(false) => debug!(%task_id, "listener superseded by a newer run"),
            Err(e) => error!(%task_id, error = %e, "failed to persist listener stop"),
        }
    }

    async fn handle_event(
        &self,
        event: PlatformEvent,
        policy: MediaPolicy,
        dispatcher: &mut BoundedDispatcher,
        cancel: &CancellationToken,
    ) {
        #[cfg(feature = "metrics")]
        counter!(listener_metrics::EVENTS_RECEIVED_TOTAL).increment(1);

        let Some(channel_id) = event.channel_id() else {
            return;
        };
        match self.state.add_channel(channel_id).await {
            Ok(true) => info!(channel_id, "monitoring new channel"),
            Ok(false) => {},
            Err(e) => warn!(channel_id, error = %e, "could not record monitored channel"),
        }

        let message = event.into_message();
        if !policy.offloads() && MediaKind::classify(message.media.as_ref()).is_supported() {
            #[cfg(feature = "metrics")]
            counter!(listener_metrics::EVENTS_FILTERED_TOTAL).increment(1);
            debug!(channel_id, message_id = message.id, "media message filtered");
            return;
        }

        let message_id = message.id;
        let job = Arc::clone(&self.job);
        #[cfg(feature = "metrics")]
        counter!(listener_metrics::JOBS_DISPATCHED_TOTAL).increment(1);
        if !dispatcher
            .submit(async move { job.run(channel_id, message, policy).await }, cancel)
            .await
        {
            debug!(channel_id, message_id, "listener stopping, dropping message");
            return;
        }
        #[cfg(feature = "metrics")]
        gauge!(listener_metrics::JOBS_IN_FLIGHT).set(dispatcher.in_flight() as f64);
    }
}

/// Cancel `cancel` once the persisted status no longer shows `task_id` running.
async fn watch_status(
    state: Arc<ListenerStateManager>,
    task_id: String,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let mut tick = interval(poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = tick.tick() => match state.status().await {
                Ok(status) if !status.is_running || status.task_id.as_deref() != Some(task_id.as_str()) => {
                    info!(%task_id, "listener stopped through status store");
                    cancel.cancel();
                    return;
                },
                Ok(_) => {},
                Err(e) => warn!(%task_id, error = %e, "could not read listener status"),
            },
        }
    }
}
