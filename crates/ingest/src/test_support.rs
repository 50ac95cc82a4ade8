//! In-process doubles and a fully wired engine for unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    futures::{StreamExt, stream::BoxStream},
    tokio::sync::mpsc,
};

use crate::{
    Error, Result,
    backfill::{BackfillSettings, BatchSyncEngine},
    directory::ChannelDirectory,
    index_memory::InMemoryIndex,
    listener::{Listener, ListenerSettings},
    media::MediaOffloader,
    model::MessageRecord,
    normalize::Normalizer,
    objects::InMemoryObjectStore,
    platform::{
        ChannelEntity, Dialog, MessagingPlatform, PlatformEvent, RawMedia, RawMessage,
        SenderEntity,
    },
    reconcile::ReconciliationEngine,
    state::ListenerStateManager,
    store::StatusStore,
    store_memory::InMemoryStatusStore,
    tasks::{SyncTasks, TaskRegistry},
    writer::IndexWriter,
};

fn timestamp(message_id: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + message_id * 60, 0).unwrap()
}

pub(crate) fn message(id: i64, text: &str) -> RawMessage {
    RawMessage {
        id,
        date: timestamp(id),
        text: Some(text.to_string()),
        sender_id: None,
        sender: None,
        media: None,
    }
}

pub(crate) fn record(channel_id: i64, message_id: i64) -> MessageRecord {
    MessageRecord {
        channel_id,
        message_id,
        sender_name: "Unknown".into(),
        timestamp: timestamp(message_id),
        text: format!("message {message_id}"),
        media_references: Vec::new(),
        object_paths: Vec::new(),
        indexed_at: Utc::now(),
    }
}

fn platform_error(context: &str) -> Error {
    Error::platform(context, std::io::Error::other("fake platform failure"))
}

#[derive(Default)]
struct PlatformState {
    dialogs: Vec<Dialog>,
    /// Ascending by id.
    history: HashMap<i64, Vec<RawMessage>>,
    senders: HashMap<i64, SenderEntity>,
    media_bytes: Vec<u8>,
    fail_downloads: bool,
    stall_downloads: bool,
    download_calls: usize,
    fail_dialogs: bool,
    fail_history: bool,
    fail_subscribe: bool,
    history_budget: Option<usize>,
    subscriptions: usize,
    streams: Vec<mpsc::UnboundedSender<PlatformEvent>>,
}

/// Scriptable [`MessagingPlatform`]. Channel history ids run from 1 upwards.
pub(crate) struct FakePlatform {
    inner: Mutex<PlatformState>,
}

impl FakePlatform {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(PlatformState {
                media_bytes: b"\xff\xd8\xff\xe0fake-jpeg".to_vec(),
                ..PlatformState::default()
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut PlatformState) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }

    pub(crate) fn add_channel(&self, id: i64, title: &str, messages: i64) {
        self.with(|s| {
            s.dialogs.push(Dialog {
                entity: ChannelEntity {
                    id,
                    title: title.to_string(),
                    username: None,
                },
                is_channel: true,
            });
            s.history.insert(
                id,
                (1..=messages)
                    .map(|m| message(m, &format!("message {m}")))
                    .collect(),
            );
        });
    }

    pub(crate) fn add_group(&self, id: i64, title: &str) {
        self.with(|s| {
            s.dialogs.push(Dialog {
                entity: ChannelEntity {
                    id,
                    title: title.to_string(),
                    username: None,
                },
                is_channel: false,
            });
        });
    }

    /// Append `count` messages newer than anything in the channel.
    pub(crate) fn append_messages(&self, channel_id: i64, count: i64) {
        self.with(|s| {
            let history = s.history.entry(channel_id).or_default();
            let last = history.last().map_or(0, |m| m.id);
            history.extend((last + 1..=last + count).map(|m| message(m, &format!("message {m}"))));
        });
    }

    pub(crate) fn set_media(&self, channel_id: i64, message_id: i64, media: RawMedia) {
        self.with(|s| {
            if let Some(m) = s
                .history
                .get_mut(&channel_id)
                .and_then(|h| h.iter_mut().find(|m| m.id == message_id))
            {
                m.media = Some(media);
            }
        });
    }

    pub(crate) fn add_sender(&self, id: i64, entity: SenderEntity) {
        self.with(|s| s.senders.insert(id, entity));
    }

    pub(crate) fn set_media_bytes(&self, bytes: Vec<u8>) {
        self.with(|s| s.media_bytes = bytes);
    }

    pub(crate) fn fail_downloads(&self, fail: bool) {
        self.with(|s| s.fail_downloads = fail);
    }

    /// Downloads never complete while set.
    pub(crate) fn stall_downloads(&self, stall: bool) {
        self.with(|s| s.stall_downloads = stall);
    }

    pub(crate) fn download_calls(&self) -> usize {
        self.with(|s| s.download_calls)
    }

    pub(crate) fn fail_dialogs(&self, fail: bool) {
        self.with(|s| s.fail_dialogs = fail);
    }

    pub(crate) fn fail_history(&self, fail: bool) {
        self.with(|s| s.fail_history = fail);
    }

    /// History calls succeed `calls` more times, then fail.
    pub(crate) fn fail_history_after(&self, calls: usize) {
        self.with(|s| s.history_budget = Some(calls));
    }

    pub(crate) fn fail_subscribe(&self, fail: bool) {
        self.with(|s| s.fail_subscribe = fail);
    }

    pub(crate) fn subscriptions(&self) -> usize {
        self.with(|s| s.subscriptions)
    }

    /// Deliver an event to every open subscription.
    pub(crate) fn push(&self, event: PlatformEvent) {
        self.with(|s| s.streams.retain(|tx| tx.send(event.clone()).is_ok()));
    }

    /// End every open subscription.
    pub(crate) fn close_streams(&self) {
        self.with(|s| s.streams.clear());
    }
}

#[async_trait]
impl MessagingPlatform for FakePlatform {
    async fn dialogs(&self) -> Result<Vec<Dialog>> {
        self.with(|s| {
            if s.fail_dialogs {
                return Err(platform_error("listing dialogs"));
            }
            Ok(s.dialogs.clone())
        })
    }

    async fn get_messages(
        &self,
        channel_id: i64,
        limit: usize,
        offset_id: i64,
    ) -> Result<Vec<RawMessage>> {
        self.with(|s| {
            if s.fail_history {
                return Err(platform_error("fetching history"));
            }
            if let Some(budget) = s.history_budget.as_mut() {
                if *budget == 0 {
                    return Err(platform_error("fetching history"));
                }
                *budget -= 1;
            }
            let history = s
                .history
                .get(&channel_id)
                .ok_or_else(|| Error::NotAccessible { channel_id })?;
            Ok(history
                .iter()
                .rev()
                .filter(|m| offset_id == 0 || m.id < offset_id)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    async fn get_message(&self, channel_id: i64, message_id: i64) -> Result<Option<RawMessage>> {
        self.with(|s| {
            Ok(s.history
                .get(&channel_id)
                .and_then(|h| h.iter().find(|m| m.id == message_id).cloned()))
        })
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, PlatformEvent>> {
        let rx = self.with(|s| {
            if s.fail_subscribe {
                return Err(platform_error("subscribing to updates"));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            s.streams.push(tx);
            s.subscriptions += 1;
            Ok(rx)
        })?;
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }

    async fn download_media(&self, _media: &RawMedia) -> Result<Vec<u8>> {
        let stall = self.with(|s| {
            s.download_calls += 1;
            s.stall_downloads
        });
        if stall {
            std::future::pending::<()>().await;
        }
        self.with(|s| {
            if s.fail_downloads {
                return Err(platform_error("downloading media"));
            }
            Ok(s.media_bytes.clone())
        })
    }

    async fn resolve_sender(&self, sender_id: i64) -> Result<SenderEntity> {
        self.with(|s| {
            s.senders
                .get(&sender_id)
                .cloned()
                .ok_or_else(|| platform_error("resolving sender"))
        })
    }
}

/// Every component wired over in-memory backends, with no pacing delays.
pub(crate) struct Fixture {
    pub platform: Arc<FakePlatform>,
    pub index: Arc<InMemoryIndex>,
    pub objects: Arc<InMemoryObjectStore>,
    pub store: Arc<dyn StatusStore>,
    pub state: Arc<ListenerStateManager>,
    pub writer: Arc<IndexWriter>,
    pub directory: Arc<ChannelDirectory>,
    pub normalizer: Arc<Normalizer>,
    pub backfill: Arc<BatchSyncEngine>,
    pub reconciler: Arc<ReconciliationEngine>,
    pub listener: Arc<Listener>,
    pub tasks: SyncTasks,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        Self::with_listener_settings(ListenerSettings {
            poll_interval: Duration::from_millis(10),
            max_in_flight: 4,
        })
    }

    pub(crate) fn with_listener_settings(listener_settings: ListenerSettings) -> Self {
        let platform = Arc::new(FakePlatform::new());
        let index = Arc::new(InMemoryIndex::new());
        let objects = Arc::new(InMemoryObjectStore::new(
            "http://localhost:9000",
            "telegram-images",
        ));
        let store: Arc<dyn StatusStore> = Arc::new(InMemoryStatusStore::new());
        let state = Arc::new(ListenerStateManager::new(Arc::clone(&store)));
        let writer = Arc::new(IndexWriter::new(index.clone(), "messages", "channels", 500));
        let directory = Arc::new(ChannelDirectory::new(
            platform.clone(),
            Arc::clone(&writer),
            Arc::clone(&state),
        ));
        let normalizer = Arc::new(Normalizer::new(
            platform.clone(),
            MediaOffloader::new(platform.clone(), objects.clone()),
        ));
        let backfill = Arc::new(BatchSyncEngine::new(
            platform.clone(),
            Arc::clone(&normalizer),
            Arc::clone(&writer),
            BackfillSettings {
                page_size: 100,
                page_delay: Duration::ZERO,
                window_page_delay: Duration::ZERO,
                media_parallelism: 4,
                max_batch_size: 1000,
            },
        ));
        let reconciler = Arc::new(ReconciliationEngine::new(
            Arc::clone(&directory),
            Arc::clone(&writer),
            Arc::clone(&backfill),
            20,
        ));
        let listener = Arc::new(Listener::new(
            Arc::clone(&state),
            Arc::clone(&directory),
            platform.clone(),
            Arc::clone(&normalizer),
            Arc::clone(&writer),
            listener_settings,
        ));
        let tasks = SyncTasks::new(
            Arc::new(TaskRegistry::new()),
            Arc::clone(&reconciler),
            Arc::clone(&backfill),
            5,
        );

        Self {
            platform,
            index,
            objects,
            store,
            state,
            writer,
            directory,
            normalizer,
            backfill,
            reconciler,
            listener,
            tasks,
        }
    }
}
