//! Wiring of every engine component from a [`TeleindexConfig`].

use std::sync::Arc;

use {teleindex_config::TeleindexConfig, tracing::info};

use crate::{
    backfill::{BackfillSettings, BatchSyncEngine},
    directory::ChannelDirectory,
    index::IndexStore,
    listener::{Listener, ListenerSettings},
    media::MediaOffloader,
    normalize::Normalizer,
    objects::ObjectStore,
    platform::MessagingPlatform,
    reconcile::ReconciliationEngine,
    state::ListenerStateManager,
    store::StatusStore,
    tasks::{SyncTasks, TaskRegistry, TaskRetention},
    writer::IndexWriter,
};

/// All components sharing one set of backends.
pub struct IngestEngine {
    state: Arc<ListenerStateManager>,
    writer: Arc<IndexWriter>,
    directory: Arc<ChannelDirectory>,
    backfill: Arc<BatchSyncEngine>,
    reconciler: Arc<ReconciliationEngine>,
    listener: Arc<Listener>,
    tasks: SyncTasks,
}

impl IngestEngine {
    pub fn new(
        config: &TeleindexConfig,
        platform: Arc<dyn MessagingPlatform>,
        index: Arc<dyn IndexStore>,
        objects: Arc<dyn ObjectStore>,
        store: Arc<dyn StatusStore>,
    ) -> Self {
        let state = Arc::new(ListenerStateManager::new(store));
        let writer = Arc::new(IndexWriter::new(
            index,
            config.index.messages.clone(),
            config.index.channels.clone(),
            config.index.bulk_chunk_size,
        ));
        let directory = Arc::new(ChannelDirectory::new(
            Arc::clone(&platform),
            Arc::clone(&writer),
            Arc::clone(&state),
        ));
        let normalizer = Arc::new(Normalizer::new(
            Arc::clone(&platform),
            MediaOffloader::new(Arc::clone(&platform), objects),
        ));
        let backfill = Arc::new(BatchSyncEngine::new(
            Arc::clone(&platform),
            Arc::clone(&normalizer),
            Arc::clone(&writer),
            BackfillSettings::from(&config.backfill),
        ));
        let reconciler = Arc::new(ReconciliationEngine::new(
            Arc::clone(&directory),
            Arc::clone(&writer),
            Arc::clone(&backfill),
            config.sync.max_parallel_limit,
        ));
        let listener = Arc::new(Listener::new(
            Arc::clone(&state),
            Arc::clone(&directory),
            platform,
            normalizer,
            Arc::clone(&writer),
            ListenerSettings::from(&config.listener),
        ));
        let tasks = SyncTasks::new(
            Arc::new(TaskRegistry::with_retention(TaskRetention::from(&config.sync))),
            Arc::clone(&reconciler),
            Arc::clone(&backfill),
            config.sync.default_max_parallel,
        );

        info!(
            messages_index = %config.index.messages,
            channels_index = %config.index.channels,
            "ingest engine ready"
        );
        Self {
            state,
            writer,
            directory,
            backfill,
            reconciler,
            listener,
            tasks,
        }
    }

    pub fn state(&self) -> &Arc<ListenerStateManager> {
        &self.state
    }

    pub fn writer(&self) -> &Arc<IndexWriter> {
        &self.writer
    }

    pub fn directory(&self) -> &Arc<ChannelDirectory> {
        &self.directory
    }

    pub fn backfill(&self) -> &Arc<BatchSyncEngine> {
        &self.backfill
    }

    pub fn reconciler(&self) -> &Arc<ReconciliationEngine> {
        &self.reconciler
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    pub fn tasks(&self) -> &SyncTasks {
        &self.tasks
    }
}
