//! Batched, idempotent writes of canonical records into the search index.

use std::{collections::HashSet, sync::Arc};

use {serde_json::Value, tracing::{debug, error}};

#[cfg(feature = "metrics")]
use teleindex_metrics::{counter, histogram, index as index_metrics};

use crate::{
    Result,
    index::{BulkOutcome, IndexStore, SearchRequest, TermFilter},
    model::{ChannelRecord, ChannelStats, MessageRecord},
};

pub struct IndexWriter {
    index: Arc<dyn IndexStore>,
    messages_index: String,
    channels_index: String,
    chunk_size: usize,
}

impl IndexWriter {
    pub fn new(
        index: Arc<dyn IndexStore>,
        messages_index: impl Into<String>,
        channels_index: impl Into<String>,
        chunk_size: usize,
    ) -> Self {
        Self {
            index,
            messages_index: messages_index.into(),
            channels_index: channels_index.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Upsert message records in chunks.
    ///
    /// A chunk rejected as a whole counts every document in it as failed.
    pub async fn write(&self, records: &[MessageRecord]) -> Result<BulkOutcome> {
        let mut docs = Vec::with_capacity(records.len());
        for record in records {
            docs.push((record.doc_id(), serde_json::to_value(record)?));
        }
        Ok(self.bulk(&self.messages_index, docs).await)
    }

    /// Upsert channel records.
    pub async fn write_channels(&self, channels: &[ChannelRecord]) -> Result<BulkOutcome> {
        let mut docs = Vec::with_capacity(channels.len());
        for channel in channels {
            docs.push((channel.doc_id(), serde_json::to_value(channel)?));
        }
        Ok(self.bulk(&self.channels_index, docs).await)
    }

    async fn bulk(&self, index: &str, docs: Vec<(String, Value)>) -> BulkOutcome {
        let mut total = BulkOutcome::default();
        let mut docs = docs.into_iter().peekable();
        while docs.peek().is_some() {
            let chunk: Vec<_> = docs.by_ref().take(self.chunk_size).collect();
            let len = chunk.len();
            #[cfg(feature = "metrics")]
            let started = std::time::Instant::now();

            let outcome = match self.index.bulk_upsert(index, chunk).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(index, documents = len, error = %e, "bulk upsert failed");
                    BulkOutcome {
                        success: 0,
                        failed: len,
                    }
                },
            };

            #[cfg(feature = "metrics")]
            {
                histogram!(index_metrics::BULK_DURATION_SECONDS)
                    .record(started.elapsed().as_secs_f64());
                counter!(index_metrics::DOCUMENTS_UPSERTED_TOTAL).increment(outcome.success as u64);
                counter!(index_metrics::DOCUMENTS_FAILED_TOTAL).increment(outcome.failed as u64);
            }
            total += outcome;
        }
        debug!(index, success = total.success, failed = total.failed, "bulk write finished");
        total
    }

    /// Highest indexed message id of a channel.
    pub async fn last_indexed_id(&self, channel_id: i64) -> Result<Option<i64>> {
        let hits = self
            .index
            .search(
                &self.messages_index,
                SearchRequest::new(1)
                    .term("channel_id", channel_id)
                    .sort_desc("message_id"),
            )
            .await?;
        Ok(hits
            .hits
            .first()
            .and_then(|hit| hit.source.get("message_id"))
            .and_then(Value::as_i64))
    }

    /// Message count and last id for one channel.
    pub async fn channel_stats(&self, channel_id: i64) -> Result<ChannelStats> {
        let total_messages = self
            .index
            .count(&self.messages_index, vec![TermFilter::new(
                "channel_id",
                channel_id,
            )])
            .await?;
        let last_message_id = self.last_indexed_id(channel_id).await?;
        Ok(ChannelStats {
            channel_id,
            total_messages,
            last_message_id,
            has_data: total_messages > 0,
        })
    }

    /// Ids already present in the channels index, out of `candidates`.
    pub async fn known_channel_ids(&self, candidates: &[i64]) -> Result<HashSet<i64>> {
        let mut known = HashSet::new();
        for id in candidates {
            let count = self
                .index
                .count(&self.channels_index, vec![TermFilter::new("id", *id)])
                .await?;
            if count > 0 {
                known.insert(*id);
            }
        }
        Ok(known)
    }
}
