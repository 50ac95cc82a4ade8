//! Channel discovery and the `channels` catalogue.

use std::sync::Arc;

use {
    serde::{Deserialize, Serialize},
    tracing::{info, warn},
};

use crate::{
    Result,
    model::ChannelRecord,
    platform::{ChannelEntity, MessagingPlatform},
    state::ListenerStateManager,
    writer::IndexWriter,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogueReport {
    pub discovered: usize,
    pub added: usize,
    pub index_failed: usize,
}

pub struct ChannelDirectory {
    platform: Arc<dyn MessagingPlatform>,
    writer: Arc<IndexWriter>,
    state: Arc<ListenerStateManager>,
}

impl ChannelDirectory {
    pub fn new(
        platform: Arc<dyn MessagingPlatform>,
        writer: Arc<IndexWriter>,
        state: Arc<ListenerStateManager>,
    ) -> Self {
        Self {
            platform,
            writer,
            state,
        }
    }

    /// Channels reachable through the account's dialogs.
    pub async fn channels(&self) -> Result<Vec<ChannelEntity>> {
        let dialogs = self.platform.dialogs().await?;
        Ok(dialogs
            .into_iter()
            .filter(|d| d.is_channel)
            .map(|d| d.entity)
            .collect())
    }

    /// Channel ids for a sync run. Discovery errors yield an empty list.
    pub async fn reachable_channel_ids(&self) -> Vec<i64> {
        match self.channels().await {
            Ok(channels) => {
                info!(count = channels.len(), "discovered channels");
                channels.into_iter().map(|c| c.id).collect()
            },
            Err(e) => {
                warn!(error = %e, "channel discovery failed");
                Vec::new()
            },
        }
    }

    /// Latest message id on the platform, `None` for an empty channel.
    pub async fn remote_last_id(&self, channel_id: i64) -> Result<Option<i64>> {
        let latest = self.platform.get_messages(channel_id, 1, 0).await?;
        Ok(latest.first().map(|m| m.id))
    }

    /// Add every reachable channel to the monitored set.
    pub async fn discover_into_monitoring(&self) -> Result<Vec<i64>> {
        let channels = self.channels().await?;
        let mut ids = Vec::with_capacity(channels.len());
        for channel in channels {
            self.state.add_channel(channel.id).await?;
            ids.push(channel.id);
        }
        Ok(ids)
    }

    /// Upsert channels missing from the catalogue. Existing entries are left
    /// alone; message counts are best effort.
    pub async fn sync_catalogue(&self) -> Result<CatalogueReport> {
        let channels = self.channels().await?;
        let ids: Vec<i64> = channels.iter().map(|c| c.id).collect();
        let known = self.writer.known_channel_ids(&ids).await?;

        let mut fresh = Vec::new();
        for channel in channels.into_iter().filter(|c| !known.contains(&c.id)) {
            let message_count = match self.remote_last_id(channel.id).await {
                Ok(last) => last.unwrap_or(0),
                Err(e) => {
                    warn!(channel_id = channel.id, error = %e, "could not read message count");
                    0
                },
            };
            fresh.push(ChannelRecord {
                id: channel.id,
                title: channel.title,
                username: channel.username,
                message_count,
            });
        }

        let outcome = self.writer.write_channels(&fresh).await?;
        let report = CatalogueReport {
            discovered: ids.len(),
            added: outcome.success,
            index_failed: outcome.failed,
        };
        info!(
            discovered = report.discovered,
            added = report.added,
            "channel catalogue synced"
        );
        Ok(report)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use crate::test_support::Fixture;

    #[tokio::test]
    async fn catalogue_adds_only_new_channels() {
        let fx = Fixture::new();
        fx.platform.add_channel(1, "One", 5);
        fx.platform.add_channel(2, "Two", 0);
        fx.platform.add_group(3, "Not a channel");

        let first = fx.directory.sync_catalogue().await.unwrap();
        assert_eq!(first.discovered, 2);
        assert_eq!(first.added, 2);
        let one = fx.index.get("channels", "1").unwrap();
        assert_eq!(one["message_count"], 5);
        assert_eq!(fx.index.get("channels", "2").unwrap()["message_count"], 0);

        fx.platform.add_channel(4, "Four", 1);
        let second = fx.directory.sync_catalogue().await.unwrap();
        assert_eq!(second.discovered, 3);
        assert_eq!(second.added, 1);
    }

    #[tokio::test]
    async fn discovery_feeds_monitored_set() {
        let fx = Fixture::new();
        fx.platform.add_channel(8, "Eight", 1);
        fx.platform.add_channel(9, "Nine", 1);
        let ids = fx.directory.discover_into_monitoring().await.unwrap();
        assert_eq!(ids, [8, 9]);
        assert_eq!(fx.state.monitored_channels().await.unwrap(), [8, 9]);
    }

    #[tokio::test]
    async fn discovery_errors_yield_no_channels() {
        let fx = Fixture::new();
        fx.platform.add_channel(1, "One", 1);
        fx.platform.fail_dialogs(true);
        assert!(fx.directory.reachable_channel_ids().await.is_empty());
    }
}
