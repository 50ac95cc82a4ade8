//! Contract for the messaging platform the engine ingests from.

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    futures::stream::BoxStream,
};

use crate::Result;

/// Who sent a message, as far as the platform tells us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderEntity {
    User {
        first_name: Option<String>,
        last_name: Option<String>,
        username: Option<String>,
    },
    Chat {
        title: Option<String>,
        username: Option<String>,
    },
    Channel {
        title: Option<String>,
        username: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEntity {
    pub id: i64,
    pub title: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialog {
    pub entity: ChannelEntity,
    pub is_channel: bool,
}

/// Media attached to a message, as delivered by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMedia {
    Photo { id: i64 },
    Document { id: i64, mime_type: Option<String> },
    /// Polls, geo points, web pages and anything else the engine ignores.
    Other { kind: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub text: Option<String>,
    pub sender_id: Option<i64>,
    pub sender: Option<SenderEntity>,
    pub media: Option<RawMedia>,
}

/// Peer a pushed message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Channel(i64),
    Chat(i64),
    User(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    NewMessage { peer: Peer, message: RawMessage },
}

impl PlatformEvent {
    /// Channel the event belongs to; `None` for non-channel peers.
    #[must_use]
    pub fn channel_id(&self) -> Option<i64> {
        match self {
            Self::NewMessage {
                peer: Peer::Channel(id),
                ..
            } => Some(*id),
            Self::NewMessage { .. } => None,
        }
    }

    #[must_use]
    pub fn message(&self) -> &RawMessage {
        match self {
            Self::NewMessage { message, .. } => message,
        }
    }

    #[must_use]
    pub fn into_message(self) -> RawMessage {
        match self {
            Self::NewMessage { message, .. } => message,
        }
    }
}

/// Messaging platform client.
///
/// `get_messages` returns messages newest-first with ids strictly below
/// `offset_id`; an `offset_id` of 0 starts at the newest message.
#[async_trait]
pub trait MessagingPlatform: Send + Sync {
    async fn dialogs(&self) -> Result<Vec<Dialog>>;
    async fn get_messages(
        &self,
        channel_id: i64,
        limit: usize,
        offset_id: i64,
    ) -> Result<Vec<RawMessage>>;
    async fn get_message(&self, channel_id: i64, message_id: i64) -> Result<Option<RawMessage>>;
    async fn subscribe(&self) -> Result<BoxStream<'static, PlatformEvent>>;
    async fn download_media(&self, media: &RawMedia) -> Result<Vec<u8>>;
    async fn resolve_sender(&self, sender_id: i64) -> Result<SenderEntity>;
}
