//! Raw platform message to [`MessageRecord`].

use std::sync::Arc;

use {chrono::Utc, tracing::warn};

use crate::{
    media::{MediaKind, MediaOffloader},
    model::{MediaPolicy, MessageRecord},
    platform::{MessagingPlatform, RawMessage, SenderEntity},
};

/// Why a message was left out of a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("media offload failed: {0}")]
    Media(String),
    #[error("malformed message: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub record: MessageRecord,
    /// Objects stored in object storage for this message.
    pub images_downloaded: usize,
}

pub struct Normalizer {
    platform: Arc<dyn MessagingPlatform>,
    offloader: MediaOffloader,
}

impl Normalizer {
    pub fn new(platform: Arc<dyn MessagingPlatform>, offloader: MediaOffloader) -> Self {
        Self {
            platform,
            offloader,
        }
    }

    pub async fn normalize(
        &self,
        raw: &RawMessage,
        channel_id: i64,
        policy: MediaPolicy,
    ) -> Result<Normalized, SkipReason> {
        if raw.id <= 0 {
            return Err(SkipReason::Malformed(format!("message id {}", raw.id)));
        }

        let sender_name = self.sender_name(raw).await;
        let media = MediaKind::classify(raw.media.as_ref());

        let mut media_references = Vec::new();
        let mut object_paths = Vec::new();
        match (policy, raw.media.as_ref()) {
            (MediaPolicy::Offload, Some(raw_media)) if media.is_supported() => {
                let stored = self
                    .offloader
                    .offload(channel_id, raw.id, &media, raw_media)
                    .await
                    .map_err(|e| SkipReason::Media(e.to_string()))?;
                if let Some(stored) = stored {
                    media_references.push(stored.url);
                    object_paths.push(stored.object_path);
                }
            },
            (MediaPolicy::Markers, _) => media_references.extend(media.marker()),
            _ => {},
        }

        let images_downloaded = object_paths.len();
        Ok(Normalized {
            record: MessageRecord {
                channel_id,
                message_id: raw.id,
                sender_name,
                timestamp: raw.date,
                text: raw.text.clone().unwrap_or_default(),
                media_references,
                object_paths,
                indexed_at: Utc::now(),
            },
            images_downloaded,
        })
    }

    /// Sender entity first, then a lookup by id, then `User_<id>`; `Unknown`
    /// without an id.
    pub async fn sender_name(&self, raw: &RawMessage) -> String {
        if let Some(name) = raw.sender.as_ref().and_then(display_name) {
            return name;
        }
        let Some(sender_id) = raw.sender_id else {
            return "Unknown".to_string();
        };
        match self.platform.resolve_sender(sender_id).await {
            Ok(entity) => display_name(&entity).unwrap_or_else(|| format!("User_{sender_id}")),
            Err(e) => {
                warn!(sender_id, message_id = raw.id, error = %e, "sender lookup failed");
                format!("User_{sender_id}")
            },
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Display name from entity fields, `None` when every field is empty.
#[must_use]
pub fn display_name(entity: &SenderEntity) -> Option<String> {
    match entity {
        SenderEntity::User {
            first_name,
            last_name,
            username,
        } => {
            let full = [non_empty(first_name.as_ref()), non_empty(last_name.as_ref())]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            if full.is_empty() {
                non_empty(username.as_ref())
            } else {
                Some(full)
            }
        },
        SenderEntity::Chat { title, username } | SenderEntity::Channel { title, username } => {
            non_empty(title.as_ref()).or_else(|| non_empty(username.as_ref()))
        },
    }
}
