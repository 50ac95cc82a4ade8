//! Media classification, markers and offload to object storage.

use std::sync::Arc;

use tracing::debug;

#[cfg(feature = "metrics")]
use teleindex_metrics::{counter, media as media_metrics};

use crate::{
    Result,
    objects::ObjectStore,
    platform::{MessagingPlatform, RawMedia},
};

/// Media kinds the engine handles. Decided once per message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaKind {
    None,
    Photo { id: i64 },
    Document { id: i64, mime: Option<String> },
}

impl MediaKind {
    #[must_use]
    pub fn classify(media: Option<&RawMedia>) -> Self {
        match media {
            Some(RawMedia::Photo { id }) => Self::Photo { id: *id },
            Some(RawMedia::Document { id, mime_type }) => Self::Document {
                id: *id,
                mime: mime_type.clone(),
            },
            Some(RawMedia::Other { .. }) | None => Self::None,
        }
    }

    #[must_use]
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// File extension and content type used when storing the media.
    #[must_use]
    pub fn file_type(&self) -> (&'static str, &'static str) {
        let mime = match self {
            Self::Document {
                mime: Some(mime), ..
            } => mime.as_str(),
            _ => "",
        };
        if mime.contains("png") {
            ("png", "image/png")
        } else if mime.contains("gif") {
            ("gif", "image/gif")
        } else if mime.contains("webp") {
            ("webp", "image/webp")
        } else {
            ("jpg", "image/jpeg")
        }
    }

    /// Platform-native reference kept when media is not offloaded.
    ///
    /// Only image documents get a marker.
    #[must_use]
    pub fn marker(&self) -> Option<String> {
        match self {
            Self::Photo { id } => Some(format!("telegram_photo_{id}")),
            Self::Document {
                id,
                mime: Some(mime),
            } if mime.starts_with("image/") => Some(format!("telegram_document_{id}")),
            Self::Document { .. } | Self::None => None,
        }
    }
}

#[must_use]
pub fn object_name(channel_id: i64, message_id: i64, extension: &str) -> String {
    format!("channel_{channel_id}/message_{message_id}.{extension}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offloaded {
    pub url: String,
    pub object_path: String,
}

/// Downloads media from the platform and uploads it to object storage.
pub struct MediaOffloader {
    platform: Arc<dyn MessagingPlatform>,
    objects: Arc<dyn ObjectStore>,
}

impl MediaOffloader {
    pub fn new(platform: Arc<dyn MessagingPlatform>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { platform, objects }
    }

    /// Returns `Ok(None)` for unsupported kinds and empty downloads.
    pub async fn offload(
        &self,
        channel_id: i64,
        message_id: i64,
        kind: &MediaKind,
        media: &RawMedia,
    ) -> Result<Option<Offloaded>> {
        if !kind.is_supported() {
            return Ok(None);
        }

        let bytes = self.platform.download_media(media).await.inspect_err(|_| {
            #[cfg(feature = "metrics")]
            counter!(media_metrics::FAILURES_TOTAL).increment(1);
        })?;
        if bytes.is_empty() {
            debug!(channel_id, message_id, "empty media download, nothing to store");
            return Ok(None);
        }

        let (extension, content_type) = kind.file_type();
        let object_path = object_name(channel_id, message_id, extension);
        #[cfg(feature = "metrics")]
        let size = bytes.len() as u64;

        let url = self
            .objects
            .upload(&object_path, bytes, content_type)
            .await
            .inspect_err(|_| {
                #[cfg(feature = "metrics")]
                counter!(media_metrics::FAILURES_TOTAL).increment(1);
            })?;

        #[cfg(feature = "metrics")]
        {
            counter!(media_metrics::UPLOADS_TOTAL).increment(1);
            counter!(media_metrics::BYTES_TOTAL).increment(size);
        }
        debug!(channel_id, message_id, %url, "stored media");

        Ok(Some(Offloaded { url, object_path }))
    }
}
