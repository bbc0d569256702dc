//! Canonical envelope types for the event bus.
//!
//! The [`CanonicalEnvelope`] is the normalized representation of an inbound
//! message, independent of source platform. Providers build one from each
//! platform event they accept; the envelope is immutable once published.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::connection::{ConnectionRef, Platform};

/// Message direction at the bus boundary.
///
/// Only inbound envelopes cross the event bus; outbound traffic travels as
/// delivery tasks through the dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Types of media that can be attached to messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Image files (PNG, JPG, GIF, etc.)
    Image,
    /// Audio files (MP3, WAV, OGG, etc.)
    Audio,
    /// Video files (MP4, WebM, etc.)
    Video,
    /// Document files (PDF, DOCX, etc.)
    Document,
}

/// A typed media reference carried on an envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAttachment {
    /// The type of media.
    pub media_type: MediaType,
    /// URL to the media as reported by the platform.
    pub url: Option<String>,
    /// Original filename, when the platform provides one.
    pub filename: Option<String>,
    /// MIME type, when the platform provides one.
    pub mime_type: Option<String>,
}

impl MediaAttachment {
    /// Creates a new media attachment of the specified type.
    pub fn new(media_type: MediaType) -> Self {
        Self {
            media_type,
            url: None,
            filename: None,
            mime_type: None,
        }
    }

    /// Sets the URL for the media (builder pattern).
    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    /// Sets the filename (builder pattern).
    pub fn with_filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }

    /// Sets the MIME type (builder pattern).
    pub fn with_mime_type(mut self, mime: &str) -> Self {
        self.mime_type = Some(mime.to_string());
        self
    }
}

/// Normalized representation of one inbound message.
///
/// # Example
///
/// ```
/// use omnigate::bus::CanonicalEnvelope;
/// use omnigate::connection::{ConnectionRef, Platform};
///
/// let env = CanonicalEnvelope::new(
///     Platform::Telegram,
///     ConnectionRef::new("proj", "conn"),
///     "253191879",
///     "user42",
///     "hello",
/// );
/// assert_eq!(env.channel, Platform::Telegram);
/// assert_eq!(env.chat_id, "253191879");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEnvelope {
    /// Gateway-assigned unique id.
    pub id: String,
    /// Source platform.
    pub channel: Platform,
    /// The connection this message arrived on.
    pub connection_ref: ConnectionRef,
    /// Always [`Direction::Inbound`] at this boundary.
    pub direction: Direction,
    /// Platform-native conversation identifier.
    pub chat_id: String,
    /// Platform-native sender identifier.
    pub sender_id: String,
    /// Text content, empty when the message carried only media.
    pub text: String,
    /// Ordered media references.
    pub attachments: Vec<MediaAttachment>,
    /// When the gateway accepted the message.
    pub received_at: DateTime<Utc>,
    /// Opaque platform payload retained for audit.
    pub raw: Value,
}

impl CanonicalEnvelope {
    /// Creates an inbound envelope with a fresh gateway id.
    pub fn new(
        channel: Platform,
        connection_ref: ConnectionRef,
        chat_id: &str,
        sender_id: &str,
        text: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel,
            connection_ref,
            direction: Direction::Inbound,
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            attachments: Vec::new(),
            received_at: Utc::now(),
            raw: Value::Null,
        }
    }

    /// Appends a media attachment (builder pattern).
    pub fn with_attachment(mut self, attachment: MediaAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Retains the raw platform payload for audit (builder pattern).
    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = raw;
        self
    }

    /// Whether the envelope carries any media.
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> CanonicalEnvelope {
        CanonicalEnvelope::new(
            Platform::Discord,
            ConnectionRef::new("proj", "conn"),
            "chan-1",
            "user-1",
            "hi there",
        )
    }

    #[test]
    fn test_envelope_defaults() {
        let env = envelope();
        assert_eq!(env.direction, Direction::Inbound);
        assert!(!env.id.is_empty());
        assert!(env.attachments.is_empty());
        assert_eq!(env.raw, Value::Null);
    }

    #[test]
    fn test_envelope_ids_unique() {
        assert_ne!(envelope().id, envelope().id);
    }

    #[test]
    fn test_envelope_with_attachment() {
        let env = envelope().with_attachment(
            MediaAttachment::new(MediaType::Image)
                .with_url("https://example.com/a.png")
                .with_filename("a.png")
                .with_mime_type("image/png"),
        );
        assert!(env.has_attachments());
        assert_eq!(env.attachments[0].media_type, MediaType::Image);
        assert_eq!(
            env.attachments[0].url.as_deref(),
            Some("https://example.com/a.png")
        );
    }

    #[test]
    fn test_envelope_attachment_order_preserved() {
        let env = envelope()
            .with_attachment(MediaAttachment::new(MediaType::Image).with_filename("1"))
            .with_attachment(MediaAttachment::new(MediaType::Video).with_filename("2"));
        assert_eq!(env.attachments[0].filename.as_deref(), Some("1"));
        assert_eq!(env.attachments[1].filename.as_deref(), Some("2"));
    }

    #[test]
    fn test_envelope_retains_raw_payload() {
        let raw = json!({"update_id": 7, "message": {"text": "hi"}});
        let env = envelope().with_raw(raw.clone());
        assert_eq!(env.raw, raw);
    }

    #[test]
    fn test_envelope_serialization_round_trip() {
        let env = envelope().with_raw(json!({"k": "v"}));
        let encoded = serde_json::to_string(&env).unwrap();
        let decoded: CanonicalEnvelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, env.id);
        assert_eq!(decoded.channel, Platform::Discord);
        assert_eq!(decoded.chat_id, "chan-1");
    }
}
