//! Rich embed model and the lossy-but-never-fatal field handling around it.
//!
//! Embeds are cosmetic: a bad color, an unparsable timestamp or an unsafe
//! URL drops that field with a logged warning and the send proceeds.
//! Partial-embed delivery is preferred over total failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::security::is_public_http_url;

/// Author block of an embed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub icon_url: Option<String>,
}

/// Footer block of an embed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
    #[serde(default)]
    pub icon_url: Option<String>,
}

/// One name/value field of an embed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

/// Platform-independent rich embed attached to an outbound message.
///
/// `color` and `timestamp` are kept as the caller-supplied strings; parsing
/// happens at send time so the same embed can be re-validated on every
/// attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageEmbed {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// `#RRGGBB` hex string or decimal integer string.
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub author: Option<EmbedAuthor>,
    #[serde(default)]
    pub footer: Option<EmbedFooter>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub fields: Vec<EmbedField>,
    /// RFC 3339 timestamp string.
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Parses an embed color into an integer in `[0, 0xFFFFFF]`.
///
/// Accepts `#RRGGBB` hex or a decimal integer string. Out-of-range or
/// unparsable values yield `None`; the embed proceeds without a color.
///
/// # Example
///
/// ```
/// use omnigate::providers::parse_embed_color;
///
/// assert_eq!(parse_embed_color("#FF5733"), Some(16734003));
/// assert_eq!(parse_embed_color("16734003"), Some(16734003));
/// assert_eq!(parse_embed_color("not-a-color"), None);
/// ```
pub fn parse_embed_color(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    let value = if let Some(hex) = raw.strip_prefix('#') {
        if hex.len() != 6 {
            return None;
        }
        u32::from_str_radix(hex, 16).ok()?
    } else {
        raw.parse::<u32>().ok()?
    };

    if value <= 0xFF_FF_FF {
        Some(value)
    } else {
        None
    }
}

/// Parses an embed timestamp, tolerating absence and garbage.
pub fn parse_embed_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Re-validates every URL field of an embed immediately before use.
///
/// Runs independently of any validation performed at embed-authoring time,
/// so stale or substituted URLs never bypass the check. Unsafe URLs are
/// dropped with a logged warning; the rest of the embed is still sent.
pub fn sanitize_embed(embed: &MessageEmbed) -> MessageEmbed {
    let mut out = embed.clone();

    out.url = checked_url(out.url, "url");
    out.image_url = checked_url(out.image_url, "image_url");
    out.thumbnail_url = checked_url(out.thumbnail_url, "thumbnail_url");
    if let Some(author) = out.author.as_mut() {
        author.url = checked_url(author.url.take(), "author.url");
        author.icon_url = checked_url(author.icon_url.take(), "author.icon_url");
    }
    if let Some(footer) = out.footer.as_mut() {
        footer.icon_url = checked_url(footer.icon_url.take(), "footer.icon_url");
    }

    out
}

fn checked_url(url: Option<String>, field: &str) -> Option<String> {
    let url = url?;
    if is_public_http_url(&url) {
        Some(url)
    } else {
        warn!(field, url = %url, "dropping unsafe embed URL");
        None
    }
}

/// Flattens an embed into plain text for platforms without rich embeds.
///
/// Unsafe URLs have already been removed by [`sanitize_embed`]; callers
/// sanitize first, then render.
pub fn render_plaintext(embed: &MessageEmbed) -> String {
    let mut lines: Vec<String> = Vec::new();

    if let Some(title) = &embed.title {
        match &embed.url {
            Some(url) => lines.push(format!("{} ({})", title, url)),
            None => lines.push(title.clone()),
        }
    }
    if let Some(author) = &embed.author {
        lines.push(format!("by {}", author.name));
    }
    if let Some(description) = &embed.description {
        lines.push(description.clone());
    }
    for field in &embed.fields {
        lines.push(format!("{}: {}", field.name, field.value));
    }
    if let Some(image) = &embed.image_url {
        lines.push(image.clone());
    }
    if let Some(footer) = &embed.footer {
        lines.push(footer.text.clone());
    }

    lines.join("\n")
}
