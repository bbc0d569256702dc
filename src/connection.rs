//! Platform and connection model.
//!
//! A [`PlatformConnection`] is a configured, credentialed instance of a
//! platform integration belonging to a project. Connections are created only
//! after credential validation succeeds and are the unit the registry
//! activates into live providers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GatewayError, Result};

/// Connection display names: 1-20 chars of letters, digits, dots, spaces, dashes.
static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9.\s-]{1,20}$").unwrap());

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// The closed set of platforms the gateway integrates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Discord,
    Telegram,
    /// WhatsApp bridged through an Evolution API server.
    #[serde(rename = "whatsapp-evo")]
    WhatsAppEvo,
    Email,
}

impl Platform {
    /// Canonical identifier used in webhook paths, envelopes and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Discord => "discord",
            Platform::Telegram => "telegram",
            Platform::WhatsAppEvo => "whatsapp-evo",
            Platform::Email => "email",
        }
    }

    /// All supported platforms, in registration order.
    pub fn all() -> &'static [Platform] {
        &[
            Platform::Discord,
            Platform::Telegram,
            Platform::WhatsAppEvo,
            Platform::Email,
        ]
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = GatewayError;

    /// Case-insensitive lookup. Unknown names fail with
    /// [`GatewayError::UnsupportedPlatform`] — a configuration error, kept
    /// distinct from user-input validation failures.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "discord" => Ok(Platform::Discord),
            "telegram" => Ok(Platform::Telegram),
            "whatsapp-evo" | "whatsapp" => Ok(Platform::WhatsAppEvo),
            "email" => Ok(Platform::Email),
            other => Err(GatewayError::UnsupportedPlatform(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionRef
// ---------------------------------------------------------------------------

/// Composite key identifying one platform-instance within a project.
///
/// This is the routing key for everything outbound: delivery tasks,
/// registry lookups and canonical envelopes all carry it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionRef {
    /// Owning project.
    pub project_id: String,
    /// Connection id within the project.
    pub connection_id: String,
}

impl ConnectionRef {
    pub fn new(project_id: &str, connection_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            connection_id: connection_id.to_string(),
        }
    }
}

impl fmt::Display for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.connection_id)
    }
}

// ---------------------------------------------------------------------------
// PlatformConnection
// ---------------------------------------------------------------------------

/// A configured instance of a platform integration, owned by a project.
///
/// Created after credential validation succeeds; mutated on credential
/// rotation (re-validated) or activation toggle. Removing a connection tears
/// down its live provider in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConnection {
    /// Unique connection id.
    pub id: String,
    /// Owning project id.
    pub project_id: String,
    /// Which platform this connection integrates with.
    pub platform: Platform,
    /// Human-readable name (1-20 chars, letters/digits/dots/spaces/dashes).
    pub name: String,
    /// Opaque validated credential map.
    pub credentials: HashMap<String, String>,
    /// Whether the connection should be live.
    #[serde(default)]
    pub is_active: bool,
    /// Test-mode connections skip remote webhook registration on activation.
    #[serde(default)]
    pub test_mode: bool,
    /// Inbound routing token; present only for webhook-connected platforms.
    #[serde(default)]
    pub webhook_token: Option<String>,
}

impl PlatformConnection {
    /// Creates a connection after validating the display name.
    ///
    /// Webhook-connected platforms get a freshly minted webhook token;
    /// other platforms carry none.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] if the name is empty, longer
    /// than 20 characters, or contains characters outside
    /// `[A-Za-z0-9.\s-]`.
    pub fn new(
        project_id: &str,
        platform: Platform,
        name: &str,
        credentials: HashMap<String, String>,
    ) -> Result<Self> {
        validate_connection_name(name)?;
        let webhook_token = if platform_uses_webhook(platform) {
            Some(Uuid::new_v4().simple().to_string())
        } else {
            None
        };
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            platform,
            name: name.to_string(),
            credentials,
            is_active: false,
            test_mode: false,
            webhook_token,
        })
    }

    /// Marks the connection as a test-mode connection (builder pattern).
    pub fn with_test_mode(mut self) -> Self {
        self.test_mode = true;
        self
    }

    /// The routing key for this connection.
    pub fn connection_ref(&self) -> ConnectionRef {
        ConnectionRef::new(&self.project_id, &self.id)
    }

    /// Convenience accessor for a credential value.
    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials.get(key).map(String::as_str)
    }
}

/// Whether inbound traffic for the platform arrives over our webhook surface.
fn platform_uses_webhook(platform: Platform) -> bool {
    matches!(platform, Platform::Telegram | Platform::WhatsAppEvo)
}

/// Validates a connection display name against the 1-20 char pattern.
pub fn validate_connection_name(name: &str) -> Result<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(GatewayError::Validation(format!(
            "connection name '{}' must be 1-20 characters of letters, digits, dots, spaces or dashes",
            name
        )))
    }
}
