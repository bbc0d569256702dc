//! Platform providers — one adapter per platform.
//!
//! A provider normalizes a platform's wire format into a canonical envelope
//! on receipt and translates canonical send/reaction commands into platform
//! calls on dispatch.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PlatformProvider                         │
//! │                                                             │
//! │  ┌─────────┐  ┌─────────┐  ┌──────────┐  ┌─────────┐       │
//! │  │ Discord │  │Telegram │  │ WhatsApp │  │  Email  │       │
//! │  │(socket) │  │(webhook)│  │(webhook) │  │(polling)│       │
//! │  └────┬────┘  └────┬────┘  └────┬─────┘  └────┬────┘       │
//! │       │            │            │             │             │
//! │       └────────────┴─────┬──────┴─────────────┘             │
//! │                          │ CanonicalEnvelope                │
//! │                    ┌─────┴─────┐                            │
//! │                    │  EventBus │                            │
//! │                    └───────────┘                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The provider set is a closed enum: capability absence is a visible
//! branch (`as_reactable()` returning `None`), not a property probe.
//! Remote calls are never retried here — adapters surface a typed
//! [`DeliveryError`] and the dispatch queue decides.

mod discord;
mod email;
mod embed;
mod telegram;
mod whatsapp;

pub use discord::DiscordProvider;
pub use email::EmailProvider;
pub use embed::{
    parse_embed_color, parse_embed_timestamp, render_plaintext, sanitize_embed, EmbedAuthor,
    EmbedField, EmbedFooter, MessageEmbed,
};
pub use telegram::TelegramProvider;
pub use whatsapp::WhatsAppProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::bus::{DedupCache, EventBus};
use crate::connection::{ConnectionRef, Platform, PlatformConnection};
use crate::error::{DeliveryError, GatewayError, Result};

// ---------------------------------------------------------------------------
// Contract types
// ---------------------------------------------------------------------------

/// How a platform's inbound traffic reaches the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Webhook,
    Polling,
    WebSocket,
}

/// Canonical outbound message content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundContent {
    /// Plain text body.
    #[serde(default)]
    pub text: Option<String>,
    /// Optional rich embed; platforms without embeds flatten it to text.
    #[serde(default)]
    pub embed: Option<MessageEmbed>,
}

impl OutboundContent {
    /// Creates text-only content.
    pub fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            embed: None,
        }
    }

    /// Attaches an embed (builder pattern).
    pub fn with_embed(mut self, embed: MessageEmbed) -> Self {
        self.embed = Some(embed);
        self
    }
}

/// Acknowledgement of a completed platform delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Platform-native id of the sent message, when the platform reports one.
    pub provider_message_id: Option<String>,
}

/// Webhook acknowledgement, tagged by platform so each adapter's response
/// shape is statically known to that adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAck {
    /// The Bot API only requires a 200; the body is ignored.
    Telegram,
    /// Evolution API events are acknowledged with the accepted count.
    Evolution { accepted: usize },
}

impl WebhookAck {
    pub fn http_status(&self) -> u16 {
        200
    }

    pub fn body(&self) -> String {
        match self {
            WebhookAck::Telegram => "{\"ok\":true}".to_string(),
            WebhookAck::Evolution { accepted } => {
                format!("{{\"status\":\"ok\",\"accepted\":{}}}", accepted)
            }
        }
    }
}

/// Optional reaction capability.
///
/// A platform that cannot react simply is not `Reactable`; callers detect
/// the capability through [`PlatformProvider::as_reactable`].
#[async_trait]
pub trait Reactable: Send + Sync {
    /// Adds an emoji reaction to a platform-native message.
    async fn send_reaction(
        &self,
        chat_id: &str,
        native_message_id: &str,
        emoji: &str,
        from_me: bool,
    ) -> Result<()>;

    /// Removes an emoji reaction from a platform-native message.
    async fn remove_reaction(
        &self,
        chat_id: &str,
        native_message_id: &str,
        emoji: &str,
        from_me: bool,
    ) -> Result<()>;
}

/// Static capability metadata stored alongside a registration.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub supports_reactions: bool,
    pub supports_embeds: bool,
}

// ---------------------------------------------------------------------------
// Provider handle
// ---------------------------------------------------------------------------

/// Live state returned by `activate` and owned by the registry.
///
/// Holds whatever background work the platform needs (gateway socket loop)
/// plus its shutdown signal. `stop` is idempotent and never fails on an
/// already-torn-down handle.
pub struct ProviderHandle {
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl ProviderHandle {
    /// A handle with no live background state.
    pub fn inert() -> Self {
        Self {
            shutdown: None,
            task: None,
        }
    }

    /// A handle owning a background task and its shutdown signal.
    pub fn with_task(shutdown: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self {
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    /// Signals the background task to stop and waits briefly for it.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.task.take() {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(_) => {}
                Err(_) => warn!("provider background task did not stop within timeout"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Provider context
// ---------------------------------------------------------------------------

/// Adapter-wide settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Upper bound on every remote platform call; expiry maps to a
    /// transient (retryable) delivery error.
    pub timeout: Duration,
    /// Public base URL of this gateway, used to register platform webhooks
    /// at activation time. Without one, webhook registration is skipped.
    pub public_base_url: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            public_base_url: None,
        }
    }
}

/// Everything an adapter needs besides its connection.
#[derive(Clone)]
pub struct ProviderContext {
    pub bus: Arc<EventBus>,
    pub dedup: Arc<DedupCache>,
    pub settings: ProviderSettings,
}

impl ProviderContext {
    pub fn new(bus: Arc<EventBus>, dedup: Arc<DedupCache>, settings: ProviderSettings) -> Self {
        Self {
            bus,
            dedup,
            settings,
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformProvider
// ---------------------------------------------------------------------------

/// The closed set of platform adapters behind one interface.
pub enum PlatformProvider {
    Discord(DiscordProvider),
    Telegram(TelegramProvider),
    WhatsApp(WhatsAppProvider),
    Email(EmailProvider),
}

impl PlatformProvider {
    /// Builds the adapter for a validated connection.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] when the connection's
    /// credential map is missing fields the adapter needs.
    pub fn for_connection(conn: &PlatformConnection, ctx: ProviderContext) -> Result<Self> {
        match conn.platform {
            Platform::Discord => Ok(Self::Discord(DiscordProvider::from_connection(conn, ctx)?)),
            Platform::Telegram => Ok(Self::Telegram(TelegramProvider::from_connection(
                conn, ctx,
            )?)),
            Platform::WhatsAppEvo => {
                Ok(Self::WhatsApp(WhatsAppProvider::from_connection(conn, ctx)?))
            }
            Platform::Email => Ok(Self::Email(EmailProvider::from_connection(conn, ctx)?)),
        }
    }

    /// Static platform identifier.
    pub fn platform(&self) -> Platform {
        match self {
            Self::Discord(_) => Platform::Discord,
            Self::Telegram(_) => Platform::Telegram,
            Self::WhatsApp(_) => Platform::WhatsAppEvo,
            Self::Email(_) => Platform::Email,
        }
    }

    /// How inbound traffic for this provider reaches the gateway.
    pub fn connection_type(&self) -> ConnectionType {
        match self {
            Self::Discord(_) => ConnectionType::WebSocket,
            Self::Telegram(_) => ConnectionType::Webhook,
            Self::WhatsApp(_) => ConnectionType::Webhook,
            Self::Email(_) => ConnectionType::Polling,
        }
    }

    /// Human-readable platform name for logs and error messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Discord(_) => "Discord",
            Self::Telegram(_) => "Telegram",
            Self::WhatsApp(_) => "WhatsApp (Evolution API)",
            Self::Email(_) => "Email (SMTP)",
        }
    }

    /// Static capability metadata for the registry.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_reactions: self.as_reactable().is_some(),
            supports_embeds: matches!(self, Self::Discord(_)),
        }
    }

    /// The connection this adapter instance serves.
    pub fn connection_ref(&self) -> &ConnectionRef {
        match self {
            Self::Discord(p) => p.connection_ref(),
            Self::Telegram(p) => p.connection_ref(),
            Self::WhatsApp(p) => p.connection_ref(),
            Self::Email(p) => p.connection_ref(),
        }
    }

    /// Establishes whatever live state the platform needs.
    ///
    /// # Errors
    ///
    /// Fails with [`GatewayError::Activation`] if the remote platform
    /// rejects the credentials or the live state cannot be established.
    /// Test-mode connections skip all remote calls and activate inert.
    pub async fn activate(&self) -> Result<ProviderHandle> {
        match self {
            Self::Discord(p) => p.activate().await,
            Self::Telegram(p) => p.activate().await,
            Self::WhatsApp(p) => p.activate().await,
            Self::Email(p) => p.activate().await,
        }
    }

    /// Releases live state. Idempotent; never fails on a handle already
    /// torn down.
    pub async fn deactivate(&self, mut handle: ProviderHandle) {
        handle.stop().await;
        match self {
            Self::Telegram(p) => p.teardown().await,
            Self::WhatsApp(p) => p.teardown().await,
            Self::Discord(_) | Self::Email(_) => {}
        }
    }

    /// Whether the adapter implements an inbound webhook handler.
    pub fn has_webhook_handler(&self) -> bool {
        matches!(self, Self::Telegram(_) | Self::WhatsApp(_))
    }

    /// Parses one platform-specific webhook delivery, publishing zero or
    /// more canonical envelopes to the event bus as a side effect.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Unauthorized`] when the payload's authenticity
    /// token fails verification; [`GatewayError::Validation`] for
    /// malformed payloads; [`GatewayError::Channel`] when invoked on a
    /// provider without a webhook handler.
    pub async fn handle_inbound(
        &self,
        body: &[u8],
        headers: &[(String, String)],
    ) -> Result<WebhookAck> {
        match self {
            Self::Telegram(p) => p.handle_inbound(body, headers).await,
            Self::WhatsApp(p) => p.handle_inbound(body, headers).await,
            Self::Discord(_) | Self::Email(_) => Err(GatewayError::Channel(format!(
                "{} provider registered without a webhook handler",
                self.display_name()
            ))),
        }
    }

    /// Sends canonical content to a platform-native conversation.
    pub async fn send(
        &self,
        target_chat_id: &str,
        content: &OutboundContent,
    ) -> Result<DeliveryReceipt> {
        match self {
            Self::Discord(p) => p.send(target_chat_id, content).await,
            Self::Telegram(p) => p.send(target_chat_id, content).await,
            Self::WhatsApp(p) => p.send(target_chat_id, content).await,
            Self::Email(p) => p.send(target_chat_id, content).await,
        }
    }

    /// The reaction capability, when the platform has one.
    pub fn as_reactable(&self) -> Option<&dyn Reactable> {
        match self {
            Self::Discord(p) => Some(p),
            Self::Telegram(p) => Some(p),
            Self::WhatsApp(p) => Some(p),
            Self::Email(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared adapter helpers
// ---------------------------------------------------------------------------

/// Builds the shared HTTP client with the configured call timeout.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(GatewayError::Http)
}

/// Classifies a transport-level reqwest failure for the dispatch queue.
///
/// Timeouts and connection failures are transient; request-construction
/// bugs are permanent.
pub(crate) fn classify_transport_error(err: reqwest::Error) -> DeliveryError {
    if err.is_builder() {
        DeliveryError::Permanent(err.to_string())
    } else {
        DeliveryError::Transient(err.to_string())
    }
}

/// Checks a platform response, returning it untouched on success and a
/// classified delivery error (with a truncated body summary) otherwise.
pub(crate) async fn ensure_success(
    resp: reqwest::Response,
) -> std::result::Result<reqwest::Response, DeliveryError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let summary: String = body.chars().take(200).collect();
    Err(DeliveryError::from_status(
        status.as_u16(),
        format!("{}: {}", status, summary),
    ))
}
