//! Telegram adapter.
//!
//! Inbound messages arrive on the gateway's webhook surface as Bot API
//! `Update` payloads; outbound messaging and reactions go through the Bot
//! API REST endpoints with raw `reqwest` -- no SDK crate required.
//!
//! Activation validates the token via `getMe` and, when the gateway has a
//! public base URL, registers the webhook with a per-connection secret
//! token. Inbound deliveries are authenticated by comparing the
//! `X-Telegram-Bot-Api-Secret-Token` header in constant time.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::bus::{CanonicalEnvelope, DedupCache, EventBus, MediaAttachment, MediaType};
use crate::connection::{ConnectionRef, Platform, PlatformConnection};
use crate::error::{GatewayError, Result};

use super::{
    classify_transport_error, ensure_success, http_client, render_plaintext, sanitize_embed,
    DeliveryReceipt, OutboundContent, ProviderContext, ProviderHandle, Reactable, WebhookAck,
};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Header carrying the webhook secret on every Bot API delivery.
const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

// ---------------------------------------------------------------------------
// Bot API payload types
// ---------------------------------------------------------------------------

/// One Bot API `Update`.
#[derive(Debug, Deserialize)]
struct Update {
    #[allow(dead_code)]
    update_id: i64,
    #[serde(default)]
    message: Option<UpdateMessage>,
}

#[derive(Debug, Deserialize)]
struct UpdateMessage {
    message_id: i64,
    #[serde(default)]
    from: Option<TgUser>,
    chat: TgChat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<TgPhotoSize>,
    #[serde(default)]
    document: Option<TgDocument>,
    #[serde(default)]
    voice: Option<TgVoice>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgPhotoSize {
    #[allow(dead_code)]
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct TgDocument {
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgVoice {
    #[serde(default)]
    mime_type: Option<String>,
}

/// Bot API call envelope: `{"ok": bool, "result": ...}`.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
}

// ---------------------------------------------------------------------------
// TelegramProvider
// ---------------------------------------------------------------------------

/// Telegram adapter for one connection.
pub struct TelegramProvider {
    connection_ref: ConnectionRef,
    token: String,
    secret_token: Option<String>,
    webhook_token: String,
    test_mode: bool,
    public_base_url: Option<String>,
    client: reqwest::Client,
    bus: Arc<EventBus>,
    dedup: Arc<DedupCache>,
}

impl TelegramProvider {
    /// Builds the adapter from a validated connection.
    pub fn from_connection(conn: &PlatformConnection, ctx: ProviderContext) -> Result<Self> {
        let token = conn
            .credential("bot_token")
            .ok_or_else(|| GatewayError::Validation("telegram connection lacks bot_token".into()))?
            .to_string();
        let webhook_token = conn.webhook_token.clone().ok_or_else(|| {
            GatewayError::Validation("telegram connection lacks a webhook token".into())
        })?;
        Ok(Self {
            connection_ref: conn.connection_ref(),
            token,
            secret_token: conn.credential("secret_token").map(str::to_string),
            webhook_token,
            test_mode: conn.test_mode,
            public_base_url: ctx.settings.public_base_url.clone(),
            client: http_client(ctx.settings.timeout)?,
            bus: ctx.bus,
            dedup: ctx.dedup,
        })
    }

    pub fn connection_ref(&self) -> &ConnectionRef {
        &self.connection_ref
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", TELEGRAM_API_BASE, self.token, method)
    }

    /// Validates the token via `getMe`, then registers the webhook when a
    /// public base URL is configured. Test-mode connections activate inert.
    pub async fn activate(&self) -> Result<ProviderHandle> {
        if self.test_mode {
            debug!(connection = %self.connection_ref, "telegram test-mode activation, remote calls skipped");
            return Ok(ProviderHandle::inert());
        }

        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| GatewayError::Activation(format!("telegram getMe failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(GatewayError::Activation(format!(
                "telegram rejected the bot token ({})",
                resp.status()
            )));
        }

        if let Some(base) = &self.public_base_url {
            let webhook_url = format!(
                "{}/webhooks/telegram/{}",
                base.trim_end_matches('/'),
                self.webhook_token
            );
            let mut body = json!({ "url": webhook_url });
            if let Some(secret) = &self.secret_token {
                body["secret_token"] = json!(secret);
            }
            let resp = self
                .client
                .post(self.api_url("setWebhook"))
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    GatewayError::Activation(format!("telegram setWebhook failed: {}", e))
                })?;
            if !resp.status().is_success() {
                return Err(GatewayError::Activation(format!(
                    "telegram refused the webhook registration ({})",
                    resp.status()
                )));
            }
        }

        Ok(ProviderHandle::inert())
    }

    /// Best-effort webhook removal on deactivation.
    pub async fn teardown(&self) {
        if self.test_mode {
            return;
        }
        match self.client.post(self.api_url("deleteWebhook")).send().await {
            Ok(_) => debug!(connection = %self.connection_ref, "telegram webhook removed"),
            Err(e) => debug!("telegram deleteWebhook failed (ignored): {}", e),
        }
    }

    /// Verifies the delivery secret in constant time.
    fn verify_secret(&self, headers: &[(String, String)]) -> Result<()> {
        let Some(expected) = &self.secret_token else {
            return Ok(());
        };
        let presented = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(SECRET_HEADER))
            .map(|(_, value)| value.trim());
        match presented {
            Some(value)
                if value.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() == 1 =>
            {
                Ok(())
            }
            Some(_) => Err(GatewayError::Unauthorized(
                "telegram webhook secret mismatch".into(),
            )),
            None => Err(GatewayError::Unauthorized(
                "telegram webhook secret missing".into(),
            )),
        }
    }

    /// Parses one `Update`, publishing at most one canonical envelope.
    pub async fn handle_inbound(
        &self,
        body: &[u8],
        headers: &[(String, String)],
    ) -> Result<WebhookAck> {
        self.verify_secret(headers)?;

        let raw: Value = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Validation(format!("malformed telegram update: {}", e)))?;
        let update: Update = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::Validation(format!("malformed telegram update: {}", e)))?;

        // Non-message updates (edits, joins, callbacks) are acknowledged
        // without publishing.
        let Some(message) = update.message else {
            return Ok(WebhookAck::Telegram);
        };
        if message.from.as_ref().map(|u| u.is_bot).unwrap_or(false) {
            return Ok(WebhookAck::Telegram);
        }

        let chat_id = message.chat.id.to_string();
        let dedup_key = format!("telegram:{}:{}", chat_id, message.message_id);
        if !self.dedup.check_and_record(&dedup_key) {
            debug!(key = %dedup_key, "telegram duplicate update suppressed");
            return Ok(WebhookAck::Telegram);
        }

        let sender_id = message
            .from
            .as_ref()
            .map(|u| u.id.to_string())
            .unwrap_or_else(|| chat_id.clone());
        let text = message
            .text
            .as_deref()
            .or(message.caption.as_deref())
            .unwrap_or("");

        let mut envelope = CanonicalEnvelope::new(
            Platform::Telegram,
            self.connection_ref.clone(),
            &chat_id,
            &sender_id,
            text,
        )
        .with_raw(raw);
        if !message.photo.is_empty() {
            envelope = envelope.with_attachment(MediaAttachment::new(MediaType::Image));
        }
        if let Some(doc) = &message.document {
            let mut media = MediaAttachment::new(MediaType::Document);
            if let Some(name) = &doc.file_name {
                media = media.with_filename(name);
            }
            if let Some(mime) = &doc.mime_type {
                media = media.with_mime_type(mime);
            }
            envelope = envelope.with_attachment(media);
        }
        if let Some(voice) = &message.voice {
            let mut media = MediaAttachment::new(MediaType::Audio);
            if let Some(mime) = &voice.mime_type {
                media = media.with_mime_type(mime);
            }
            envelope = envelope.with_attachment(media);
        }

        self.bus.publish(envelope);
        Ok(WebhookAck::Telegram)
    }

    /// Combines text and a flattened embed into the single Bot API text body.
    fn build_send_text(content: &OutboundContent) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(text) = &content.text {
            if !text.is_empty() {
                parts.push(text.clone());
            }
        }
        if let Some(embed) = &content.embed {
            let rendered = render_plaintext(&sanitize_embed(embed));
            if !rendered.is_empty() {
                parts.push(rendered);
            }
        }
        parts.join("\n\n")
    }

    /// Sends a message via `sendMessage`.
    pub async fn send(
        &self,
        target_chat_id: &str,
        content: &OutboundContent,
    ) -> Result<DeliveryReceipt> {
        let text = Self::build_send_text(content);
        if text.is_empty() {
            return Err(GatewayError::Validation(
                "telegram send requires text or a renderable embed".into(),
            ));
        }

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&json!({ "chat_id": target_chat_id, "text": text }))
            .send()
            .await
            .map_err(classify_transport_error)?;
        let resp = ensure_success(resp).await?;
        let api: ApiResponse = resp.json().await.map_err(classify_transport_error)?;
        if !api.ok {
            warn!(connection = %self.connection_ref, "telegram sendMessage returned ok=false");
        }
        Ok(DeliveryReceipt {
            provider_message_id: api
                .result
                .as_ref()
                .and_then(|r| r.get("message_id"))
                .and_then(Value::as_i64)
                .map(|id| id.to_string()),
        })
    }

    async fn set_reaction(&self, chat_id: &str, message_id: &str, reaction: Value) -> Result<()> {
        let message_id: i64 = message_id.parse().map_err(|_| {
            GatewayError::Delivery(crate::error::DeliveryError::Permanent(format!(
                "telegram message id '{}' is not numeric",
                message_id
            )))
        })?;
        let resp = self
            .client
            .post(self.api_url("setMessageReaction"))
            .json(&json!({
                "chat_id": chat_id,
                "message_id": message_id,
                "reaction": reaction,
            }))
            .send()
            .await
            .map_err(classify_transport_error)?;
        ensure_success(resp).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Reactable for TelegramProvider {
    async fn send_reaction(
        &self,
        chat_id: &str,
        native_message_id: &str,
        emoji: &str,
        _from_me: bool,
    ) -> Result<()> {
        self.set_reaction(
            chat_id,
            native_message_id,
            json!([{ "type": "emoji", "emoji": emoji }]),
        )
        .await
    }

    async fn remove_reaction(
        &self,
        chat_id: &str,
        native_message_id: &str,
        _emoji: &str,
        _from_me: bool,
    ) -> Result<()> {
        // An empty reaction list clears the bot's reaction.
        self.set_reaction(chat_id, native_message_id, json!([]))
            .await
    }
}
