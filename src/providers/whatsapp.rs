//! WhatsApp adapter (via an Evolution API server).
//!
//! The Evolution server owns the WhatsApp protocol; the gateway talks plain
//! REST+JSON to it. Inbound events arrive on the gateway's webhook surface
//! as `messages.upsert` payloads (one request may carry a batch); outbound
//! text and reactions go to the server's `message/*` endpoints with the
//! instance API key.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::bus::{CanonicalEnvelope, DedupCache, EventBus, MediaAttachment, MediaType};
use crate::connection::{ConnectionRef, Platform, PlatformConnection};
use crate::error::{GatewayError, Result};

use super::{
    classify_transport_error, ensure_success, http_client, render_plaintext, sanitize_embed,
    DeliveryReceipt, OutboundContent, ProviderContext, ProviderHandle, Reactable, WebhookAck,
};

const APIKEY_HEADER: &str = "apikey";

// ---------------------------------------------------------------------------
// Evolution payload types
// ---------------------------------------------------------------------------

/// Envelope of one webhook POST from the Evolution server.
#[derive(Debug, Deserialize)]
struct EvolutionEvent {
    event: String,
    #[serde(default)]
    data: Value,
}

/// One `messages.upsert` item.
#[derive(Debug, Deserialize)]
struct UpsertItem {
    key: MessageKey,
    #[serde(default)]
    message: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct MessageKey {
    #[serde(rename = "remoteJid")]
    remote_jid: String,
    #[serde(rename = "fromMe", default)]
    from_me: bool,
    id: String,
    #[serde(default)]
    participant: Option<String>,
}

// ---------------------------------------------------------------------------
// WhatsAppProvider
// ---------------------------------------------------------------------------

/// WhatsApp adapter for one connection, bridged through Evolution API.
pub struct WhatsAppProvider {
    connection_ref: ConnectionRef,
    server_url: String,
    api_key: String,
    instance: String,
    webhook_token: String,
    test_mode: bool,
    public_base_url: Option<String>,
    client: reqwest::Client,
    bus: Arc<EventBus>,
    dedup: Arc<DedupCache>,
}

impl WhatsAppProvider {
    /// Builds the adapter from a validated connection.
    pub fn from_connection(conn: &PlatformConnection, ctx: ProviderContext) -> Result<Self> {
        let get = |key: &str| -> Result<String> {
            conn.credential(key)
                .map(str::to_string)
                .ok_or_else(|| GatewayError::Validation(format!("whatsapp connection lacks {}", key)))
        };
        let webhook_token = conn.webhook_token.clone().ok_or_else(|| {
            GatewayError::Validation("whatsapp connection lacks a webhook token".into())
        })?;
        Ok(Self {
            connection_ref: conn.connection_ref(),
            server_url: get("server_url")?.trim_end_matches('/').to_string(),
            api_key: get("api_key")?,
            instance: get("instance_name")?,
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

    /// Verifies the instance with the server, then points its webhook at
    /// this gateway. Test-mode connections activate inert.
    pub async fn activate(&self) -> Result<ProviderHandle> {
        if self.test_mode {
            debug!(connection = %self.connection_ref, "whatsapp test-mode activation, remote calls skipped");
            return Ok(ProviderHandle::inert());
        }

        let resp = self
            .client
            .get(format!(
                "{}/instance/connectionState/{}",
                self.server_url, self.instance
            ))
            .header(APIKEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| {
                GatewayError::Activation(format!("evolution connectionState failed: {}", e))
            })?;
        if !resp.status().is_success() {
            return Err(GatewayError::Activation(format!(
                "evolution rejected instance '{}' ({})",
                self.instance,
                resp.status()
            )));
        }

        if let Some(base) = &self.public_base_url {
            let webhook_url = format!(
                "{}/webhooks/whatsapp-evo/{}",
                base.trim_end_matches('/'),
                self.webhook_token
            );
            let resp = self
                .client
                .post(format!("{}/webhook/set/{}", self.server_url, self.instance))
                .header(APIKEY_HEADER, &self.api_key)
                .json(&json!({
                    "webhook": {
                        "enabled": true,
                        "url": webhook_url,
                        "events": ["MESSAGES_UPSERT"],
                    }
                }))
                .send()
                .await
                .map_err(|e| {
                    GatewayError::Activation(format!("evolution webhook registration failed: {}", e))
                })?;
            if !resp.status().is_success() {
                return Err(GatewayError::Activation(format!(
                    "evolution refused the webhook registration ({})",
                    resp.status()
                )));
            }
        }

        Ok(ProviderHandle::inert())
    }

    /// Best-effort webhook disable on deactivation.
    pub async fn teardown(&self) {
        if self.test_mode {
            return;
        }
        let result = self
            .client
            .post(format!("{}/webhook/set/{}", self.server_url, self.instance))
            .header(APIKEY_HEADER, &self.api_key)
            .json(&json!({ "webhook": { "enabled": false } }))
            .send()
            .await;
        if let Err(e) = result {
            debug!("evolution webhook disable failed (ignored): {}", e);
        }
    }

    /// Extracts the text body from the polymorphic `message` object.
    fn extract_text(message: &Value) -> String {
        if let Some(text) = message.get("conversation").and_then(Value::as_str) {
            return text.to_string();
        }
        if let Some(text) = message
            .pointer("/extendedTextMessage/text")
            .and_then(Value::as_str)
        {
            return text.to_string();
        }
        for kind in ["imageMessage", "videoMessage", "documentMessage"] {
            if let Some(caption) = message
                .get(kind)
                .and_then(|m| m.get("caption"))
                .and_then(Value::as_str)
            {
                return caption.to_string();
            }
        }
        String::new()
    }

    /// Maps media message kinds onto typed attachments.
    fn extract_attachments(message: &Value) -> Vec<MediaAttachment> {
        let mut out = Vec::new();
        let kinds = [
            ("imageMessage", MediaType::Image),
            ("audioMessage", MediaType::Audio),
            ("videoMessage", MediaType::Video),
            ("documentMessage", MediaType::Document),
        ];
        for (kind, media_type) in kinds {
            if let Some(media) = message.get(kind) {
                let mut attachment = MediaAttachment::new(media_type);
                if let Some(mime) = media.get("mimetype").and_then(Value::as_str) {
                    attachment = attachment.with_mime_type(mime);
                }
                if let Some(name) = media.get("fileName").and_then(Value::as_str) {
                    attachment = attachment.with_filename(name);
                }
                out.push(attachment);
            }
        }
        out
    }

    /// Builds an envelope from one upsert item; `None` for own messages,
    /// empty payloads and duplicates.
    fn build_envelope(&self, item: &Value) -> Option<CanonicalEnvelope> {
        let upsert: UpsertItem = serde_json::from_value(item.clone()).ok()?;
        if upsert.key.from_me {
            return None;
        }
        let message = upsert.message?;
        let text = Self::extract_text(&message);
        let attachments = Self::extract_attachments(&message);
        if text.is_empty() && attachments.is_empty() {
            return None;
        }
        if !self
            .dedup
            .check_and_record(&format!("whatsapp-evo:{}", upsert.key.id))
        {
            debug!(message_id = %upsert.key.id, "whatsapp duplicate event suppressed");
            return None;
        }

        let sender = upsert
            .key
            .participant
            .as_deref()
            .unwrap_or(&upsert.key.remote_jid);
        let mut envelope = CanonicalEnvelope::new(
            Platform::WhatsAppEvo,
            self.connection_ref.clone(),
            &upsert.key.remote_jid,
            sender,
            &text,
        )
        .with_raw(item.clone());
        for attachment in attachments {
            envelope = envelope.with_attachment(attachment);
        }
        Some(envelope)
    }

    /// Parses one webhook POST, publishing an envelope per accepted event.
    pub async fn handle_inbound(
        &self,
        body: &[u8],
        _headers: &[(String, String)],
    ) -> Result<WebhookAck> {
        let event: EvolutionEvent = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Validation(format!("malformed evolution event: {}", e)))?;

        // Event names vary by server config: "messages.upsert" vs
        // "MESSAGES_UPSERT".
        let normalized = event.event.to_ascii_lowercase().replace('_', ".");
        if normalized != "messages.upsert" {
            debug!(event = %event.event, "ignoring evolution event type");
            return Ok(WebhookAck::Evolution { accepted: 0 });
        }

        let items: Vec<Value> = match &event.data {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            single => vec![single.clone()],
        };

        let mut accepted = 0;
        for item in &items {
            if let Some(envelope) = self.build_envelope(item) {
                self.bus.publish(envelope);
                accepted += 1;
            }
        }
        Ok(WebhookAck::Evolution { accepted })
    }

    /// Sends text via `message/sendText/{instance}`.
    pub async fn send(
        &self,
        target_chat_id: &str,
        content: &OutboundContent,
    ) -> Result<DeliveryReceipt> {
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
        let text = parts.join("\n\n");
        if text.is_empty() {
            return Err(GatewayError::Validation(
                "whatsapp send requires text or a renderable embed".into(),
            ));
        }

        let resp = self
            .client
            .post(format!(
                "{}/message/sendText/{}",
                self.server_url, self.instance
            ))
            .header(APIKEY_HEADER, &self.api_key)
            .json(&json!({ "number": target_chat_id, "text": text }))
            .send()
            .await
            .map_err(classify_transport_error)?;
        let resp = ensure_success(resp).await?;
        let created: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(DeliveryReceipt {
            provider_message_id: created
                .pointer("/key/id")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    /// `message/sendReaction/{instance}` with an empty reaction clearing it.
    async fn set_reaction(
        &self,
        chat_id: &str,
        message_id: &str,
        from_me: bool,
        emoji: &str,
    ) -> Result<()> {
        let resp = self
            .client
            .post(format!(
                "{}/message/sendReaction/{}",
                self.server_url, self.instance
            ))
            .header(APIKEY_HEADER, &self.api_key)
            .json(&json!({
                "key": { "remoteJid": chat_id, "fromMe": from_me, "id": message_id },
                "reaction": emoji,
            }))
            .send()
            .await
            .map_err(classify_transport_error)?;
        ensure_success(resp).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Reactable for WhatsAppProvider {
    async fn send_reaction(
        &self,
        chat_id: &str,
        native_message_id: &str,
        emoji: &str,
        from_me: bool,
    ) -> Result<()> {
        self.set_reaction(chat_id, native_message_id, from_me, emoji)
            .await
    }

    async fn remove_reaction(
        &self,
        chat_id: &str,
        native_message_id: &str,
        _emoji: &str,
        from_me: bool,
    ) -> Result<()> {
        self.set_reaction(chat_id, native_message_id, from_me, "")
            .await
    }
}
