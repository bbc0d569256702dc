//! Discord adapter.
//!
//! Connects to Discord via the Gateway WebSocket API (v10) for inbound
//! messages and uses the REST API for outbound messaging and reactions.
//! Uses raw `tokio-tungstenite` and `reqwest` -- no third-party Discord SDK
//! crate required.
//!
//! # Gateway flow
//!
//! 1. GET `https://discord.com/api/v10/gateway` to obtain the WebSocket URL.
//! 2. Connect via `tokio-tungstenite`.
//! 3. Receive opcode 10 (HELLO) -- extract `heartbeat_interval`.
//! 4. Send opcode 2 (IDENTIFY) with bot token and intents.
//! 5. Heartbeat (opcode 1) on the HELLO interval.
//! 6. Listen for opcode 0 (DISPATCH) events, specifically `MESSAGE_CREATE`,
//!    and publish a canonical envelope for each accepted message.
//! 7. Reconnect with exponential backoff on disconnection.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::bus::{CanonicalEnvelope, DedupCache, EventBus, MediaAttachment, MediaType};
use crate::connection::{ConnectionRef, Platform, PlatformConnection};
use crate::error::{GatewayError, Result};

use super::{
    classify_transport_error, ensure_success, http_client, sanitize_embed, DeliveryReceipt,
    MessageEmbed, OutboundContent, ProviderContext, ProviderHandle, Reactable,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Maximum reconnect delay (in seconds) for exponential backoff.
const MAX_RECONNECT_DELAY_SECS: u64 = 120;
/// Base reconnect delay (in seconds).
const BASE_RECONNECT_DELAY_SECS: u64 = 2;
/// Maximum number of consecutive reconnect attempts before capping backoff.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Discord Gateway intents bitmask.
/// GUILDS (1 << 0) | GUILD_MESSAGES (1 << 9) | MESSAGE_CONTENT (1 << 15)
const GATEWAY_INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 15);

/// Fallback heartbeat interval when HELLO is malformed.
const DEFAULT_HEARTBEAT_MS: u64 = 41_250;

// ---------------------------------------------------------------------------
// Gateway payload types (deserialization)
// ---------------------------------------------------------------------------

/// Top-level Discord Gateway payload.
#[derive(Debug, Deserialize)]
struct GatewayPayload {
    /// Gateway opcode.
    op: u8,
    /// Event data (shape depends on opcode / event name).
    #[serde(default)]
    d: Option<Value>,
    /// Sequence number (used for heartbeats).
    #[serde(default)]
    s: Option<u64>,
    /// Event name (only present for opcode 0 / DISPATCH).
    #[serde(default)]
    t: Option<String>,
}

/// The `d` field of a MESSAGE_CREATE dispatch event.
#[derive(Debug, Deserialize)]
struct MessageCreateData {
    /// The unique message ID.
    id: String,
    /// The message text content.
    #[serde(default)]
    content: String,
    /// The Discord channel ID this message was sent in.
    channel_id: String,
    /// The message author.
    author: MessageAuthor,
    /// Uploaded attachments.
    #[serde(default)]
    attachments: Vec<MessageAttachment>,
}

/// Author of a Discord message.
#[derive(Debug, Deserialize)]
struct MessageAuthor {
    /// The user's snowflake ID.
    id: String,
    /// Whether the author is a bot.
    #[serde(default)]
    bot: bool,
}

/// One uploaded attachment on a Discord message.
#[derive(Debug, Deserialize)]
struct MessageAttachment {
    url: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
}

/// Response of `GET /gateway`.
#[derive(Debug, Deserialize)]
struct GatewayResponse {
    url: String,
}

// ---------------------------------------------------------------------------
// DiscordProvider
// ---------------------------------------------------------------------------

/// Discord adapter for one connection.
pub struct DiscordProvider {
    connection_ref: ConnectionRef,
    token: String,
    test_mode: bool,
    client: reqwest::Client,
    bus: Arc<EventBus>,
    dedup: Arc<DedupCache>,
}

impl DiscordProvider {
    /// Builds the adapter from a validated connection.
    pub fn from_connection(conn: &PlatformConnection, ctx: ProviderContext) -> Result<Self> {
        let token = conn
            .credential("bot_token")
            .ok_or_else(|| GatewayError::Validation("discord connection lacks bot_token".into()))?
            .to_string();
        Ok(Self {
            connection_ref: conn.connection_ref(),
            token,
            test_mode: conn.test_mode,
            client: http_client(ctx.settings.timeout)?,
            bus: ctx.bus,
            dedup: ctx.dedup,
        })
    }

    pub fn connection_ref(&self) -> &ConnectionRef {
        &self.connection_ref
    }

    /// Validates the token against the REST API, then spawns the gateway
    /// loop. Test-mode connections skip both and activate inert.
    pub async fn activate(&self) -> Result<ProviderHandle> {
        if self.test_mode {
            debug!(connection = %self.connection_ref, "discord test-mode activation, gateway loop skipped");
            return Ok(ProviderHandle::inert());
        }

        let resp = self
            .client
            .get(format!("{}/users/@me", DISCORD_API_BASE))
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await
            .map_err(|e| GatewayError::Activation(format!("discord /users/@me failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(GatewayError::Activation(format!(
                "discord rejected the bot token ({})",
                resp.status()
            )));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Self::run_gateway_loop(
            self.client.clone(),
            self.token.clone(),
            self.connection_ref.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&self.dedup),
            shutdown_rx,
        ));
        Ok(ProviderHandle::with_task(shutdown_tx, task))
    }

    // --- Gateway helpers ---

    async fn fetch_gateway_url(client: &reqwest::Client, token: &str) -> Result<String> {
        let resp = client
            .get(format!("{}/gateway", DISCORD_API_BASE))
            .header("Authorization", format!("Bot {}", token))
            .send()
            .await?
            .error_for_status()?;
        let gateway: GatewayResponse = resp.json().await?;
        Ok(format!("{}/?v=10&encoding=json", gateway.url))
    }

    fn build_identify_payload(token: &str) -> String {
        json!({
            "op": 2,
            "d": {
                "token": token,
                "intents": GATEWAY_INTENTS,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "omnigate",
                    "device": "omnigate",
                }
            }
        })
        .to_string()
    }

    fn build_heartbeat_payload(sequence: Option<u64>) -> String {
        json!({ "op": 1, "d": sequence }).to_string()
    }

    fn extract_heartbeat_interval(data: &Value) -> u64 {
        data.get("heartbeat_interval")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_HEARTBEAT_MS)
    }

    fn backoff_delay(attempt: u32) -> Duration {
        let capped = attempt.min(MAX_RECONNECT_ATTEMPTS);
        let secs =
            (BASE_RECONNECT_DELAY_SECS << capped.min(6)).min(MAX_RECONNECT_DELAY_SECS);
        Duration::from_secs(secs)
    }

    /// Converts a MESSAGE_CREATE event into a canonical envelope.
    ///
    /// Returns `None` for bot-authored messages, payloads without usable
    /// content, and duplicates already seen by the dedup store.
    fn build_envelope(
        data: &Value,
        connection_ref: &ConnectionRef,
        dedup: &DedupCache,
    ) -> Option<CanonicalEnvelope> {
        let msg: MessageCreateData = serde_json::from_value(data.clone()).ok()?;
        if msg.author.bot {
            return None;
        }
        if msg.content.is_empty() && msg.attachments.is_empty() {
            return None;
        }
        if !dedup.check_and_record(&format!("discord:{}", msg.id)) {
            debug!(message_id = %msg.id, "discord duplicate message suppressed");
            return None;
        }

        let mut envelope = CanonicalEnvelope::new(
            Platform::Discord,
            connection_ref.clone(),
            &msg.channel_id,
            &msg.author.id,
            &msg.content,
        )
        .with_raw(data.clone());
        for att in &msg.attachments {
            let media_type = match att.content_type.as_deref() {
                Some(ct) if ct.starts_with("image/") => MediaType::Image,
                Some(ct) if ct.starts_with("audio/") => MediaType::Audio,
                Some(ct) if ct.starts_with("video/") => MediaType::Video,
                _ => MediaType::Document,
            };
            let mut media = MediaAttachment::new(media_type).with_url(&att.url);
            if let Some(name) = &att.filename {
                media = media.with_filename(name);
            }
            if let Some(ct) = &att.content_type {
                media = media.with_mime_type(ct);
            }
            envelope = envelope.with_attachment(media);
        }
        Some(envelope)
    }

    async fn run_gateway_loop(
        client: reqwest::Client,
        token: String,
        connection_ref: ConnectionRef,
        bus: Arc<EventBus>,
        dedup: Arc<DedupCache>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut reconnect_attempt: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                info!("discord gateway shutdown requested");
                return;
            }

            let session = Self::run_gateway_session(
                &client,
                &token,
                &connection_ref,
                &bus,
                &dedup,
                &mut shutdown_rx,
            )
            .await;

            if *shutdown_rx.borrow() {
                return;
            }
            if let Err(e) = session {
                warn!("discord gateway session ended: {}", e);
            }

            reconnect_attempt = (reconnect_attempt + 1).min(MAX_RECONNECT_ATTEMPTS);
            let delay = Self::backoff_delay(reconnect_attempt);
            debug!("discord reconnecting in {:?}", delay);
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { return; }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connect → HELLO → IDENTIFY → dispatch session. Returns when the
    /// socket drops or shutdown is signalled.
    async fn run_gateway_session(
        client: &reqwest::Client,
        token: &str,
        connection_ref: &ConnectionRef,
        bus: &EventBus,
        dedup: &DedupCache,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let ws_url = Self::fetch_gateway_url(client, token).await?;
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| GatewayError::Channel(format!("gateway connect failed: {}", e)))?;
        info!("discord gateway WebSocket connected");

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let mut sequence: Option<u64> = None;
        let mut identified = false;
        // Replaced with the HELLO-provided interval on the first tick reset.
        let mut heartbeat = tokio::time::interval(Duration::from_millis(DEFAULT_HEARTBEAT_MS));
        heartbeat.reset();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = ws_writer.send(WsMessage::Close(None)).await;
                        return Ok(());
                    }
                }

                _ = heartbeat.tick() => {
                    let payload = Self::build_heartbeat_payload(sequence);
                    ws_writer
                        .send(WsMessage::text(payload))
                        .await
                        .map_err(|e| GatewayError::Channel(format!("heartbeat send failed: {}", e)))?;
                }

                msg = ws_reader.next() => {
                    let raw = match msg {
                        Some(Ok(WsMessage::Text(raw))) => raw,
                        Some(Ok(WsMessage::Close(_))) | None => {
                            return Err(GatewayError::Channel("gateway closed the connection".into()));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            return Err(GatewayError::Channel(format!("gateway read error: {}", e)));
                        }
                    };

                    let payload: GatewayPayload = match serde_json::from_str(raw.as_str()) {
                        Ok(p) => p,
                        Err(e) => {
                            debug!("discord: unparsable gateway payload: {}", e);
                            continue;
                        }
                    };
                    if let Some(s) = payload.s {
                        sequence = Some(s);
                    }

                    match payload.op {
                        // HELLO: adopt the heartbeat interval, then identify once.
                        10 => {
                            let interval_ms = payload
                                .d
                                .as_ref()
                                .map(Self::extract_heartbeat_interval)
                                .unwrap_or(DEFAULT_HEARTBEAT_MS);
                            heartbeat = tokio::time::interval(Duration::from_millis(interval_ms));
                            heartbeat.reset();
                            if !identified {
                                ws_writer
                                    .send(WsMessage::text(Self::build_identify_payload(token)))
                                    .await
                                    .map_err(|e| {
                                        GatewayError::Channel(format!("IDENTIFY send failed: {}", e))
                                    })?;
                                identified = true;
                            }
                        }
                        // DISPATCH
                        0 => {
                            if payload.t.as_deref() == Some("MESSAGE_CREATE") {
                                if let Some(ref data) = payload.d {
                                    if let Some(envelope) =
                                        Self::build_envelope(data, connection_ref, dedup)
                                    {
                                        bus.publish(envelope);
                                    }
                                }
                            }
                        }
                        // RECONNECT / INVALID SESSION: drop and let the outer loop retry.
                        7 | 9 => {
                            return Err(GatewayError::Channel("gateway asked for a reconnect".into()));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    // --- Outbound ---

    /// Builds the REST embed object, dropping unsafe/unparsable cosmetic
    /// fields.
    fn build_embed_json(embed: &MessageEmbed) -> Value {
        let clean = sanitize_embed(embed);
        let mut out = serde_json::Map::new();

        if let Some(title) = &clean.title {
            out.insert("title".into(), json!(title));
        }
        if let Some(description) = &clean.description {
            out.insert("description".into(), json!(description));
        }
        if let Some(url) = &clean.url {
            out.insert("url".into(), json!(url));
        }
        if let Some(raw) = &clean.color {
            match super::parse_embed_color(raw) {
                Some(color) => {
                    out.insert("color".into(), json!(color));
                }
                None => warn!(value = %raw, "discarding unparsable embed color"),
            }
        }
        if let Some(author) = &clean.author {
            out.insert(
                "author".into(),
                json!({
                    "name": author.name,
                    "url": author.url,
                    "icon_url": author.icon_url,
                }),
            );
        }
        if let Some(footer) = &clean.footer {
            out.insert(
                "footer".into(),
                json!({ "text": footer.text, "icon_url": footer.icon_url }),
            );
        }
        if let Some(image) = &clean.image_url {
            out.insert("image".into(), json!({ "url": image }));
        }
        if let Some(thumb) = &clean.thumbnail_url {
            out.insert("thumbnail".into(), json!({ "url": thumb }));
        }
        if !clean.fields.is_empty() {
            let fields: Vec<Value> = clean
                .fields
                .iter()
                .map(|f| json!({ "name": f.name, "value": f.value, "inline": f.inline }))
                .collect();
            out.insert("fields".into(), json!(fields));
        }
        if let Some(raw) = &clean.timestamp {
            match super::parse_embed_timestamp(raw) {
                Some(ts) => {
                    out.insert("timestamp".into(), json!(ts.to_rfc3339()));
                }
                None => warn!(value = %raw, "discarding unparsable embed timestamp"),
            }
        }

        Value::Object(out)
    }

    /// Sends a message via `POST /channels/{id}/messages`.
    pub async fn send(
        &self,
        target_chat_id: &str,
        content: &OutboundContent,
    ) -> Result<DeliveryReceipt> {
        let mut body = serde_json::Map::new();
        if let Some(text) = &content.text {
            body.insert("content".into(), json!(text));
        }
        if let Some(embed) = &content.embed {
            body.insert("embeds".into(), json!([Self::build_embed_json(embed)]));
        }

        let resp = self
            .client
            .post(format!(
                "{}/channels/{}/messages",
                DISCORD_API_BASE, target_chat_id
            ))
            .header("Authorization", format!("Bot {}", self.token))
            .json(&Value::Object(body))
            .send()
            .await
            .map_err(classify_transport_error)?;
        let resp = ensure_success(resp).await?;
        let created: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(DeliveryReceipt {
            provider_message_id: created
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn react(&self, chat_id: &str, message_id: &str, emoji: &str, add: bool) -> Result<()> {
        let url = format!(
            "{}/channels/{}/messages/{}/reactions/{}/@me",
            DISCORD_API_BASE,
            chat_id,
            message_id,
            urlencoding::encode(emoji)
        );
        let req = if add {
            self.client.put(url)
        } else {
            self.client.delete(url)
        };
        let resp = req
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await
            .map_err(classify_transport_error)?;
        ensure_success(resp).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Reactable for DiscordProvider {
    async fn send_reaction(
        &self,
        chat_id: &str,
        native_message_id: &str,
        emoji: &str,
        _from_me: bool,
    ) -> Result<()> {
        self.react(chat_id, native_message_id, emoji, true).await
    }

    async fn remove_reaction(
        &self,
        chat_id: &str,
        native_message_id: &str,
        emoji: &str,
        _from_me: bool,
    ) -> Result<()> {
        self.react(chat_id, native_message_id, emoji, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderSettings;
    use serde_json::json;
    use std::collections::HashMap;

    fn test_provider() -> DiscordProvider {
        let creds = HashMap::from([(
            "bot_token".to_string(),
            "MTA1.MjgxNTQ2NTUyNjQ2NDU1Mg.G4vQxK".to_string(),
        )]);
        let conn =
            PlatformConnection::new("proj", Platform::Discord, "dc", creds).unwrap();
        let ctx = ProviderContext::new(
            Arc::new(EventBus::new()),
            Arc::new(DedupCache::default()),
            ProviderSettings::default(),
        );
        DiscordProvider::from_connection(&conn, ctx).unwrap()
    }

    fn message_create(id: &str) -> Value {
        json!({
            "id": id,
            "content": "hello",
            "channel_id": "111222333444555666",
            "author": { "id": "999888777666555444", "bot": false }
        })
    }

    #[test]
    fn test_from_connection_requires_token() {
        let conn =
            PlatformConnection::new("proj", Platform::Discord, "dc", HashMap::new()).unwrap();
        let ctx = ProviderContext::new(
            Arc::new(EventBus::new()),
            Arc::new(DedupCache::default()),
            ProviderSettings::default(),
        );
        assert!(DiscordProvider::from_connection(&conn, ctx).is_err());
    }

    #[test]
    fn test_identify_payload_shape() {
        let payload: Value =
            serde_json::from_str(&DiscordProvider::build_identify_payload("tok")).unwrap();
        assert_eq!(payload["op"], 2);
        assert_eq!(payload["d"]["token"], "tok");
        assert_eq!(payload["d"]["intents"], GATEWAY_INTENTS);
    }

    #[test]
    fn test_heartbeat_payload_with_and_without_sequence() {
        let with: Value =
            serde_json::from_str(&DiscordProvider::build_heartbeat_payload(Some(42))).unwrap();
        assert_eq!(with["op"], 1);
        assert_eq!(with["d"], 42);

        let without: Value =
            serde_json::from_str(&DiscordProvider::build_heartbeat_payload(None)).unwrap();
        assert!(without["d"].is_null());
    }

    #[test]
    fn test_heartbeat_interval_extraction() {
        assert_eq!(
            DiscordProvider::extract_heartbeat_interval(&json!({"heartbeat_interval": 41250})),
            41250
        );
        assert_eq!(
            DiscordProvider::extract_heartbeat_interval(&json!({})),
            DEFAULT_HEARTBEAT_MS
        );
    }

    #[test]
    fn test_backoff_delay_increases_and_caps() {
        assert!(DiscordProvider::backoff_delay(1) < DiscordProvider::backoff_delay(3));
        assert_eq!(
            DiscordProvider::backoff_delay(50),
            Duration::from_secs(MAX_RECONNECT_DELAY_SECS)
        );
    }

    #[test]
    fn test_build_envelope_from_message_create() {
        let p = test_provider();
        let env =
            DiscordProvider::build_envelope(&message_create("msg-1"), &p.connection_ref, &p.dedup)
                .unwrap();
        assert_eq!(env.channel, Platform::Discord);
        assert_eq!(env.chat_id, "111222333444555666");
        assert_eq!(env.sender_id, "999888777666555444");
        assert_eq!(env.text, "hello");
    }

    #[test]
    fn test_bot_message_ignored() {
        let p = test_provider();
        let mut data = message_create("msg-2");
        data["author"]["bot"] = json!(true);
        assert!(DiscordProvider::build_envelope(&data, &p.connection_ref, &p.dedup).is_none());
    }

    #[test]
    fn test_empty_message_ignored() {
        let p = test_provider();
        let mut data = message_create("msg-3");
        data["content"] = json!("");
        assert!(DiscordProvider::build_envelope(&data, &p.connection_ref, &p.dedup).is_none());
    }

    #[test]
    fn test_duplicate_message_suppressed() {
        let p = test_provider();
        let data = message_create("msg-4");
        assert!(DiscordProvider::build_envelope(&data, &p.connection_ref, &p.dedup).is_some());
        assert!(DiscordProvider::build_envelope(&data, &p.connection_ref, &p.dedup).is_none());
    }

    #[test]
    fn test_attachments_mapped_by_content_type() {
        let p = test_provider();
        let mut data = message_create("msg-5");
        data["attachments"] = json!([
            {"url": "https://cdn.discordapp.com/a.png", "filename": "a.png", "content_type": "image/png"},
            {"url": "https://cdn.discordapp.com/b.pdf", "filename": "b.pdf", "content_type": "application/pdf"}
        ]);
        let env = DiscordProvider::build_envelope(&data, &p.connection_ref, &p.dedup).unwrap();
        assert_eq!(env.attachments.len(), 2);
        assert_eq!(env.attachments[0].media_type, MediaType::Image);
        assert_eq!(env.attachments[1].media_type, MediaType::Document);
    }

    #[test]
    fn test_embed_json_parses_color_and_drops_bad_urls() {
        let embed = MessageEmbed {
            title: Some("t".into()),
            color: Some("#FF5733".into()),
            image_url: Some("http://127.0.0.1/x.png".into()),
            ..Default::default()
        };
        let out = DiscordProvider::build_embed_json(&embed);
        assert_eq!(out["color"], 16734003);
        assert_eq!(out["title"], "t");
        assert!(out.get("image").is_none());
    }

    #[test]
    fn test_embed_json_omits_unparsable_color() {
        let embed = MessageEmbed {
            title: Some("t".into()),
            color: Some("not-a-color".into()),
            ..Default::default()
        };
        let out = DiscordProvider::build_embed_json(&embed);
        assert!(out.get("color").is_none());
        assert_eq!(out["title"], "t");
    }
}
