//! Email adapter (outbound SMTP via `lettre`).
//!
//! Send-only: the gateway core carries no IMAP poll loop, so this adapter
//! has no inbound handler and no reaction capability. Port 465 credentials
//! use implicit TLS (`smtp_secure = "true"`), everything else STARTTLS.

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use crate::connection::{ConnectionRef, PlatformConnection};
use crate::error::{DeliveryError, GatewayError, Result};

use super::{
    render_plaintext, sanitize_embed, DeliveryReceipt, OutboundContent, ProviderContext,
    ProviderHandle,
};

/// Subjects longer than this are truncated.
const MAX_SUBJECT_LEN: usize = 120;

/// Email adapter for one connection.
pub struct EmailProvider {
    connection_ref: ConnectionRef,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    reply_to: Option<Mailbox>,
    test_mode: bool,
}

impl EmailProvider {
    /// Builds the SMTP transport from a validated connection.
    pub fn from_connection(conn: &PlatformConnection, _ctx: ProviderContext) -> Result<Self> {
        let get = |key: &str| -> Result<String> {
            conn.credential(key)
                .map(str::to_string)
                .ok_or_else(|| GatewayError::Validation(format!("email connection lacks {}", key)))
        };

        let host = get("smtp_host")?;
        let port: u16 = get("smtp_port")?
            .trim()
            .parse()
            .map_err(|_| GatewayError::Validation("smtp_port is not a valid port".into()))?;
        let implicit_tls = conn.credential("smtp_secure") == Some("true");

        let builder = if implicit_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&host)
        }
        .map_err(|e| GatewayError::Validation(format!("invalid SMTP relay config: {}", e)))?;
        let transport = builder
            .port(port)
            .credentials(Credentials::new(get("smtp_username")?, get("smtp_password")?))
            .build();

        let from: Mailbox = get("from_address")?
            .parse()
            .map_err(|_| GatewayError::Validation("from_address is not a valid address".into()))?;
        let reply_to = match conn.credential("reply_to") {
            Some(addr) => Some(addr.parse().map_err(|_| {
                GatewayError::Validation("reply_to is not a valid address".into())
            })?),
            None => None,
        };

        Ok(Self {
            connection_ref: conn.connection_ref(),
            transport,
            from,
            reply_to,
            test_mode: conn.test_mode,
        })
    }

    pub fn connection_ref(&self) -> &ConnectionRef {
        &self.connection_ref
    }

    /// Probes the SMTP server. Test-mode connections activate inert.
    pub async fn activate(&self) -> Result<ProviderHandle> {
        if self.test_mode {
            debug!(connection = %self.connection_ref, "email test-mode activation, connection test skipped");
            return Ok(ProviderHandle::inert());
        }
        match self.transport.test_connection().await {
            Ok(true) => Ok(ProviderHandle::inert()),
            Ok(false) => Err(GatewayError::Activation(
                "SMTP server refused the connection test".into(),
            )),
            Err(e) => Err(GatewayError::Activation(format!(
                "SMTP connection test failed: {}",
                e
            ))),
        }
    }

    /// Subject line: embed title when present, else the first text line.
    fn build_subject(content: &OutboundContent) -> String {
        let subject = content
            .embed
            .as_ref()
            .and_then(|e| e.title.clone())
            .or_else(|| {
                content
                    .text
                    .as_ref()
                    .and_then(|t| t.lines().next().map(str::to_string))
            })
            .unwrap_or_else(|| "(no subject)".to_string());
        subject.chars().take(MAX_SUBJECT_LEN).collect()
    }

    fn build_body(content: &OutboundContent) -> String {
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

    /// Sends one message; the target chat id is the recipient address.
    pub async fn send(
        &self,
        target_chat_id: &str,
        content: &OutboundContent,
    ) -> Result<DeliveryReceipt> {
        let to: Mailbox = target_chat_id.parse().map_err(|_| {
            GatewayError::Delivery(DeliveryError::Permanent(format!(
                "'{}' is not a valid recipient address",
                target_chat_id
            )))
        })?;

        let body = Self::build_body(content);
        if body.is_empty() {
            return Err(GatewayError::Validation(
                "email send requires text or a renderable embed".into(),
            ));
        }

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(Self::build_subject(content));
        if let Some(reply_to) = &self.reply_to {
            builder = builder.reply_to(reply_to.clone());
        }
        let message = builder
            .body(body)
            .map_err(|e| DeliveryError::Permanent(format!("message build failed: {}", e)))?;

        match self.transport.send(message).await {
            // SMTP acks carry no usable message id.
            Ok(_) => Ok(DeliveryReceipt {
                provider_message_id: None,
            }),
            Err(e) if e.is_permanent() => {
                Err(DeliveryError::Permanent(format!("SMTP rejected: {}", e)).into())
            }
            Err(e) => Err(DeliveryError::Transient(format!("SMTP delivery failed: {}", e)).into()),
        }
    }
}
