//! Message resolution — reaction targeting.
//!
//! Given a project-scoped message identifier, determines whether the
//! message originated as inbound (received) or outbound (sent) and extracts
//! the platform-native conversation identifier needed to act on it.
//!
//! Received messages are checked first: a hit means the reaction targets
//! the inbound conversation with `from_me = false`. Only then is the sent
//! table consulted (`from_me = true`). A message in neither table fails
//! with a not-found error naming the message id and platform — existence
//! is diagnosed before capability, so the more specific error wins.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::connection::{ConnectionRef, Platform};
use crate::error::{GatewayError, Result};

/// A message the gateway received, as persisted by an external consumer.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Connection the message arrived on.
    pub connection_ref: ConnectionRef,
    pub platform: Platform,
    /// Platform-native message id.
    pub provider_message_id: String,
    /// Platform-native conversation the message arrived in.
    pub provider_chat_id: String,
}

/// A message the gateway sent, as persisted by an external consumer.
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Connection the message went out on.
    pub connection_ref: ConnectionRef,
    pub platform: Platform,
    /// Platform-native message id assigned on delivery.
    pub provider_message_id: String,
    /// Platform-native conversation the message was sent to.
    pub target_chat_id: String,
}

/// Read-only persistence boundary for message records.
///
/// Schema and write paths belong to the external persistence collaborator;
/// the core only looks messages up by native message id within a
/// connection.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn find_received(
        &self,
        connection_ref: &ConnectionRef,
        provider_message_id: &str,
    ) -> Result<Option<ReceivedMessage>>;

    async fn find_sent(
        &self,
        connection_ref: &ConnectionRef,
        provider_message_id: &str,
    ) -> Result<Option<SentMessage>>;
}

/// Resolved reaction target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionTarget {
    /// Platform-native conversation to react in.
    pub chat_id: String,
    /// Whether the target message was sent by us.
    pub from_me: bool,
}

/// Resolves the conversation and `from_me` flag for a reaction.
///
/// # Errors
///
/// [`GatewayError::NotFound`] naming the message id and platform when the
/// message exists in neither table.
pub async fn resolve_reaction_target(
    store: &dyn MessageStore,
    connection_ref: &ConnectionRef,
    platform: Platform,
    message_id: &str,
) -> Result<ReactionTarget> {
    if let Some(received) = store.find_received(connection_ref, message_id).await? {
        return Ok(ReactionTarget {
            chat_id: received.provider_chat_id,
            from_me: false,
        });
    }
    if let Some(sent) = store.find_sent(connection_ref, message_id).await? {
        return Ok(ReactionTarget {
            chat_id: sent.target_chat_id,
            from_me: true,
        });
    }
    Err(GatewayError::NotFound(format!(
        "message '{}' on platform '{}'",
        message_id, platform
    )))
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

type Key = (ConnectionRef, String);

/// In-memory [`MessageStore`] backing tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryMessageStore {
    received: RwLock<HashMap<Key, ReceivedMessage>>,
    sent: RwLock<HashMap<Key, SentMessage>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_received(&self, message: ReceivedMessage) {
        let key = (
            message.connection_ref.clone(),
            message.provider_message_id.clone(),
        );
        self.received.write().await.insert(key, message);
    }

    pub async fn record_sent(&self, message: SentMessage) {
        let key = (
            message.connection_ref.clone(),
            message.provider_message_id.clone(),
        );
        self.sent.write().await.insert(key, message);
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn find_received(
        &self,
        connection_ref: &ConnectionRef,
        provider_message_id: &str,
    ) -> Result<Option<ReceivedMessage>> {
        let key = (connection_ref.clone(), provider_message_id.to_string());
        Ok(self.received.read().await.get(&key).cloned())
    }

    async fn find_sent(
        &self,
        connection_ref: &ConnectionRef,
        provider_message_id: &str,
    ) -> Result<Option<SentMessage>> {
        let key = (connection_ref.clone(), provider_message_id.to_string());
        Ok(self.sent.read().await.get(&key).cloned())
    }
}
