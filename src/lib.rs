//! omnigate — multi-platform messaging gateway core.
//!
//! One normalized API for sending and receiving messages across Discord,
//! Telegram, WhatsApp (via an Evolution API server) and Email.
//!
//! The core is the platform integration layer: providers normalize inbound
//! platform traffic into canonical envelopes on the [`bus::EventBus`], the
//! [`webhook::WebhookRouter`] routes `{platform, token}` deliveries to the
//! live provider held by the [`registry::PlatformRegistry`], and the
//! [`dispatch::DispatchQueue`] drains outbound sends and reactions back to
//! the platforms with retry-safe queueing.

pub mod bus;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod providers;
pub mod registry;
pub mod resolve;
pub mod security;
pub mod webhook;

pub use bus::{CanonicalEnvelope, DedupCache, EventBus, MediaAttachment, MediaType};
pub use config::Config;
pub use connection::{ConnectionRef, Platform, PlatformConnection};
pub use dispatch::{DeliveryOutcome, DeliveryResult, DispatchConfig, DispatchQueue};
pub use error::{DeliveryError, GatewayError, Result};
pub use providers::{
    ConnectionType, MessageEmbed, OutboundContent, PlatformProvider, ProviderContext,
    ProviderSettings, WebhookAck,
};
pub use registry::PlatformRegistry;
pub use resolve::{InMemoryMessageStore, MessageStore, ReactionTarget};
pub use webhook::WebhookRouter;
