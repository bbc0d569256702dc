//! Gateway configuration.
//!
//! Loaded from a TOML file with serde defaults for every field, so an empty
//! file (or none at all) yields a working local configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::DispatchConfig;
use crate::error::{GatewayError, Result};
use crate::providers::ProviderSettings;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Webhook HTTP server.
    #[serde(default)]
    pub webhook: WebhookServerConfig,
    /// Outbound dispatch queue.
    #[serde(default)]
    pub dispatch: DispatchSettings,
    /// Event bus sizing.
    #[serde(default)]
    pub bus: BusSettings,
    /// Inbound duplicate suppression.
    #[serde(default)]
    pub dedup: DedupSettings,
    /// Provider remote-call behavior.
    #[serde(default)]
    pub provider: ProviderCallSettings,
}

/// Webhook HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookServerConfig {
    /// Address to bind the HTTP server to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on.
    #[serde(default = "default_webhook_port")]
    pub port: u16,
    /// Public base URL of this gateway, used when registering webhooks with
    /// remote platforms at activation time (e.g. `https://gw.example.com`).
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_webhook_port() -> u16 {
    8080
}

impl Default for WebhookServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_webhook_port(),
            public_base_url: None,
        }
    }
}

/// Dispatch queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_workers() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_queue_depth() -> usize {
    256
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// Event bus sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Broadcast buffer per subscriber before lag kicks in.
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

fn default_bus_capacity() -> usize {
    256
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

/// Duplicate-suppression window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupSettings {
    #[serde(default = "default_dedup_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_dedup_max_entries")]
    pub max_entries: usize,
}

fn default_dedup_ttl_secs() -> u64 {
    600
}

fn default_dedup_max_entries() -> usize {
    10_000
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_dedup_ttl_secs(),
            max_entries: default_dedup_max_entries(),
        }
    }
}

/// Remote platform call behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCallSettings {
    /// Upper bound on every remote platform call, in seconds. Expiry is
    /// treated as a transient (retryable) failure.
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider_timeout_secs() -> u64 {
    15
}

impl Default for ProviderCallSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_provider_timeout_secs(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| GatewayError::Validation(format!("invalid config file: {}", e)))
    }

    /// Adapter settings derived from this config.
    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            timeout: Duration::from_secs(self.provider.timeout_secs),
            public_base_url: self.webhook.public_base_url.clone(),
        }
    }

    /// Dispatch queue settings derived from this config.
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            workers: self.dispatch.workers,
            max_attempts: self.dispatch.max_attempts,
            base_delay: Duration::from_millis(self.dispatch.base_delay_ms),
            max_delay: Duration::from_millis(self.dispatch.max_delay_ms),
            queue_depth: self.dispatch.queue_depth,
        }
    }

    /// Dedup cache TTL.
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.webhook.bind_address, "0.0.0.0");
        assert_eq!(config.webhook.port, 8080);
        assert_eq!(config.dispatch.workers, 4);
        assert_eq!(config.dispatch.max_attempts, 5);
        assert_eq!(config.bus.capacity, 256);
        assert_eq!(config.dedup.ttl_secs, 600);
        assert_eq!(config.provider.timeout_secs, 15);
    }

    #[test]
    fn test_partial_config_overrides() {
        let config: Config = toml::from_str(
            r#"
            [webhook]
            port = 9000
            public_base_url = "https://gw.example.com"

            [dispatch]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.webhook.port, 9000);
        assert_eq!(
            config.webhook.public_base_url.as_deref(),
            Some("https://gw.example.com")
        );
        assert_eq!(config.dispatch.max_attempts, 2);
        // Untouched sections keep their defaults.
        assert_eq!(config.dispatch.workers, 4);
    }

    #[test]
    fn test_derived_settings() {
        let config = Config::default();
        let provider = config.provider_settings();
        assert_eq!(provider.timeout, Duration::from_secs(15));
        assert!(provider.public_base_url.is_none());

        let dispatch = config.dispatch_config();
        assert_eq!(dispatch.base_delay, Duration::from_millis(500));
        assert_eq!(dispatch.max_delay, Duration::from_millis(60_000));
    }

    #[test]
    fn test_invalid_toml_is_validation_error() {
        let result = toml::from_str::<Config>("webhook = 3");
        assert!(result.is_err());
    }
}
