//! omnigate binary — wires the gateway core together and serves webhooks.
//!
//! Connection management (create/activate/deactivate) belongs to the API
//! layer that embeds this core; the binary brings up the shared
//! infrastructure and waits for shutdown.

use std::sync::Arc;

use tracing::info;

use omnigate::bus::{DedupCache, EventBus};
use omnigate::config::Config;
use omnigate::dispatch::DispatchQueue;
use omnigate::providers::ProviderContext;
use omnigate::registry::PlatformRegistry;
use omnigate::resolve::InMemoryMessageStore;
use omnigate::webhook::WebhookRouter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let json_logs = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    omnigate::logging::init(json_logs);

    let config_path =
        std::env::var("OMNIGATE_CONFIG").unwrap_or_else(|_| "omnigate.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path)?
    } else {
        info!("no config file at {}, using defaults", config_path);
        Config::default()
    };

    let bus = Arc::new(EventBus::with_capacity(config.bus.capacity));
    let dedup = Arc::new(DedupCache::new(
        config.dedup_ttl(),
        config.dedup.max_entries,
    ));
    let ctx = ProviderContext::new(Arc::clone(&bus), dedup, config.provider_settings());
    let registry = Arc::new(PlatformRegistry::new(ctx));
    let store = Arc::new(InMemoryMessageStore::new());
    let queue = DispatchQueue::new(
        Arc::clone(&registry),
        store,
        config.dispatch_config(),
    );

    // Trace every envelope until a persistence consumer subscribes.
    let _observer = bus.subscribe_with(|envelope| {
        info!(
            platform = %envelope.channel,
            connection = %envelope.connection_ref,
            chat = %envelope.chat_id,
            "inbound message"
        );
    });

    let router = WebhookRouter::new(Arc::clone(&registry));
    let handle = router
        .serve(&config.webhook.bind_address, config.webhook.port)
        .await?;
    info!("omnigate listening on {}", handle.addr());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    queue.stop();
    handle.stop().await;
    Ok(())
}
