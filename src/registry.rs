//! Platform registry — the runtime directory of live provider instances.
//!
//! Holds exactly one live registration per active connection, keyed by
//! [`ConnectionRef`], plus a secondary `(platform, webhook_token)` index for
//! O(1) webhook resolution. Both maps live behind a single lock so readers
//! always observe a consistent snapshot: a resolve can never see one map
//! updated and the other stale.
//!
//! The registry is an owned object handed by `Arc` to the webhook router
//! and the dispatch queue at construction time; there is no global.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::info;

use crate::connection::{ConnectionRef, Platform, PlatformConnection};
use crate::error::{GatewayError, Result};
use crate::providers::{
    Capabilities, ConnectionType, PlatformProvider, ProviderContext, ProviderHandle,
};

/// One live entry: adapter instance, static capability metadata, and the
/// live handle returned by activation.
pub struct Registration {
    pub provider: PlatformProvider,
    pub capabilities: Capabilities,
    handle: Mutex<Option<ProviderHandle>>,
}

impl Registration {
    pub fn connection_ref(&self) -> &ConnectionRef {
        self.provider.connection_ref()
    }
}

#[derive(Default)]
struct RegistryInner {
    by_ref: HashMap<ConnectionRef, Arc<Registration>>,
    by_token: HashMap<(Platform, String), ConnectionRef>,
}

/// Runtime directory mapping connections to live provider instances.
pub struct PlatformRegistry {
    ctx: ProviderContext,
    inner: RwLock<RegistryInner>,
}

impl PlatformRegistry {
    /// Creates an empty registry whose providers will be built with the
    /// given context.
    pub fn new(ctx: ProviderContext) -> Self {
        Self {
            ctx,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Activates a connection and stores the live registration.
    ///
    /// Activation runs before the lock is taken; a failed activation leaves
    /// no partial entry. A ref or webhook-token collision deactivates the
    /// freshly created handle and fails with a validation error, keeping
    /// the existing registration untouched.
    pub async fn register(&self, conn: &PlatformConnection) -> Result<()> {
        let provider = PlatformProvider::for_connection(conn, self.ctx.clone())?;
        let handle = provider.activate().await?;
        let connection_ref = conn.connection_ref();
        let registration = Arc::new(Registration {
            capabilities: provider.capabilities(),
            provider,
            handle: Mutex::new(Some(handle)),
        });

        let conflict = {
            let mut inner = self.inner.write().unwrap();
            let token_key = conn
                .webhook_token
                .as_ref()
                .map(|token| (conn.platform, token.clone()));
            if inner.by_ref.contains_key(&connection_ref)
                || token_key
                    .as_ref()
                    .is_some_and(|key| inner.by_token.contains_key(key))
            {
                true
            } else {
                if let Some(key) = token_key {
                    inner.by_token.insert(key, connection_ref.clone());
                }
                inner
                    .by_ref
                    .insert(connection_ref.clone(), Arc::clone(&registration));
                false
            }
        };

        if conflict {
            let handle = registration.handle.lock().await.take();
            if let Some(handle) = handle {
                registration.provider.deactivate(handle).await;
            }
            return Err(GatewayError::Validation(format!(
                "connection {} is already registered",
                connection_ref
            )));
        }

        info!(connection = %connection_ref, platform = %conn.platform, "provider registered");
        Ok(())
    }

    /// Tears down a live registration.
    ///
    /// Both mapping entries are removed under the lock; deactivation runs
    /// after it is released so in-flight resolves never observe a provider
    /// mid-teardown.
    pub async fn unregister(&self, connection_ref: &ConnectionRef) -> Result<()> {
        let registration = {
            let mut inner = self.inner.write().unwrap();
            let registration = inner.by_ref.remove(connection_ref).ok_or_else(|| {
                GatewayError::NotFound(format!("connection {} is not registered", connection_ref))
            })?;
            inner.by_token.retain(|_, target| target != connection_ref);
            registration
        };

        let handle = registration.handle.lock().await.take();
        if let Some(handle) = handle {
            registration.provider.deactivate(handle).await;
        }
        info!(connection = %connection_ref, "provider unregistered");
        Ok(())
    }

    /// Resolves the provider for an inbound webhook. Pure lookup, no side
    /// effects, so at-least-once webhook deliveries stay idempotent here.
    pub fn resolve(&self, platform: Platform, webhook_token: &str) -> Option<Arc<Registration>> {
        let inner = self.inner.read().unwrap();
        let connection_ref = inner
            .by_token
            .get(&(platform, webhook_token.to_string()))?;
        inner.by_ref.get(connection_ref).cloned()
    }

    /// Resolves the provider for an outbound target.
    pub fn resolve_ref(&self, connection_ref: &ConnectionRef) -> Option<Arc<Registration>> {
        self.inner.read().unwrap().by_ref.get(connection_ref).cloned()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_ref.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of registered webhook-type providers, for the informational
    /// health endpoint only — never used for routing decisions.
    pub fn webhook_platforms(&self) -> Vec<(Platform, ConnectionRef)> {
        let inner = self.inner.read().unwrap();
        inner
            .by_ref
            .values()
            .filter(|reg| reg.provider.connection_type() == ConnectionType::Webhook)
            .map(|reg| (reg.provider.platform(), reg.connection_ref().clone()))
            .collect()
    }
}
