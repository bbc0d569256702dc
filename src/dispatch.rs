//! Outbound dispatch queue.
//!
//! Decouples the API call that accepts a send/reaction request from the
//! actual platform call. Tasks are sharded onto a worker pool by
//! `(connection, target chat)` so one conversation never reorders, while
//! different conversations proceed in parallel. Retries run inline in the
//! worker (keeping per-conversation order) with exponential backoff for
//! retryable failures; auth, permanent and unsupported failures are
//! terminal on the first attempt.
//!
//! Reaction submissions run message resolution and the capability check
//! before anything is enqueued, so callers get "message not found" and
//! "platform cannot react" synchronously; the provider itself is resolved
//! again at execution time.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionRef;
use crate::error::{GatewayError, Result};
use crate::providers::{DeliveryReceipt, OutboundContent};
use crate::registry::PlatformRegistry;
use crate::resolve::{resolve_reaction_target, MessageStore};

// ---------------------------------------------------------------------------
// Tasks and outcomes
// ---------------------------------------------------------------------------

/// The unit of queued outbound work.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    pub id: String,
    pub connection_ref: ConnectionRef,
    pub target_chat_id: String,
    pub kind: TaskKind,
    /// Attempts made so far; mutated by the worker.
    pub attempt: u32,
}

/// What the task does once a worker picks it up.
#[derive(Debug, Clone)]
pub enum TaskKind {
    Send {
        content: OutboundContent,
    },
    React {
        native_message_id: String,
        emoji: String,
        from_me: bool,
    },
    Unreact {
        native_message_id: String,
        emoji: String,
        from_me: bool,
    },
}

impl TaskKind {
    fn label(&self) -> &'static str {
        match self {
            TaskKind::Send { .. } => "send",
            TaskKind::React { .. } => "react",
            TaskKind::Unreact { .. } => "unreact",
        }
    }
}

/// Terminal report for one task, published to outcome subscribers.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub task_id: String,
    pub connection_ref: ConnectionRef,
    pub target_chat_id: String,
    /// Attempts consumed, including the final one.
    pub attempts: u32,
    pub result: DeliveryResult,
}

#[derive(Debug, Clone)]
pub enum DeliveryResult {
    Delivered { provider_message_id: Option<String> },
    Failed { error: String },
}

impl DeliveryResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryResult::Delivered { .. })
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Retry and pool sizing for the dispatch queue.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Worker pool size (also the sharding modulus).
    pub workers: usize,
    /// Upper bound on attempts per task, first try included.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Per-worker queue depth; submits fail fast once it is full.
    pub queue_depth: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            queue_depth: 256,
        }
    }
}

fn backoff_delay(config: &DispatchConfig, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    (config.base_delay * factor).min(config.max_delay)
}

/// Whether a failed attempt should be retried.
fn should_retry(err: &GatewayError, attempt: u32, config: &DispatchConfig) -> bool {
    if attempt >= config.max_attempts {
        return false;
    }
    matches!(err, GatewayError::Delivery(delivery) if delivery.is_retryable())
}

/// Stable shard assignment: same `(connection, chat)` pair, same worker.
fn shard_index(connection_ref: &ConnectionRef, target_chat_id: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    connection_ref.hash(&mut hasher);
    target_chat_id.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

// ---------------------------------------------------------------------------
// DispatchQueue
// ---------------------------------------------------------------------------

/// Asynchronous work queue draining delivery tasks into provider calls.
pub struct DispatchQueue {
    registry: Arc<PlatformRegistry>,
    store: Arc<dyn MessageStore>,
    config: DispatchConfig,
    workers: Vec<mpsc::Sender<DeliveryTask>>,
    outcomes: broadcast::Sender<DeliveryOutcome>,
    shutdown: watch::Sender<bool>,
}

impl DispatchQueue {
    /// Spawns the worker pool.
    pub fn new(
        registry: Arc<PlatformRegistry>,
        store: Arc<dyn MessageStore>,
        config: DispatchConfig,
    ) -> Self {
        let worker_count = config.workers.max(1);
        let (outcomes, _) = broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = mpsc::channel(config.queue_depth);
            workers.push(tx);
            tokio::spawn(run_worker(
                index,
                rx,
                Arc::clone(&registry),
                config.clone(),
                outcomes.clone(),
                shutdown_tx.subscribe(),
            ));
        }

        Self {
            registry,
            store,
            config,
            workers,
            outcomes,
            shutdown: shutdown_tx,
        }
    }

    /// Subscribes to terminal task outcomes.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<DeliveryOutcome> {
        self.outcomes.subscribe()
    }

    /// Signals all workers to stop after their current task.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Queues a canonical send. Returns the task id.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NotFound`] when the connection has no live
    /// registration at submission time.
    pub async fn submit_send(
        &self,
        connection_ref: &ConnectionRef,
        target_chat_id: &str,
        content: OutboundContent,
    ) -> Result<String> {
        self.registry.resolve_ref(connection_ref).ok_or_else(|| {
            GatewayError::NotFound(format!("connection {} is not registered", connection_ref))
        })?;
        self.enqueue(
            connection_ref,
            target_chat_id,
            TaskKind::Send { content },
        )
        .await
    }

    /// Resolves a reaction target and queues the reaction.
    ///
    /// Resolution order is deliberate: the message is looked up before the
    /// capability check, so a missing message reports not-found even on
    /// platforms that categorically lack reactions.
    pub async fn submit_react(
        &self,
        connection_ref: &ConnectionRef,
        message_id: &str,
        emoji: &str,
    ) -> Result<String> {
        self.submit_reaction_task(connection_ref, message_id, emoji, false)
            .await
    }

    /// Resolves a reaction target and queues its removal.
    pub async fn submit_unreact(
        &self,
        connection_ref: &ConnectionRef,
        message_id: &str,
        emoji: &str,
    ) -> Result<String> {
        self.submit_reaction_task(connection_ref, message_id, emoji, true)
            .await
    }

    async fn submit_reaction_task(
        &self,
        connection_ref: &ConnectionRef,
        message_id: &str,
        emoji: &str,
        remove: bool,
    ) -> Result<String> {
        let registration = self.registry.resolve_ref(connection_ref).ok_or_else(|| {
            GatewayError::NotFound(format!("connection {} is not registered", connection_ref))
        })?;
        let platform = registration.provider.platform();

        // Existence first, capability second: a missing message is the
        // more specific diagnostic.
        let target =
            resolve_reaction_target(self.store.as_ref(), connection_ref, platform, message_id)
                .await?;
        if registration.provider.as_reactable().is_none() {
            return Err(GatewayError::UnsupportedOperation {
                platform: platform.as_str().to_string(),
                operation: if remove { "unreactFromMessage" } else { "sendReaction" },
            });
        }

        let kind = if remove {
            TaskKind::Unreact {
                native_message_id: message_id.to_string(),
                emoji: emoji.to_string(),
                from_me: target.from_me,
            }
        } else {
            TaskKind::React {
                native_message_id: message_id.to_string(),
                emoji: emoji.to_string(),
                from_me: target.from_me,
            }
        };
        self.enqueue(connection_ref, &target.chat_id, kind).await
    }

    async fn enqueue(
        &self,
        connection_ref: &ConnectionRef,
        target_chat_id: &str,
        kind: TaskKind,
    ) -> Result<String> {
        let task = DeliveryTask {
            id: Uuid::new_v4().to_string(),
            connection_ref: connection_ref.clone(),
            target_chat_id: target_chat_id.to_string(),
            kind,
            attempt: 0,
        };
        let id = task.id.clone();
        let index = shard_index(connection_ref, target_chat_id, self.workers.len());

        debug!(task = %id, worker = index, kind = task.kind.label(), "delivery task queued");
        self.workers[index]
            .try_send(task)
            .map_err(|_| GatewayError::Channel("dispatch queue is full or stopped".to_string()))?;
        Ok(id)
    }

    /// Current retry policy (for diagnostics).
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// One provider call for one task.
async fn execute(registry: &PlatformRegistry, task: &DeliveryTask) -> Result<DeliveryReceipt> {
    let registration = registry.resolve_ref(&task.connection_ref).ok_or_else(|| {
        GatewayError::NotFound(format!(
            "connection {} disappeared before delivery",
            task.connection_ref
        ))
    })?;
    let provider = &registration.provider;

    match &task.kind {
        TaskKind::Send { content } => provider.send(&task.target_chat_id, content).await,
        TaskKind::React {
            native_message_id,
            emoji,
            from_me,
        } => {
            let reactable =
                provider
                    .as_reactable()
                    .ok_or_else(|| GatewayError::UnsupportedOperation {
                        platform: provider.platform().as_str().to_string(),
                        operation: "sendReaction",
                    })?;
            reactable
                .send_reaction(&task.target_chat_id, native_message_id, emoji, *from_me)
                .await?;
            Ok(DeliveryReceipt {
                provider_message_id: None,
            })
        }
        TaskKind::Unreact {
            native_message_id,
            emoji,
            from_me,
        } => {
            let reactable =
                provider
                    .as_reactable()
                    .ok_or_else(|| GatewayError::UnsupportedOperation {
                        platform: provider.platform().as_str().to_string(),
                        operation: "unreactFromMessage",
                    })?;
            reactable
                .remove_reaction(&task.target_chat_id, native_message_id, emoji, *from_me)
                .await?;
            Ok(DeliveryReceipt {
                provider_message_id: None,
            })
        }
    }
}

/// Worker loop: drain the shard queue, retrying retryable failures inline
/// so per-conversation order holds.
async fn run_worker(
    index: usize,
    mut rx: mpsc::Receiver<DeliveryTask>,
    registry: Arc<PlatformRegistry>,
    config: DispatchConfig,
    outcomes: broadcast::Sender<DeliveryOutcome>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker = index, "dispatch worker started");
    loop {
        let mut task = tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!(worker = index, "dispatch worker stopping");
                    return;
                }
                continue;
            }
            task = rx.recv() => match task {
                Some(task) => task,
                None => {
                    debug!(worker = index, "dispatch queue closed");
                    return;
                }
            },
        };

        let result = loop {
            task.attempt += 1;
            match execute(&registry, &task).await {
                Ok(receipt) => {
                    break DeliveryResult::Delivered {
                        provider_message_id: receipt.provider_message_id,
                    };
                }
                Err(err) if should_retry(&err, task.attempt, &config) => {
                    let delay = backoff_delay(&config, task.attempt);
                    warn!(
                        task = %task.id,
                        attempt = task.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "delivery attempt failed, retrying: {}",
                        err
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break DeliveryResult::Failed {
                                    error: "shutdown during retry backoff".to_string(),
                                };
                            }
                        }
                    }
                }
                Err(err) => {
                    error!(task = %task.id, attempt = task.attempt, "delivery failed terminally: {}", err);
                    break DeliveryResult::Failed {
                        error: err.to_string(),
                    };
                }
            }
        };

        let _ = outcomes.send(DeliveryOutcome {
            task_id: task.id.clone(),
            connection_ref: task.connection_ref.clone(),
            target_chat_id: task.target_chat_id.clone(),
            attempts: task.attempt,
            result,
        });
    }
}
