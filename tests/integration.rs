//! Integration tests for omnigate
//!
//! These tests verify that the components work together: webhook routing
//! into the event bus, registry lifecycle, outbound dispatch with retry
//! classification against a local stub platform server, and reaction
//! targeting end to end.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use omnigate::bus::{DedupCache, EventBus};
use omnigate::credentials::{validator, CredentialValidator};
use omnigate::dispatch::{DeliveryResult, DispatchConfig, DispatchQueue};
use omnigate::providers::{OutboundContent, ProviderContext, ProviderSettings};
use omnigate::registry::PlatformRegistry;
use omnigate::resolve::{InMemoryMessageStore, MessageStore, ReceivedMessage, SentMessage};
use omnigate::webhook::WebhookRouter;
use omnigate::{GatewayError, Platform, PlatformConnection};

// ============================================================================
// Fixtures
// ============================================================================

struct Gateway {
    bus: Arc<EventBus>,
    registry: Arc<PlatformRegistry>,
    store: Arc<InMemoryMessageStore>,
    queue: DispatchQueue,
}

fn gateway() -> Gateway {
    let bus = Arc::new(EventBus::new());
    let ctx = ProviderContext::new(
        Arc::clone(&bus),
        Arc::new(DedupCache::default()),
        ProviderSettings::default(),
    );
    let registry = Arc::new(PlatformRegistry::new(ctx));
    let store = Arc::new(InMemoryMessageStore::new());
    let queue = DispatchQueue::new(
        Arc::clone(&registry),
        Arc::clone(&store) as Arc<dyn MessageStore>,
        DispatchConfig {
            workers: 2,
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            queue_depth: 16,
        },
    );
    Gateway {
        bus,
        registry,
        store,
        queue,
    }
}

async fn register_test_connection(
    registry: &PlatformRegistry,
    platform: Platform,
) -> PlatformConnection {
    let mut creds = validator(platform).example_credentials();
    // Test deliveries carry no Telegram secret header.
    creds.remove("secret_token");
    let conn = PlatformConnection::new("proj", platform, "conn", creds)
        .unwrap()
        .with_test_mode();
    registry.register(&conn).await.unwrap();
    conn
}

/// Registers a WhatsApp connection whose Evolution server is the given stub.
async fn register_whatsapp_against(
    registry: &PlatformRegistry,
    addr: SocketAddr,
) -> PlatformConnection {
    let creds: HashMap<String, String> = HashMap::from([
        ("server_url".to_string(), format!("http://{}", addr)),
        (
            "api_key".to_string(),
            "B6D9F2E1A4C87035D1E9B2F4A6C80317".to_string(),
        ),
        ("instance_name".to_string(), "support-line".to_string()),
    ]);
    let conn = PlatformConnection::new("proj", Platform::WhatsAppEvo, "wa", creds)
        .unwrap()
        .with_test_mode();
    registry.register(&conn).await.unwrap();
    conn
}

fn telegram_update(message_id: i64, text: &str) -> String {
    json!({
        "update_id": message_id,
        "message": {
            "message_id": message_id,
            "from": { "id": 7, "is_bot": false },
            "chat": { "id": 253191879i64 },
            "text": text,
        }
    })
    .to_string()
}

// ============================================================================
// Stub platform server
// ============================================================================

/// Minimal HTTP server answering each request with the canned response for
/// its index (the last one repeats). Returns the bound address and the
/// request counter.
async fn spawn_stub(responses: Vec<(u16, String)>) -> (SocketAddr, Arc<AtomicUsize>, JoinHandle<()>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = Arc::clone(&counter);

    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let index = counter_clone.fetch_add(1, Ordering::SeqCst);
            let (status, body) = responses
                .get(index.min(responses.len() - 1))
                .cloned()
                .unwrap_or((200, "{}".to_string()));

            // Drain the request: headers plus announced body.
            let mut buf = vec![0u8; 65_536];
            let mut total = 0usize;
            loop {
                match tokio::time::timeout(
                    Duration::from_secs(2),
                    stream.read(&mut buf[total..]),
                )
                .await
                {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => {
                        total += n;
                        let data = &buf[..total];
                        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                            let headers = String::from_utf8_lossy(&data[..pos]);
                            let expected = headers
                                .lines()
                                .find_map(|line| {
                                    let (name, value) = line.split_once(':')?;
                                    name.eq_ignore_ascii_case("content-length")
                                        .then(|| value.trim().parse::<usize>().ok())?
                                })
                                .unwrap_or(0);
                            if total - pos - 4 >= expected {
                                break;
                            }
                        }
                    }
                    _ => break,
                }
            }

            let response = format!(
                "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        }
    });

    (addr, counter, task)
}

// ============================================================================
// Inbound: webhook → registry → provider → bus
// ============================================================================

#[tokio::test]
async fn test_inbound_flow_end_to_end() {
    let gw = gateway();
    let conn = register_test_connection(&gw.registry, Platform::Telegram).await;
    let mut rx = gw.bus.subscribe();

    let router = WebhookRouter::new(Arc::clone(&gw.registry));
    let handle = router.serve("127.0.0.1", 0).await.unwrap();
    let base = format!("http://{}", handle.addr());
    let client = reqwest::Client::new();

    let url = format!(
        "{}/webhooks/telegram/{}",
        base,
        conn.webhook_token.as_ref().unwrap()
    );
    let resp = client
        .post(&url)
        .body(telegram_update(1, "hello gateway"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let envelope = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.channel, Platform::Telegram);
    assert_eq!(envelope.connection_ref, conn.connection_ref());
    assert_eq!(envelope.chat_id, "253191879");
    assert_eq!(envelope.text, "hello gateway");

    handle.stop().await;
}

#[tokio::test]
async fn test_duplicate_webhook_delivery_yields_one_envelope() {
    let gw = gateway();
    let conn = register_test_connection(&gw.registry, Platform::Telegram).await;
    let mut rx = gw.bus.subscribe();

    let router = WebhookRouter::new(Arc::clone(&gw.registry));
    let handle = router.serve("127.0.0.1", 0).await.unwrap();
    let url = format!(
        "http://{}/webhooks/telegram/{}",
        handle.addr(),
        conn.webhook_token.as_ref().unwrap()
    );
    let client = reqwest::Client::new();

    // The platform redelivers the same update (at-least-once semantics).
    for _ in 0..2 {
        let resp = client
            .post(&url)
            .body(telegram_update(77, "once only"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
    }

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.text, "once only");
    assert!(rx.try_recv().is_err(), "duplicate produced a second envelope");

    handle.stop().await;
}

#[tokio::test]
async fn test_unknown_webhook_pair_is_404_and_silent() {
    let gw = gateway();
    let mut rx = gw.bus.subscribe();

    let router = WebhookRouter::new(Arc::clone(&gw.registry));
    let handle = router.serve("127.0.0.1", 0).await.unwrap();
    let url = format!("http://{}/webhooks/telegram/unknown-token", handle.addr());

    let resp = reqwest::Client::new()
        .post(&url)
        .body(telegram_update(5, "nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    assert!(rx.try_recv().is_err());

    handle.stop().await;
}

// ============================================================================
// Registry lifecycle
// ============================================================================

#[tokio::test]
async fn test_registry_round_trip_and_teardown() {
    let gw = gateway();
    let conn = register_test_connection(&gw.registry, Platform::WhatsAppEvo).await;
    let token = conn.webhook_token.clone().unwrap();

    let registration = gw.registry.resolve(Platform::WhatsAppEvo, &token).unwrap();
    assert_eq!(*registration.connection_ref(), conn.connection_ref());

    gw.registry.unregister(&conn.connection_ref()).await.unwrap();
    assert!(gw.registry.resolve(Platform::WhatsAppEvo, &token).is_none());
    assert!(gw.registry.resolve_ref(&conn.connection_ref()).is_none());
}

// ============================================================================
// Outbound dispatch against a stub platform
// ============================================================================

#[tokio::test]
async fn test_dispatch_delivers_and_reports_receipt() {
    let gw = gateway();
    let ok_body = json!({"key": {"id": "EVO-MSG-1"}}).to_string();
    let (addr, counter, stub) = spawn_stub(vec![(200, ok_body)]).await;
    let conn = register_whatsapp_against(&gw.registry, addr).await;

    let mut outcomes = gw.queue.subscribe_outcomes();
    gw.queue
        .submit_send(
            &conn.connection_ref(),
            "5511999999999@s.whatsapp.net",
            OutboundContent::text("hello"),
        )
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.result.is_delivered());
    assert_eq!(outcome.attempts, 1);
    match outcome.result {
        DeliveryResult::Delivered {
            provider_message_id,
        } => assert_eq!(provider_message_id.as_deref(), Some("EVO-MSG-1")),
        other => panic!("expected delivery, got {:?}", other),
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    stub.abort();
}

#[tokio::test]
async fn test_auth_failure_is_never_retried() {
    let gw = gateway();
    let (addr, counter, stub) =
        spawn_stub(vec![(401, "{\"error\":\"bad apikey\"}".to_string())]).await;
    let conn = register_whatsapp_against(&gw.registry, addr).await;

    let mut outcomes = gw.queue.subscribe_outcomes();
    gw.queue
        .submit_send(
            &conn.connection_ref(),
            "chat",
            OutboundContent::text("hello"),
        )
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!outcome.result.is_delivered());
    assert_eq!(outcome.attempts, 1, "auth errors must not be retried");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    stub.abort();
}

#[tokio::test]
async fn test_rate_limit_is_retried_then_succeeds() {
    let gw = gateway();
    let (addr, counter, stub) = spawn_stub(vec![
        (429, "{\"error\":\"slow down\"}".to_string()),
        (200, "{}".to_string()),
    ])
    .await;
    let conn = register_whatsapp_against(&gw.registry, addr).await;

    let mut outcomes = gw.queue.subscribe_outcomes();
    gw.queue
        .submit_send(
            &conn.connection_ref(),
            "chat",
            OutboundContent::text("hello"),
        )
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.result.is_delivered());
    assert_eq!(outcome.attempts, 2);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    stub.abort();
}

#[tokio::test]
async fn test_rate_limit_exhausts_attempt_bound() {
    let gw = gateway();
    // Stub never recovers; max_attempts is 2.
    let (addr, counter, stub) =
        spawn_stub(vec![(429, "{\"error\":\"still limited\"}".to_string())]).await;
    let conn = register_whatsapp_against(&gw.registry, addr).await;

    let mut outcomes = gw.queue.subscribe_outcomes();
    gw.queue
        .submit_send(
            &conn.connection_ref(),
            "chat",
            OutboundContent::text("hello"),
        )
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!outcome.result.is_delivered());
    assert_eq!(outcome.attempts, 2, "retried once, then terminal");
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    stub.abort();
}

// ============================================================================
// Reaction targeting
// ============================================================================

#[tokio::test]
async fn test_reaction_targets_received_message() {
    let gw = gateway();
    let ok_body = "{}".to_string();
    let (addr, _counter, stub) = spawn_stub(vec![(200, ok_body)]).await;
    let conn = register_whatsapp_against(&gw.registry, addr).await;

    gw.store
        .record_received(ReceivedMessage {
            connection_ref: conn.connection_ref(),
            platform: Platform::WhatsAppEvo,
            provider_message_id: "WA-1".to_string(),
            provider_chat_id: "253191879".to_string(),
        })
        .await;

    let mut outcomes = gw.queue.subscribe_outcomes();
    gw.queue
        .submit_react(&conn.connection_ref(), "WA-1", "👍")
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.result.is_delivered());
    // from_me=false resolution targets the inbound conversation.
    assert_eq!(outcome.target_chat_id, "253191879");
    stub.abort();
}

#[tokio::test]
async fn test_reaction_targets_sent_message_when_no_received() {
    let gw = gateway();
    let (addr, _counter, stub) = spawn_stub(vec![(200, "{}".to_string())]).await;
    let conn = register_whatsapp_against(&gw.registry, addr).await;

    gw.store
        .record_sent(SentMessage {
            connection_ref: conn.connection_ref(),
            platform: Platform::WhatsAppEvo,
            provider_message_id: "WA-2".to_string(),
            target_chat_id: "X".to_string(),
        })
        .await;

    let mut outcomes = gw.queue.subscribe_outcomes();
    gw.queue
        .submit_unreact(&conn.connection_ref(), "WA-2", "👍")
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.result.is_delivered());
    assert_eq!(outcome.target_chat_id, "X");
    stub.abort();
}

#[tokio::test]
async fn test_reaction_on_missing_message_is_not_found() {
    let gw = gateway();
    let conn = register_test_connection(&gw.registry, Platform::Telegram).await;

    let err = gw
        .queue
        .submit_react(&conn.connection_ref(), "ghost", "👍")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NotFound(_)));
    assert!(err.to_string().contains("ghost"));
    assert!(err.to_string().contains("telegram"));
}

#[tokio::test]
async fn test_reaction_on_email_is_unsupported_when_message_exists() {
    let gw = gateway();
    let conn = register_test_connection(&gw.registry, Platform::Email).await;

    gw.store
        .record_received(ReceivedMessage {
            connection_ref: conn.connection_ref(),
            platform: Platform::Email,
            provider_message_id: "mail-1".to_string(),
            provider_chat_id: "sender@example.com".to_string(),
        })
        .await;

    let err = gw
        .queue
        .submit_react(&conn.connection_ref(), "mail-1", "👍")
        .await
        .unwrap_err();
    match err {
        GatewayError::UnsupportedOperation { platform, .. } => assert_eq!(platform, "email"),
        other => panic!("expected UnsupportedOperation, got {:?}", other),
    }
}

// ============================================================================
// Per-conversation ordering
// ============================================================================

#[tokio::test]
async fn test_same_conversation_preserves_submission_order() {
    let gw = gateway();
    let (addr, _counter, stub) = spawn_stub(vec![(200, "{}".to_string())]).await;
    let conn = register_whatsapp_against(&gw.registry, addr).await;

    let mut outcomes = gw.queue.subscribe_outcomes();
    let mut submitted = Vec::new();
    for i in 0..4 {
        let id = gw
            .queue
            .submit_send(
                &conn.connection_ref(),
                "one-chat",
                OutboundContent::text(&format!("msg {}", i)),
            )
            .await
            .unwrap();
        submitted.push(id);
    }

    let mut completed = Vec::new();
    for _ in 0..4 {
        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.result.is_delivered());
        completed.push(outcome.task_id);
    }
    assert_eq!(completed, submitted, "per-conversation order was not preserved");
    stub.abort();
}
