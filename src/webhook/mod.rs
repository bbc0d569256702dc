//! Webhook router — the single dynamic HTTP entry point.
//!
//! `ANY /webhooks/{platform}/{webhookToken}` resolves the live provider
//! through the registry and invokes its inbound handler; the handler
//! publishes envelopes to the event bus as a side effect and returns the
//! platform-shaped acknowledgement.
//!
//! `GET /health` reports the registered webhook-type providers for
//! informational purposes only — never for routing decisions.
//!
//! Uses raw TCP + manual HTTP parsing: the surface is two fixed routes with
//! size-capped bodies, which does not justify a web framework dependency.
//!
//! # Status mapping
//!
//! | condition                              | status |
//! |----------------------------------------|--------|
//! | unknown `{platform, token}` pair       | 404    |
//! | provider is not webhook-connected      | 400    |
//! | webhook provider without a handler     | 500    |
//! | handler error, by kind                 | 404 / 401 / 400 / 500 |
//!
//! Handler error bodies are generic; internal error text never reaches the
//! remote platform.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::Platform;
use crate::error::{GatewayError, Result};
use crate::providers::ConnectionType;
use crate::registry::PlatformRegistry;

/// Maximum allowed request body size (1 MB).
const MAX_BODY_SIZE: usize = 1_048_576;

/// Maximum allowed header section size (8 KB).
const MAX_HEADER_SIZE: usize = 8_192;

/// Per-connection read timeout.
const READ_TIMEOUT_SECS: u64 = 5;

/// Parsed representation of an incoming HTTP request (first line + headers + body).
struct ParsedHttpRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: String,
}

/// The routing outcome for one request: status code plus response body.
struct RouteResponse {
    status: u16,
    body: String,
}

impl RouteResponse {
    fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Handle to a running router; stopping it closes the listener.
pub struct RouterHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RouterHandle {
    /// The bound listen address (useful with port 0 in tests).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting connections and waits for the accept loop to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// The single dynamic HTTP entry point for all webhook platforms.
pub struct WebhookRouter {
    registry: Arc<PlatformRegistry>,
}

impl WebhookRouter {
    pub fn new(registry: Arc<PlatformRegistry>) -> Self {
        Self { registry }
    }

    /// Binds the listener and spawns the accept loop.
    pub async fn serve(self, bind_address: &str, port: u16) -> Result<RouterHandle> {
        let listener = TcpListener::bind((bind_address, port)).await?;
        let addr = listener.local_addr()?;
        info!("webhook router listening on {}", addr);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let router = Arc::new(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("webhook router shutting down");
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!("webhook connection from {}", peer);
                                let router = Arc::clone(&router);
                                tokio::spawn(async move {
                                    router.handle_connection(stream).await;
                                });
                            }
                            Err(e) => {
                                warn!("webhook accept failed: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(RouterHandle {
            addr,
            shutdown: shutdown_tx,
            task,
        })
    }

    // --- HTTP plumbing ---

    fn find_header_end(data: &[u8]) -> Option<usize> {
        data.windows(4).position(|window| window == b"\r\n\r\n")
    }

    /// Parse a raw HTTP request from bytes into structured parts.
    ///
    /// Intentionally minimal — only what the router needs: method, path,
    /// headers, and a UTF-8 body.
    fn parse_http_request(raw: &[u8]) -> Result<ParsedHttpRequest> {
        let raw_str = std::str::from_utf8(raw)
            .map_err(|_| GatewayError::Channel("invalid UTF-8 in HTTP request".to_string()))?;

        // Split headers from body at the blank line
        let (header_section, body) = match raw_str.find("\r\n\r\n") {
            Some(pos) => (&raw_str[..pos], raw_str[pos + 4..].to_string()),
            None => (raw_str, String::new()),
        };

        let mut lines = header_section.lines();

        // Parse request line: METHOD PATH HTTP/x.x
        let request_line = lines
            .next()
            .ok_or_else(|| GatewayError::Channel("empty HTTP request".to_string()))?;
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| GatewayError::Channel("missing HTTP method".to_string()))?
            .to_uppercase();
        let path = parts
            .next()
            .ok_or_else(|| GatewayError::Channel("missing HTTP path".to_string()))?
            .to_string();

        // Parse headers
        let mut headers = Vec::new();
        for line in lines {
            if let Some(colon_pos) = line.find(':') {
                let name = line[..colon_pos].trim().to_string();
                let value = line[colon_pos + 1..].trim().to_string();
                headers.push((name, value));
            }
        }

        Ok(ParsedHttpRequest {
            method,
            path,
            headers,
            body,
        })
    }

    /// Extract the `Content-Length` value from headers, defaulting to 0.
    fn content_length(headers: &[(String, String)]) -> usize {
        headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0)
    }

    fn reason_phrase(status: u16) -> &'static str {
        match status {
            200 => "OK",
            400 => "Bad Request",
            401 => "Unauthorized",
            404 => "Not Found",
            413 => "Payload Too Large",
            _ => "Internal Server Error",
        }
    }

    fn http_response(status: u16, body: &str) -> String {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            Self::reason_phrase(status),
            body.len(),
            body
        )
    }

    /// Generic response body by status; internal detail stays in the logs.
    fn generic_body(status: u16) -> String {
        let message = match status {
            400 => "bad request",
            401 => "unauthorized",
            404 => "not found",
            413 => "payload too large",
            _ => "internal error",
        };
        format!("{{\"error\":\"{}\"}}", message)
    }

    /// Handle a single TCP connection: read, parse, route, respond.
    async fn handle_connection(&self, mut stream: tokio::net::TcpStream) {
        // Read request data with size limits
        let mut buf = vec![0u8; MAX_HEADER_SIZE + MAX_BODY_SIZE];
        let mut total_read = 0usize;

        loop {
            if total_read >= buf.len() {
                let response = Self::http_response(413, &Self::generic_body(413));
                let _ = stream.write_all(response.as_bytes()).await;
                return;
            }

            match tokio::time::timeout(
                std::time::Duration::from_secs(READ_TIMEOUT_SECS),
                stream.read(&mut buf[total_read..]),
            )
            .await
            {
                Ok(Ok(0)) => break, // EOF
                Ok(Ok(n)) => {
                    total_read += n;
                    // Stop once headers plus the announced body have arrived.
                    let data = &buf[..total_read];
                    if let Some(header_end) = Self::find_header_end(data) {
                        if let Ok(req) = Self::parse_http_request(data) {
                            let expected = Self::content_length(&req.headers);
                            let body_received = total_read - header_end - 4;
                            if body_received >= expected {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }
                Ok(Err(e)) => {
                    debug!("webhook connection read error: {}", e);
                    return;
                }
                Err(_) => break, // Timeout — process what we have
            }
        }

        if total_read == 0 {
            return;
        }

        let request = match Self::parse_http_request(&buf[..total_read]) {
            Ok(req) => req,
            Err(e) => {
                debug!("webhook request parse failed: {}", e);
                let response = Self::http_response(400, &Self::generic_body(400));
                let _ = stream.write_all(response.as_bytes()).await;
                return;
            }
        };

        let outcome = self.route(&request).await;
        let response = Self::http_response(outcome.status, &outcome.body);
        let _ = stream.write_all(response.as_bytes()).await;
    }

    /// Routes one parsed request.
    async fn route(&self, request: &ParsedHttpRequest) -> RouteResponse {
        // Strip query string for path matching.
        let path = request.path.split('?').next().unwrap_or(&request.path);

        if path == "/health" && request.method == "GET" {
            return self.health();
        }

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["webhooks", platform, token] => self.dispatch(platform, token, request).await,
            _ => RouteResponse::new(404, Self::generic_body(404)),
        }
    }

    /// Implements the webhook algorithm: resolve, type-check, invoke, map.
    async fn dispatch(
        &self,
        platform: &str,
        token: &str,
        request: &ParsedHttpRequest,
    ) -> RouteResponse {
        // Unknown platform names resolve to nothing, same as unknown tokens.
        let Ok(platform) = Platform::from_str(platform) else {
            return RouteResponse::new(404, Self::generic_body(404));
        };
        let Some(registration) = self.registry.resolve(platform, token) else {
            return RouteResponse::new(404, Self::generic_body(404));
        };

        let provider = &registration.provider;
        if provider.connection_type() != ConnectionType::Webhook {
            debug!(platform = %platform, "webhook delivery for non-webhook provider");
            return RouteResponse::new(400, Self::generic_body(400));
        }
        if !provider.has_webhook_handler() {
            // Registered incorrectly — a server-side problem, not the caller's.
            warn!(platform = %platform, "webhook provider registered without a handler");
            return RouteResponse::new(500, Self::generic_body(500));
        }

        match provider
            .handle_inbound(request.body.as_bytes(), &request.headers)
            .await
        {
            Ok(ack) => RouteResponse::new(ack.http_status(), ack.body()),
            Err(e) => {
                let status = e.webhook_status();
                debug!(platform = %platform, status, "webhook handler error: {}", e);
                RouteResponse::new(status, Self::generic_body(status))
            }
        }
    }

    /// Informational health report.
    fn health(&self) -> RouteResponse {
        let providers: Vec<_> = self
            .registry
            .webhook_platforms()
            .into_iter()
            .map(|(platform, connection_ref)| {
                json!({
                    "platform": platform.as_str(),
                    "connection": connection_ref.to_string(),
                })
            })
            .collect();
        RouteResponse::new(
            200,
            json!({ "status": "ok", "webhook_providers": providers }).to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DedupCache, EventBus};
    use crate::credentials::{validator, CredentialValidator};
    use crate::connection::PlatformConnection;
    use crate::providers::{ProviderContext, ProviderSettings};
    use serde_json::Value;

    fn router_with_registry() -> (WebhookRouter, Arc<PlatformRegistry>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(PlatformRegistry::new(ProviderContext::new(
            Arc::clone(&bus),
            Arc::new(DedupCache::default()),
            ProviderSettings::default(),
        )));
        (WebhookRouter::new(Arc::clone(&registry)), registry, bus)
    }

    async fn register_telegram(registry: &PlatformRegistry) -> PlatformConnection {
        // No secret_token: these deliveries carry no secret header.
        let mut creds = validator(Platform::Telegram).example_credentials();
        creds.remove("secret_token");
        let conn = PlatformConnection::new("proj", Platform::Telegram, "tg", creds)
            .unwrap()
            .with_test_mode();
        registry.register(&conn).await.unwrap();
        conn
    }

    fn request(method: &str, path: &str, body: &str) -> ParsedHttpRequest {
        ParsedHttpRequest {
            method: method.to_string(),
            path: path.to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: body.to_string(),
        }
    }

    fn telegram_update_body() -> String {
        json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "from": { "id": 7, "is_bot": false },
                "chat": { "id": 253191879i64 },
                "text": "ping",
            }
        })
        .to_string()
    }

    #[test]
    fn test_parse_http_request() {
        let raw = b"POST /webhooks/telegram/tok HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}";
        let req = WebhookRouter::parse_http_request(raw).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/webhooks/telegram/tok");
        assert_eq!(req.body, "{}");
        assert_eq!(WebhookRouter::content_length(&req.headers), 2);
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(
            WebhookRouter::find_header_end(b"GET / HTTP/1.1\r\n\r\nbody"),
            Some(14)
        );
        assert_eq!(WebhookRouter::find_header_end(b"partial"), None);
    }

    #[tokio::test]
    async fn test_unknown_pair_is_404_and_publishes_nothing() {
        let (router, _registry, bus) = router_with_registry();
        let mut rx = bus.subscribe();

        let resp = router
            .route(&request(
                "POST",
                "/webhooks/telegram/no-such-token",
                &telegram_update_body(),
            ))
            .await;
        assert_eq!(resp.status, 404);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_platform_is_404() {
        let (router, _registry, _bus) = router_with_registry();
        let resp = router
            .route(&request("POST", "/webhooks/matrix/some-token", "{}"))
            .await;
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn test_delivery_reaches_bus() {
        let (router, registry, bus) = router_with_registry();
        let conn = register_telegram(&registry).await;
        let mut rx = bus.subscribe();

        let path = format!(
            "/webhooks/telegram/{}",
            conn.webhook_token.as_ref().unwrap()
        );
        let resp = router
            .route(&request("POST", &path, &telegram_update_body()))
            .await;
        assert_eq!(resp.status, 200);

        let env = rx.recv().await.unwrap();
        assert_eq!(env.chat_id, "253191879");
        assert_eq!(env.connection_ref, conn.connection_ref());
    }

    #[tokio::test]
    async fn test_any_method_is_routed() {
        let (router, registry, _bus) = router_with_registry();
        let conn = register_telegram(&registry).await;

        let path = format!(
            "/webhooks/telegram/{}",
            conn.webhook_token.as_ref().unwrap()
        );
        // A GET with a valid update body still reaches the handler.
        let resp = router
            .route(&request("GET", &path, &telegram_update_body()))
            .await;
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_400_generic_body() {
        let (router, registry, _bus) = router_with_registry();
        let conn = register_telegram(&registry).await;

        let path = format!(
            "/webhooks/telegram/{}",
            conn.webhook_token.as_ref().unwrap()
        );
        let resp = router.route(&request("POST", &path, "not json")).await;
        assert_eq!(resp.status, 400);
        // Generic body only — no parser detail leaks.
        assert_eq!(resp.body, "{\"error\":\"bad request\"}");
    }

    #[tokio::test]
    async fn test_health_lists_webhook_providers() {
        let (router, registry, _bus) = router_with_registry();
        register_telegram(&registry).await;

        let resp = router.route(&request("GET", "/health", "")).await;
        assert_eq!(resp.status, 200);
        let parsed: Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["webhook_providers"].as_array().unwrap().len(), 1);
        assert_eq!(parsed["webhook_providers"][0]["platform"], "telegram");
    }

    #[tokio::test]
    async fn test_unrelated_path_is_404() {
        let (router, _registry, _bus) = router_with_registry();
        assert_eq!(router.route(&request("GET", "/", "")).await.status, 404);
        assert_eq!(
            router
                .route(&request("POST", "/webhooks/telegram", ""))
                .await
                .status,
            404
        );
    }

    #[tokio::test]
    async fn test_serve_and_stop() {
        let (router, registry, bus) = router_with_registry();
        let conn = register_telegram(&registry).await;
        let mut rx = bus.subscribe();

        let handle = router.serve("127.0.0.1", 0).await.unwrap();
        let url = format!(
            "http://{}/webhooks/telegram/{}",
            handle.addr(),
            conn.webhook_token.as_ref().unwrap()
        );

        let client = reqwest::Client::new();
        let resp = client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(telegram_update_body())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(rx.recv().await.unwrap().text, "ping");

        handle.stop().await;
    }
}
