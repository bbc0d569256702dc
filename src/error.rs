//! Error types for omnigate
//!
//! This module defines all error types used throughout the gateway core.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.

use std::fmt;
use thiserror::Error;

// ============================================================================
// Delivery Error Classification
// ============================================================================

/// Structured classification of a failed platform delivery.
///
/// Provides fine-grained categorization of remote platform API failures,
/// enabling the dispatch queue to make retry decisions without string
/// matching. Adapters never retry internally; they surface one of these and
/// let the queue decide.
#[derive(Debug)]
pub enum DeliveryError {
    /// The remote platform rejected the credentials or signature. Not retryable.
    Auth(String),
    /// The remote platform is rate limiting us. Retryable with backoff.
    RateLimited(String),
    /// Transient remote failure (5xx, connect error, timeout). Retryable.
    Transient(String),
    /// Non-retryable remote failure (e.g. permanently invalid target).
    Permanent(String),
    /// The platform does not support the requested operation. Not retryable.
    Unsupported(String),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            DeliveryError::RateLimited(msg) => write!(f, "Rate limit error: {}", msg),
            DeliveryError::Transient(msg) => write!(f, "Transient error: {}", msg),
            DeliveryError::Permanent(msg) => write!(f, "Permanent error: {}", msg),
            DeliveryError::Unsupported(msg) => write!(f, "Unsupported operation: {}", msg),
        }
    }
}

impl DeliveryError {
    /// Returns `true` if the dispatch queue should retry the task.
    ///
    /// Retryable errors: RateLimited, Transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::RateLimited(_) | DeliveryError::Transient(_)
        )
    }

    /// Returns the HTTP status code associated with this error, if applicable.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DeliveryError::Auth(_) => Some(401),
            DeliveryError::RateLimited(_) => Some(429),
            DeliveryError::Transient(_) => Some(503),
            DeliveryError::Permanent(_) => None,
            DeliveryError::Unsupported(_) => Some(400),
        }
    }

    /// Classify a remote HTTP status into a delivery error.
    ///
    /// 401/403 map to `Auth`, 429 to `RateLimited`, 5xx to `Transient`,
    /// everything else client-side to `Permanent`.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => DeliveryError::Auth(body),
            429 => DeliveryError::RateLimited(body),
            s if s >= 500 => DeliveryError::Transient(body),
            _ => DeliveryError::Permanent(body),
        }
    }
}

impl From<DeliveryError> for GatewayError {
    fn from(err: DeliveryError) -> Self {
        GatewayError::Delivery(err)
    }
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Bad credentials or user input — user-fixable, 400-class.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown platform/connection/message — 404-class.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Authentication or signature verification failure — 401-class.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// No validator/adapter is registered for the named platform.
    ///
    /// This is a configuration/programmer error, not a user input error,
    /// and is surfaced distinctly from `Validation`.
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// The platform categorically lacks the requested capability.
    #[error("Platform '{platform}' does not support {operation}")]
    UnsupportedOperation {
        platform: String,
        operation: &'static str,
    },

    /// A failed delivery attempt against a remote platform API.
    #[error("Delivery error: {0}")]
    Delivery(DeliveryError),

    /// Provider activation rejected by the remote platform or malformed state.
    #[error("Activation error: {0}")]
    Activation(String),

    /// Channel/transport errors (connection failures, routing issues, etc.)
    #[error("Channel error: {0}")]
    Channel(String),

    /// Event bus channel closed unexpectedly.
    #[error("Bus error: channel closed")]
    BusClosed,

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl GatewayError {
    /// HTTP status the webhook router maps this error to.
    ///
    /// Anything not explicitly 404/401/400-class is reported as 500 with a
    /// generic body so internal detail never leaks to the remote platform.
    pub fn webhook_status(&self) -> u16 {
        match self {
            GatewayError::NotFound(_) => 404,
            GatewayError::Unauthorized(_) => 401,
            GatewayError::Validation(_) => 400,
            GatewayError::UnsupportedOperation { .. } => 400,
            _ => 500,
        }
    }
}

/// A specialized `Result` type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
