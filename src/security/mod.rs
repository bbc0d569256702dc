//! Security helpers shared across the gateway core.

mod ssrf;

pub use ssrf::is_public_http_url;
