//! SSRF guard for caller-supplied URLs.
//!
//! Embed URLs (images, thumbnails, author icons, footer icons) are supplied
//! by API callers and forwarded to remote platforms. Every URL field is
//! re-checked here immediately before use, independent of any validation at
//! authoring time, so a stale or substituted URL never slips through.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use reqwest::Url;

/// Returns `true` if the URL is an http/https URL whose host is not a
/// private, loopback or otherwise local address.
///
/// This is a structural check on the URL itself — the gateway never fetches
/// embed URLs (the remote platform does), so no DNS resolution is performed.
///
/// # Example
///
/// ```
/// use omnigate::security::is_public_http_url;
///
/// assert!(is_public_http_url("https://cdn.example.com/a.png"));
/// assert!(!is_public_http_url("http://127.0.0.1:9090/admin"));
/// assert!(!is_public_http_url("file:///etc/passwd"));
/// ```
pub fn is_public_http_url(raw: &str) -> bool {
    let url = match Url::parse(raw) {
        Ok(u) => u,
        Err(_) => return false,
    };

    if url.scheme() != "http" && url.scheme() != "https" {
        return false;
    }

    !is_blocked_host(&url)
}

fn is_blocked_host(url: &Url) -> bool {
    let Some(host_str) = url.host_str() else {
        return true;
    };

    let host = host_str.to_ascii_lowercase();
    if host == "localhost" || host.ends_with(".local") {
        return true;
    }

    // Try parsing as IP directly first, then try stripping IPv6 brackets.
    // `Url::host_str()` returns IPv6 addresses with surrounding brackets
    // (e.g. "[::1]"), which `IpAddr::parse` does not accept.
    let ip_str = host
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(&host);
    if let Ok(ip) = ip_str.parse::<IpAddr>() {
        return is_private_or_local_ip(ip);
    }

    false
}

fn is_private_or_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => is_private_or_local_ipv4(addr),
        IpAddr::V6(addr) => is_private_or_local_ipv6(addr),
    }
}

fn is_private_or_local_ipv4(addr: Ipv4Addr) -> bool {
    addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_broadcast()
        || addr.is_documentation()
        || addr.is_unspecified()
        || addr.octets()[0] == 0
}

fn is_private_or_local_ipv6(addr: Ipv6Addr) -> bool {
    let first = addr.segments()[0];

    addr.is_loopback()
        || addr.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
        || (first & 0xff00) == 0xff00
}
