//! Telegram credential validation.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{CredentialValidator, ValidationReport};
use crate::connection::Platform;

/// Bot API tokens: numeric bot id, a colon, then a 30+ char secret.
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+:[A-Za-z0-9_-]{30,}$").unwrap());

/// Webhook secret tokens per the Bot API: 1-256 chars of `[A-Za-z0-9_-]`.
static SECRET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,256}$").unwrap());

const REQUIRED: &[&str] = &["bot_token"];
const OPTIONAL: &[&str] = &["secret_token"];

pub struct TelegramCredentialValidator;

impl CredentialValidator for TelegramCredentialValidator {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    fn validate(&self, credentials: &HashMap<String, String>) -> ValidationReport {
        let mut report = ValidationReport::new();
        if !report.require_all(credentials, REQUIRED) {
            return report;
        }

        let token = credentials["bot_token"].trim();
        if !TOKEN_RE.is_match(token) {
            report.error(
                "bot_token must look like '<bot_id>:<secret>' with a 30+ character secret",
            );
        } else if token.starts_with("110201543:") || token.to_ascii_uppercase().contains("TEST") {
            report.warn("bot_token looks like a test token");
        }

        if let Some(secret) = credentials.get("secret_token") {
            if !SECRET_RE.is_match(secret.trim()) {
                report.error("secret_token must be 1-256 characters of letters, digits, '_' or '-'");
            }
        }

        report
    }

    fn required_fields(&self) -> &'static [&'static str] {
        REQUIRED
    }

    fn optional_fields(&self) -> &'static [&'static str] {
        OPTIONAL
    }

    fn example_credentials(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                "bot_token".to_string(),
                "7213941876:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw".to_string(),
            ),
            ("secret_token".to_string(), "w3bh00k-s3cr3t".to_string()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(pairs: &[(&str, &str)]) -> ValidationReport {
        let creds = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TelegramCredentialValidator.validate(&creds)
    }

    #[test]
    fn test_missing_token_is_error() {
        assert!(!validate(&[]).is_valid());
    }

    #[test]
    fn test_malformed_token_is_error() {
        for bad in ["plainstring", "123:short", ":AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw"] {
            let report = validate(&[("bot_token", bad)]);
            assert!(!report.is_valid(), "token {:?} accepted", bad);
        }
    }

    #[test]
    fn test_wellformed_token_validates() {
        let report = validate(&[("bot_token", "7213941876:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw")]);
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_test_looking_token_warns() {
        let report = validate(&[("bot_token", "110201543:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw")]);
        assert!(report.is_valid());
        assert!(report.warnings[0].contains("test token"));
    }

    #[test]
    fn test_bad_secret_token_is_error() {
        let report = validate(&[
            ("bot_token", "7213941876:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw"),
            ("secret_token", "has spaces!"),
        ]);
        assert!(!report.is_valid());
    }
}
