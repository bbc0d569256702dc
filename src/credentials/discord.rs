//! Discord credential validation.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{CredentialValidator, ValidationReport};
use crate::connection::Platform;

/// Discord snowflake ids: 17-19 decimal digits.
static SNOWFLAKE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{17,19}$").unwrap());

/// Bot tokens are three dot-separated base64url segments.
static TOKEN_SHAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+$").unwrap());

const REQUIRED: &[&str] = &["bot_token"];
const OPTIONAL: &[&str] = &["application_id", "guild_id"];

pub struct DiscordCredentialValidator;

impl CredentialValidator for DiscordCredentialValidator {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    fn validate(&self, credentials: &HashMap<String, String>) -> ValidationReport {
        let mut report = ValidationReport::new();
        if !report.require_all(credentials, REQUIRED) {
            return report;
        }

        let token = credentials["bot_token"].trim();
        if token.len() < 50 {
            report.warn("bot_token is unusually short; it may be a test token");
        } else if !TOKEN_SHAPE_RE.is_match(token) {
            report.warn("bot_token does not look like a Discord bot token (expected three dot-separated segments)");
        }

        for field in ["application_id", "guild_id"] {
            if let Some(value) = credentials.get(field) {
                if !SNOWFLAKE_RE.is_match(value.trim()) {
                    report.error(format!(
                        "field '{}' must be a Discord snowflake (17-19 digits)",
                        field
                    ));
                }
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
                "MTA1MjgxNTQ2NTUyNjQ2NDU1Mg.G4vQxK.pXm9cQvTqWuE3hYbN8dZrJfA2sLgOiCk1nRt5w".to_string(),
            ),
            ("application_id".to_string(), "1052815465526464552".to_string()),
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
        DiscordCredentialValidator.validate(&creds)
    }

    #[test]
    fn test_missing_token_is_error() {
        let report = validate(&[]);
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("bot_token"));
    }

    #[test]
    fn test_short_token_warns_but_validates() {
        let report = validate(&[("bot_token", "abc.def.ghi")]);
        assert!(report.is_valid());
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn test_bad_snowflake_is_error() {
        let report = validate(&[
            ("bot_token", "abc.def.ghi"),
            ("application_id", "12345"),
        ]);
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("snowflake"));
    }

    #[test]
    fn test_valid_snowflake_lengths() {
        for id in ["12345678901234567", "123456789012345678", "1234567890123456789"] {
            let report = validate(&[("bot_token", "abc.def.ghi"), ("guild_id", id)]);
            assert!(report.is_valid(), "snowflake {} rejected", id);
        }
    }

    #[test]
    fn test_twenty_digit_snowflake_rejected() {
        let report = validate(&[
            ("bot_token", "abc.def.ghi"),
            ("guild_id", "12345678901234567890"),
        ]);
        assert!(!report.is_valid());
    }
}
