//! WhatsApp (Evolution API) credential validation.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;

use super::{CredentialValidator, ValidationReport};
use crate::connection::Platform;

/// Evolution instance names: `[A-Za-z0-9_-]+`, at most 50 chars.
static INSTANCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,50}$").unwrap());

const REQUIRED: &[&str] = &["server_url", "api_key", "instance_name"];
const OPTIONAL: &[&str] = &[];

pub struct WhatsAppCredentialValidator;

impl CredentialValidator for WhatsAppCredentialValidator {
    fn platform(&self) -> Platform {
        Platform::WhatsAppEvo
    }

    fn validate(&self, credentials: &HashMap<String, String>) -> ValidationReport {
        let mut report = ValidationReport::new();
        if !report.require_all(credentials, REQUIRED) {
            return report;
        }

        let server_url = credentials["server_url"].trim();
        match Url::parse(server_url) {
            Ok(url) if url.scheme() == "https" => {}
            Ok(url) if url.scheme() == "http" => {
                report.warn("server_url is plain http; the API key travels unencrypted");
            }
            Ok(_) => report.error("server_url must use http or https"),
            Err(_) => report.error("server_url is not a valid URL"),
        }

        let instance = credentials["instance_name"].trim();
        if !INSTANCE_RE.is_match(instance) {
            report.error(
                "instance_name must be at most 50 characters of letters, digits, '_' or '-'",
            );
        }

        if credentials["api_key"].trim().len() < 16 {
            report.warn("api_key is unusually short; it may be a test key");
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
                "server_url".to_string(),
                "https://evolution.example.com".to_string(),
            ),
            (
                "api_key".to_string(),
                "B6D9F2E1A4C87035D1E9B2F4A6C80317".to_string(),
            ),
            ("instance_name".to_string(), "support-line".to_string()),
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
        WhatsAppCredentialValidator.validate(&creds)
    }

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            ("server_url", "https://evolution.example.com"),
            ("api_key", "B6D9F2E1A4C87035D1E9B2F4A6C80317"),
            ("instance_name", "support-line"),
        ]
    }

    #[test]
    fn test_complete_credentials_validate() {
        let report = validate(&base());
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_missing_fields_each_reported() {
        let report = validate(&[]);
        assert_eq!(report.errors.len(), 3);
    }

    #[test]
    fn test_http_url_warns_but_validates() {
        let mut creds = base();
        creds[0] = ("server_url", "http://evolution.example.com");
        let report = validate(&creds);
        assert!(report.is_valid());
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn test_invalid_url_is_error() {
        let mut creds = base();
        creds[0] = ("server_url", "evolution.example.com");
        assert!(!validate(&creds).is_valid());
    }

    #[test]
    fn test_non_http_scheme_is_error() {
        let mut creds = base();
        creds[0] = ("server_url", "ftp://evolution.example.com");
        assert!(!validate(&creds).is_valid());
    }

    #[test]
    fn test_instance_name_pattern() {
        let mut creds = base();
        creds[2] = ("instance_name", "has space");
        assert!(!validate(&creds).is_valid());

        creds[2] = ("instance_name", "ok_name-42");
        assert!(validate(&creds).is_valid());
    }

    #[test]
    fn test_instance_name_length_cap() {
        let long = "a".repeat(51);
        let mut creds = base();
        creds[2] = ("instance_name", &long);
        let report = {
            let m: HashMap<String, String> = creds
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            WhatsAppCredentialValidator.validate(&m)
        };
        assert!(!report.is_valid());
    }

    #[test]
    fn test_short_api_key_warns() {
        let mut creds = base();
        creds[1] = ("api_key", "shortkey");
        let report = validate(&creds);
        assert!(report.is_valid());
        assert!(report.warnings[0].contains("api_key"));
    }
}
