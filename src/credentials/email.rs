//! Email (SMTP) credential validation.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{CredentialValidator, ValidationReport};
use crate::connection::Platform;

/// Light address shape check; full RFC validation is the SMTP server's job.
static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

const REQUIRED: &[&str] = &[
    "smtp_host",
    "smtp_port",
    "smtp_username",
    "smtp_password",
    "from_address",
];
const OPTIONAL: &[&str] = &["smtp_secure", "reply_to"];

pub struct EmailCredentialValidator;

impl CredentialValidator for EmailCredentialValidator {
    fn platform(&self) -> Platform {
        Platform::Email
    }

    fn validate(&self, credentials: &HashMap<String, String>) -> ValidationReport {
        let mut report = ValidationReport::new();
        if !report.require_all(credentials, REQUIRED) {
            return report;
        }

        let port = match credentials["smtp_port"].trim().parse::<u32>() {
            Ok(p) if (1..=65_535).contains(&p) => Some(p),
            Ok(_) | Err(_) => {
                report.error("smtp_port must be an integer between 1 and 65535");
                None
            }
        };

        if !ADDRESS_RE.is_match(credentials["from_address"].trim()) {
            report.error("from_address is not a plausible email address");
        }
        if let Some(reply_to) = credentials.get("reply_to") {
            if !ADDRESS_RE.is_match(reply_to.trim()) {
                report.error("reply_to is not a plausible email address");
            }
        }

        let secure = match credentials.get("smtp_secure").map(|s| s.trim()) {
            None => None,
            Some("true") => Some(true),
            Some("false") => Some(false),
            Some(_) => {
                report.error("smtp_secure must be 'true' or 'false'");
                None
            }
        };

        // Implicit-TLS vs STARTTLS mismatches on the well-known ports are a
        // top support issue; flag them without failing validation.
        if let (Some(port), Some(secure)) = (port, secure) {
            if port == 465 && !secure {
                report.warn("port 465 normally uses implicit TLS; smtp_secure=false looks wrong");
            }
            if port == 587 && secure {
                report.warn("port 587 normally uses STARTTLS; smtp_secure=true looks wrong");
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
            ("smtp_host".to_string(), "smtp.example.com".to_string()),
            ("smtp_port".to_string(), "587".to_string()),
            ("smtp_username".to_string(), "mailer@example.com".to_string()),
            (
                "smtp_password".to_string(),
                "app-password-4821".to_string(),
            ),
            (
                "from_address".to_string(),
                "noreply@example.com".to_string(),
            ),
            ("smtp_secure".to_string(), "false".to_string()),
        ])
    }
}
