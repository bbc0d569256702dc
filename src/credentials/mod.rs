//! Credential validation for platform connections.
//!
//! Each platform has a pure validator: structural checks (required
//! presence, types) plus semantic checks (format patterns). Validation
//! never calls the remote platform — that happens only at provider
//! activation. Warnings never invalidate a credential set; only errors do.
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use omnigate::credentials::{validate_credentials, validation_schema};
//!
//! let mut creds = HashMap::new();
//! creds.insert("bot_token".to_string(), "not-a-telegram-token".to_string());
//!
//! let report = validate_credentials("telegram", &creds).unwrap();
//! assert!(!report.is_valid());
//!
//! let schema = validation_schema("telegram").unwrap();
//! assert!(schema.required.contains(&"bot_token"));
//! ```

mod discord;
mod email;
mod telegram;
mod whatsapp;

pub use discord::DiscordCredentialValidator;
pub use email::EmailCredentialValidator;
pub use telegram::TelegramCredentialValidator;
pub use whatsapp::WhatsAppCredentialValidator;

use std::collections::HashMap;
use std::str::FromStr;

use crate::connection::Platform;
use crate::error::Result;

/// Outcome of validating one credential set.
///
/// A set with zero errors is valid regardless of warning count.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Problems that invalidate the credentials.
    pub errors: Vec<String>,
    /// Advisory findings; never invalidate.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` iff no errors were recorded.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Records an error for each required field missing or empty, returning
    /// `true` when all are present.
    pub fn require_all(
        &mut self,
        credentials: &HashMap<String, String>,
        fields: &[&'static str],
    ) -> bool {
        let mut ok = true;
        for field in fields {
            match credentials.get(*field) {
                Some(v) if !v.trim().is_empty() => {}
                Some(_) => {
                    self.error(format!("field '{}' must not be empty", field));
                    ok = false;
                }
                None => {
                    self.error(format!("missing required field '{}'", field));
                    ok = false;
                }
            }
        }
        ok
    }
}

/// Schema surface for documentation/CLI generation.
#[derive(Debug, Clone)]
pub struct CredentialSchema {
    pub required: Vec<&'static str>,
    pub optional: Vec<&'static str>,
    pub example: HashMap<String, String>,
}

/// The contract every per-platform validator satisfies.
pub trait CredentialValidator: Send + Sync {
    /// The platform this validator covers.
    fn platform(&self) -> Platform;

    /// Pure structural + semantic validation. Never touches the network.
    fn validate(&self, credentials: &HashMap<String, String>) -> ValidationReport;

    /// Fields that must be present for the credentials to validate.
    fn required_fields(&self) -> &'static [&'static str];

    /// Recognized optional fields.
    fn optional_fields(&self) -> &'static [&'static str];

    /// A credential set that passes `validate` with zero errors.
    fn example_credentials(&self) -> HashMap<String, String>;
}

static DISCORD: DiscordCredentialValidator = DiscordCredentialValidator;
static TELEGRAM: TelegramCredentialValidator = TelegramCredentialValidator;
static WHATSAPP: WhatsAppCredentialValidator = WhatsAppCredentialValidator;
static EMAIL: EmailCredentialValidator = EmailCredentialValidator;

/// Resolves the validator for a platform identifier, case-insensitively.
///
/// # Errors
///
/// Fails with [`crate::error::GatewayError::UnsupportedPlatform`] when no
/// validator is registered for the name — a configuration/programmer
/// error, surfaced distinctly from user-input validation failures.
pub fn validator_for(platform: &str) -> Result<&'static dyn CredentialValidator> {
    Ok(validator(Platform::from_str(platform)?))
}

/// Resolves the validator for an already-parsed platform.
pub fn validator(platform: Platform) -> &'static dyn CredentialValidator {
    match platform {
        Platform::Discord => &DISCORD,
        Platform::Telegram => &TELEGRAM,
        Platform::WhatsAppEvo => &WHATSAPP,
        Platform::Email => &EMAIL,
    }
}

/// Validates a credential set against the named platform's rules.
pub fn validate_credentials(
    platform: &str,
    credentials: &HashMap<String, String>,
) -> Result<ValidationReport> {
    Ok(validator_for(platform)?.validate(credentials))
}

/// Returns `{required, optional, example}` for the named platform.
pub fn validation_schema(platform: &str) -> Result<CredentialSchema> {
    let v = validator_for(platform)?;
    Ok(CredentialSchema {
        required: v.required_fields().to_vec(),
        optional: v.optional_fields().to_vec(),
        example: v.example_credentials(),
    })
}
