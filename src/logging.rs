//! Logging and tracing configuration
//!
//! JSON output in production, human-readable output in development.
//! Also home to the masking helpers every component uses before a phone
//! number, card number or gateway payload reaches a log line or the ledger.

use regex::Regex;
use std::env;
use std::sync::LazyLock;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Detect environment from `ENVIRONMENT` (or `ENV`)
    pub fn from_env() -> Self {
        Self::parse(
            &env::var("ENVIRONMENT")
                .or_else(|_| env::var("ENV"))
                .unwrap_or_else(|_| "development".to_string()),
        )
    }

    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "staging" | "stage" => Self::Staging,
            _ => Self::Development,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    pub fn default_log_level(&self) -> Level {
        match self {
            Self::Development => Level::DEBUG,
            Self::Staging | Self::Production => Level::INFO,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Initialize the global tracing subscriber.
///
/// # Environment Variables
/// - `ENVIRONMENT` or `ENV`: "production", "staging" or "development"
/// - `RUST_LOG`: overrides the default filter
/// - `LOG_FORMAT`: force "json" or "pretty"
pub fn init_tracing() {
    let environment = Environment::from_env();

    let use_json = env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or_else(|_| environment.is_production());

    let default_directives = format!(
        "{}={},tower_http=debug,axum=info,sqlx=warn,hyper=warn,reqwest=warn",
        env!("CARGO_CRATE_NAME"),
        environment.default_log_level()
    );
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    if use_json {
        let json_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_level(true)
            .with_file(false)
            .with_line_number(false)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).init();
    } else {
        let pretty_layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(pretty_layer).init();
    }

    tracing::info!(
        environment = environment.as_str(),
        format = if use_json { "json" } else { "pretty" },
        "Tracing initialized"
    );
}

/// Keep the country code and the last three digits of a phone number.
///
/// ```
/// use payorch::logging::mask_phone_number;
/// assert_eq!(mask_phone_number("254708374149"), "254******149");
/// ```
pub fn mask_phone_number(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 7 {
        return "****".to_string();
    }
    let head: String = digits[..3].iter().collect();
    let tail: String = digits[digits.len() - 3..].iter().collect();
    format!("{}{}{}", head, "*".repeat(digits.len() - 6), tail)
}

/// Only the last four digits of a card number survive.
pub fn mask_card_number(number: &str) -> String {
    let digits: Vec<char> = number.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 4 {
        return "****".to_string();
    }
    let last4: String = digits[digits.len() - 4..].iter().collect();
    format!("****{}", last4)
}

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "Password",
    "secret",
    "client_secret",
    "signing_secret",
    "consumer_secret",
    "pass_key",
    "token",
    "access_token",
    "api_key",
    "authorization",
    "card_number",
    "cardNumber",
    "number",
    "cvv",
    "pin",
];

static SENSITIVE_PATTERNS: LazyLock<Vec<(Regex, String)>> = LazyLock::new(|| {
    SENSITIVE_KEYS
        .iter()
        .filter_map(|key| {
            let re = Regex::new(&format!(r#""{}"\s*:\s*("[^"]*"|\d+)"#, regex::escape(key))).ok()?;
            Some((re, format!(r#""{}": "[REDACTED]""#, key)))
        })
        .collect()
});

/// Redact the values of sensitive keys in JSON text.
pub fn redact_sensitive_data(text: &str) -> String {
    let mut result = text.to_string();
    for (re, replacement) in SENSITIVE_PATTERNS.iter() {
        result = re.replace_all(&result, replacement.as_str()).into_owned();
    }
    result
}

/// Redact a JSON value, returning the original value if redaction breaks it.
pub fn redact_json(value: &serde_json::Value) -> serde_json::Value {
    serde_json::from_str(&redact_sensitive_data(&value.to_string())).unwrap_or_else(|_| value.clone())
}

/// Log a payment lifecycle event with a consistent `event_type`.
///
/// ```no_run
/// use payorch::log_payment;
/// log_payment!(
///     event = "initiated",
///     transaction_id = "2b7f...",
///     method = "push_payment",
/// );
/// ```
#[macro_export]
macro_rules! log_payment {
    ($($key:tt = $value:expr),* $(,)?) => {
        tracing::info!(
            event_type = "payment",
            $($key = tracing::field::display(&$value)),*
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_environment_parsing() {
        assert_eq!(Environment::parse("production"), Environment::Production);
        assert_eq!(Environment::parse("PROD"), Environment::Production);
        assert_eq!(Environment::parse("stage"), Environment::Staging);
        assert_eq!(Environment::parse("anything"), Environment::Development);
        assert!(Environment::Production.is_production());
    }

    #[test]
    fn test_default_log_levels() {
        assert_eq!(Environment::Development.default_log_level(), Level::DEBUG);
        assert_eq!(Environment::Production.default_log_level(), Level::INFO);
        assert_eq!(Environment::Staging.default_log_level(), Level::INFO);
    }

    #[test]
    fn test_mask_phone_number() {
        assert_eq!(mask_phone_number("254708374149"), "254******149");
        assert_eq!(mask_phone_number("+254 708 374 149"), "254******149");
        assert_eq!(mask_phone_number("123"), "****");
    }

    #[test]
    fn test_mask_card_number() {
        assert_eq!(mask_card_number("4111 1111 1111 1111"), "****1111");
        assert_eq!(mask_card_number("12"), "****");
    }

    #[test]
    fn test_redact_sensitive_data() {
        let data = r#"{"Password": "MTc0Mzc5YmZi", "Amount": "500", "cvv":"123"}"#;
        let redacted = redact_sensitive_data(data);
        assert!(!redacted.contains("MTc0Mzc5YmZi"));
        assert!(!redacted.contains("123"));
        assert!(redacted.contains(r#""Amount": "500""#));
    }

    #[test]
    fn test_redact_json_keeps_structure() {
        let value = json!({"card": {"number": "4111111111111111", "cvv": "123"}, "status": "succeeded"});
        let redacted = redact_json(&value);
        assert_eq!(redacted["card"]["number"], "[REDACTED]");
        assert_eq!(redacted["card"]["cvv"], "[REDACTED]");
        assert_eq!(redacted["status"], "succeeded");
    }
}
