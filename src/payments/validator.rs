//! Payment request validation
//!
//! Turns the loosely structured request body of `processPayment` into a typed,
//! normalized [`PaymentRequest`], or a list of field-level errors. Validation
//! never touches the network.

use crate::clock::Clock;
use crate::payments::types::{MethodDetails, PaymentMethod, PaymentRequest};
use bigdecimal::{BigDecimal, Zero};
use chrono::Datelike;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

/// Country calling code prepended to local subscriber numbers
pub const COUNTRY_CODE: &str = "254";

/// `07XXXXXXXX`, `01XXXXXXXX`, `7XXXXXXXX`, `2547XXXXXXXX`, `+2547XXXXXXXX`
static LOCAL_MOBILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^(?:\+?{}|0)?([17]\d{{8}})$", COUNTRY_CODE))
        .expect("mobile number pattern is valid")
});

static CURRENCY_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{3}$").expect("currency pattern is valid"));

/// Furthest expiry year accepted, counted from the current year
const MAX_CARD_VALIDITY_YEARS: i64 = 20;

/// Longest account reference the push gateway accepts
const MAX_ACCOUNT_REFERENCE_LEN: usize = 12;

/// A single rejected field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidField {
    pub field: String,
    pub message: String,
}

impl InvalidField {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} invalid field(s): {}", .0.len(), summarize(.0))]
pub struct ValidationErrors(pub Vec<InvalidField>);

fn summarize(fields: &[InvalidField]) -> String {
    fields
        .iter()
        .map(|f| format!("{} ({})", f.field, f.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Normalize a local mobile number to `<country-code><subscriber>`.
///
/// Spaces, dashes and parentheses are ignored. Returns `None` when the input
/// is not a local mobile number in any accepted form.
pub fn normalize_phone_number(raw: &str) -> Option<String> {
    let compact: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();
    LOCAL_MOBILE
        .captures(&compact)
        .and_then(|caps| caps.get(1))
        .map(|subscriber| format!("{}{}", COUNTRY_CODE, subscriber.as_str()))
}

pub struct PaymentRequestValidator {
    clock: Arc<dyn Clock>,
}

impl PaymentRequestValidator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Validate and normalize `data` for `method`.
    pub fn validate(&self, method: PaymentMethod, data: &Value) -> Result<PaymentRequest, ValidationErrors> {
        let mut errors = Vec::new();

        if !data.is_object() {
            return Err(ValidationErrors(vec![InvalidField::new(
                "body",
                "request body must be a JSON object",
            )]));
        }

        let amount = parse_amount(data.get("amount"), &mut errors);
        let currency = parse_currency(method, data.get("currency"), &mut errors);
        let customer_reference = required_str(data, "customer_reference", &mut errors);

        let details = match method {
            PaymentMethod::PushPayment => {
                self.push_payment_details(
                    data,
                    amount.as_ref(),
                    customer_reference.as_deref(),
                    &mut errors,
                )
            }
            PaymentMethod::RedirectCapture => redirect_capture_details(data, &mut errors),
            PaymentMethod::Card => self.card_details(data, &mut errors),
        };

        match (amount, currency, customer_reference, details) {
            (Some(amount), Some(currency), Some(customer_reference), Some(details))
                if errors.is_empty() =>
            {
                Ok(PaymentRequest {
                    amount,
                    currency,
                    customer_reference,
                    details,
                })
            }
            _ => Err(ValidationErrors(errors)),
        }
    }

    fn push_payment_details(
        &self,
        data: &Value,
        amount: Option<&BigDecimal>,
        customer_reference: Option<&str>,
        errors: &mut Vec<InvalidField>,
    ) -> Option<MethodDetails> {
        // The push gateway only moves whole currency units
        if amount.is_some_and(|a| !a.is_integer()) {
            errors.push(InvalidField::new("amount", "must be a whole number"));
        }

        let raw_phone = required_str(data, "phone_number", errors)?;
        let Some(phone_number) = normalize_phone_number(&raw_phone) else {
            errors.push(InvalidField::new(
                "phone_number",
                "must be a valid local mobile number",
            ));
            return None;
        };

        let account_reference: String = optional_str(data, "account_reference")
            .or_else(|| customer_reference.map(str::to_string))
            .unwrap_or_default()
            .chars()
            .take(MAX_ACCOUNT_REFERENCE_LEN)
            .collect();
        let description =
            optional_str(data, "description").unwrap_or_else(|| "Payment".to_string());

        Some(MethodDetails::PushPayment {
            phone_number,
            account_reference,
            description,
        })
    }

    fn card_details(&self, data: &Value, errors: &mut Vec<InvalidField>) -> Option<MethodDetails> {
        let today = self.clock.now().date_naive();
        let before = errors.len();

        let card_number = required_str(data, "card_number", errors).and_then(|raw| {
            let digits: String = raw.chars().filter(|c| !matches!(c, ' ' | '-')).collect();
            if (13..=19).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()) {
                Some(digits)
            } else {
                errors.push(InvalidField::new("card_number", "must be 13 to 19 digits"));
                None
            }
        });

        let expiry_month = required_int(data, "expiry_month", errors).and_then(|month| {
            if (1..=12).contains(&month) {
                Some(month as u32)
            } else {
                errors.push(InvalidField::new("expiry_month", "must be between 1 and 12"));
                None
            }
        });

        let expiry_year = required_int(data, "expiry_year", errors).and_then(|year| {
            let year = if (0..100).contains(&year) { 2000 + year } else { year };
            let current = i64::from(today.year());
            if year < current {
                errors.push(InvalidField::new("expiry_year", "card has expired"));
                None
            } else if year > current + MAX_CARD_VALIDITY_YEARS {
                errors.push(InvalidField::new(
                    "expiry_year",
                    format!("must be within {} years", MAX_CARD_VALIDITY_YEARS),
                ));
                None
            } else {
                i32::try_from(year).ok()
            }
        });

        if let (Some(month), Some(year)) = (expiry_month, expiry_year) {
            if year == today.year() && month < today.month() {
                errors.push(InvalidField::new("expiry_month", "card has expired"));
            }
        }

        let cvv = required_str(data, "cvv", errors).and_then(|cvv| {
            if (3..=4).contains(&cvv.len()) && cvv.chars().all(|c| c.is_ascii_digit()) {
                Some(cvv)
            } else {
                errors.push(InvalidField::new("cvv", "must be 3 or 4 digits"));
                None
            }
        });

        if errors.len() != before {
            return None;
        }

        Some(MethodDetails::Card {
            card_number: card_number?,
            expiry_month: expiry_month?,
            expiry_year: expiry_year?,
            cvv: cvv?,
            cardholder_name: optional_str(data, "cardholder_name"),
        })
    }
}

fn redirect_capture_details(data: &Value, errors: &mut Vec<InvalidField>) -> Option<MethodDetails> {
    let return_url = required_url(data, "return_url", errors);
    let cancel_url = required_url(data, "cancel_url", errors);

    Some(MethodDetails::RedirectCapture {
        return_url: return_url?,
        cancel_url: cancel_url?,
        description: optional_str(data, "description"),
    })
}

fn parse_amount(value: Option<&Value>, errors: &mut Vec<InvalidField>) -> Option<BigDecimal> {
    let parsed = match value {
        Some(Value::Number(n)) => BigDecimal::from_str(&n.to_string()).ok(),
        Some(Value::String(s)) => BigDecimal::from_str(s.trim()).ok(),
        None | Some(Value::Null) => {
            errors.push(InvalidField::new("amount", "is required"));
            return None;
        }
        Some(_) => None,
    };

    match parsed {
        None => {
            errors.push(InvalidField::new("amount", "must be a decimal number"));
            None
        }
        Some(amount) if amount <= BigDecimal::zero() => {
            errors.push(InvalidField::new("amount", "must be greater than zero"));
            None
        }
        Some(amount) if amount.normalized().as_bigint_and_exponent().1 > 2 => {
            errors.push(InvalidField::new("amount", "must have at most 2 decimal places"));
            None
        }
        Some(amount) => Some(amount),
    }
}

fn parse_currency(
    method: PaymentMethod,
    value: Option<&Value>,
    errors: &mut Vec<InvalidField>,
) -> Option<String> {
    let currency = match value.and_then(Value::as_str) {
        Some(code) => code.trim().to_uppercase(),
        None => match method {
            PaymentMethod::PushPayment => "KES".to_string(),
            PaymentMethod::RedirectCapture | PaymentMethod::Card => "USD".to_string(),
        },
    };
    if CURRENCY_CODE.is_match(&currency) {
        Some(currency)
    } else {
        errors.push(InvalidField::new("currency", "must be a 3-letter ISO code"));
        None
    }
}

fn optional_str(data: &Value, field: &str) -> Option<String> {
    data.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required_str(data: &Value, field: &str, errors: &mut Vec<InvalidField>) -> Option<String> {
    let value = match data.get(field) {
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    match value {
        Some(v) if !v.is_empty() => Some(v),
        _ => {
            errors.push(InvalidField::new(field, "is required"));
            None
        }
    }
}

fn required_int(data: &Value, field: &str, errors: &mut Vec<InvalidField>) -> Option<i64> {
    let parsed = match data.get(field) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        None | Some(Value::Null) => {
            errors.push(InvalidField::new(field, "is required"));
            return None;
        }
        Some(_) => None,
    };
    if parsed.is_none() {
        errors.push(InvalidField::new(field, "must be an integer"));
    }
    parsed
}

fn required_url(data: &Value, field: &str, errors: &mut Vec<InvalidField>) -> Option<String> {
    let raw = required_str(data, field, errors)?;
    match reqwest::Url::parse(&raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(raw),
        _ => {
            errors.push(InvalidField::new(field, "must be an absolute http(s) URL"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn validator() -> PaymentRequestValidator {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 15, 12, 0, 0).unwrap());
        PaymentRequestValidator::new(Arc::new(clock))
    }

    #[test]
    fn test_normalizes_every_accepted_phone_form() {
        let forms = [
            "0712345678",
            "712345678",
            "254712345678",
            "+254712345678",
            "+254 712 345 678",
            "0712-345-678",
            "(0712) 345678",
        ];
        for form in forms {
            assert_eq!(
                normalize_phone_number(form).as_deref(),
                Some("254712345678"),
                "form {form}"
            );
        }
        assert_eq!(
            normalize_phone_number("0110123456").as_deref(),
            Some("254110123456")
        );
    }

    #[test]
    fn test_rejects_non_mobile_numbers() {
        for bad in ["", "0812345678", "07123456", "07123456789", "+255712345678", "abc"] {
            assert_eq!(normalize_phone_number(bad), None, "input {bad}");
        }
    }

    #[test]
    fn test_push_payment_request_is_normalized() {
        let request = validator()
            .validate(
                PaymentMethod::PushPayment,
                &json!({"amount": 500, "phone_number": "0712345678", "customer_reference": "CUST-000123456789"}),
            )
            .unwrap();

        assert_eq!(request.amount, BigDecimal::from(500));
        assert_eq!(request.currency, "KES");
        match request.details {
            MethodDetails::PushPayment {
                phone_number,
                account_reference,
                ..
            } => {
                assert_eq!(phone_number, "254712345678");
                assert_eq!(account_reference, "CUST-0001234");
            }
            other => panic!("unexpected details {other:?}"),
        }
    }

    #[test]
    fn test_zero_and_negative_amounts_are_rejected() {
        for amount in [json!(0), json!(-5), json!("-0.01"), json!("abc"), json!(1.005)] {
            let err = validator()
                .validate(
                    PaymentMethod::PushPayment,
                    &json!({"amount": amount, "phone_number": "0712345678", "customer_reference": "c1"}),
                )
                .unwrap_err();
            assert!(err.0.iter().any(|f| f.field == "amount"), "amount {amount}");
        }
    }

    #[test]
    fn test_card_with_two_digit_cvv_is_rejected() {
        let err = validator()
            .validate(
                PaymentMethod::Card,
                &json!({
                    "amount": "49.99",
                    "customer_reference": "c1",
                    "card_number": "4111 1111 1111 1111",
                    "expiry_month": 12,
                    "expiry_year": 2027,
                    "cvv": "12"
                }),
            )
            .unwrap_err();
        assert_eq!(err.0, vec![InvalidField::new("cvv", "must be 3 or 4 digits")]);
    }

    #[test]
    fn test_card_field_rules() {
        let err = validator()
            .validate(
                PaymentMethod::Card,
                &json!({
                    "amount": 10,
                    "customer_reference": "c1",
                    "card_number": "4111-1111",
                    "expiry_month": 13,
                    "expiry_year": 2025,
                    "cvv": "12345"
                }),
            )
            .unwrap_err();
        let fields: Vec<&str> = err.0.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(fields, vec!["card_number", "expiry_month", "expiry_year", "cvv"]);
    }

    #[test]
    fn test_card_expiring_earlier_this_year_is_rejected() {
        let err = validator()
            .validate(
                PaymentMethod::Card,
                &json!({
                    "amount": 10,
                    "customer_reference": "c1",
                    "card_number": "4111111111111111",
                    "expiry_month": 5,
                    "expiry_year": 26,
                    "cvv": "123"
                }),
            )
            .unwrap_err();
        assert_eq!(err.0[0].field, "expiry_month");
    }

    #[test]
    fn test_valid_card_accepts_two_digit_year() {
        let request = validator()
            .validate(
                PaymentMethod::Card,
                &json!({
                    "amount": 10,
                    "currency": "eur",
                    "customer_reference": "c1",
                    "card_number": "4111111111111111",
                    "expiry_month": "6",
                    "expiry_year": "26",
                    "cvv": "1234"
                }),
            )
            .unwrap();
        assert_eq!(request.currency, "EUR");
        assert!(matches!(
            request.details,
            MethodDetails::Card { expiry_year: 2026, expiry_month: 6, .. }
        ));
    }

    fn card_with_year(year: Value) -> Value {
        json!({
            "amount": 10,
            "customer_reference": "c1",
            "card_number": "4111111111111111",
            "expiry_month": 12,
            "expiry_year": year,
            "cvv": "123"
        })
    }

    #[test]
    fn test_far_future_expiry_year_is_rejected() {
        for year in [json!(4294969322i64), json!(3000000000i64), json!(2047), json!(i64::MAX)] {
            let err = validator().validate(PaymentMethod::Card, &card_with_year(year.clone())).unwrap_err();
            assert_eq!(err.0.len(), 1, "year {year}");
            assert_eq!(err.0[0].field, "expiry_year", "year {year}");
        }

        let request = validator().validate(PaymentMethod::Card, &card_with_year(json!(2046))).unwrap();
        assert!(matches!(request.details, MethodDetails::Card { expiry_year: 2046, .. }));
    }

    #[test]
    fn test_expiry_year_follows_the_clock() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 12, 31, 23, 0, 0).unwrap());
        let validator = PaymentRequestValidator::new(Arc::new(clock.clone()));
        assert!(validator.validate(PaymentMethod::Card, &card_with_year(json!(2026))).is_ok());

        clock.set(Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
        let err = validator.validate(PaymentMethod::Card, &card_with_year(json!(2026))).unwrap_err();
        assert_eq!(err.0, vec![InvalidField::new("expiry_year", "card has expired")]);
    }

    #[test]
    fn test_redirect_capture_requires_callback_urls() {
        let err = validator()
            .validate(
                PaymentMethod::RedirectCapture,
                &json!({"amount": 25, "customer_reference": "c1", "return_url": "not a url"}),
            )
            .unwrap_err();
        let fields: Vec<&str> = err.0.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(fields, vec!["return_url", "cancel_url"]);
    }

    #[test]
    fn test_non_object_body_is_rejected() {
        let err = validator()
            .validate(PaymentMethod::Card, &json!(["amount", 10]))
            .unwrap_err();
        assert_eq!(err.0[0].field, "body");
    }
}
