//! Payment domain types shared by the validator, adapters and ledger.

use crate::logging::{mask_card_number, mask_phone_number};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported payment methods, one per gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Mobile-money push payment completed by an asynchronous callback
    PushPayment,
    /// Order approved out of band, then explicitly captured
    RedirectCapture,
    /// Card charge answered synchronously
    Card,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 3] = [
        PaymentMethod::PushPayment,
        PaymentMethod::RedirectCapture,
        PaymentMethod::Card,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::PushPayment => "push_payment",
            PaymentMethod::RedirectCapture => "redirect_capture",
            PaymentMethod::Card => "card",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "push_payment" | "mpesa" | "mobile_money" => Ok(PaymentMethod::PushPayment),
            "redirect_capture" | "paypal" => Ok(PaymentMethod::RedirectCapture),
            "card" => Ok(PaymentMethod::Card),
            other => Err(format!("unknown payment method: {}", other)),
        }
    }
}

/// Ledger status of a payment transaction.
///
/// `Completed` and `Failed` are terminal: once reached, no further
/// transition is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Completed | PaymentStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn from_db_status(status: &str) -> Option<Self> {
        match status {
            "pending" => Some(PaymentStatus::Pending),
            "completed" => Some(PaymentStatus::Completed),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method-specific fields of an accepted payment request. `Debug` masks the
/// phone number and card data.
#[derive(Clone, PartialEq, Eq)]
pub enum MethodDetails {
    PushPayment {
        /// Canonical `<country-code><subscriber>` form, digits only
        phone_number: String,
        account_reference: String,
        description: String,
    },
    RedirectCapture {
        return_url: String,
        cancel_url: String,
        description: Option<String>,
    },
    Card {
        card_number: String,
        expiry_month: u32,
        expiry_year: i32,
        cvv: String,
        cardholder_name: Option<String>,
    },
}

impl fmt::Debug for MethodDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodDetails::PushPayment {
                phone_number,
                account_reference,
                description,
            } => f
                .debug_struct("PushPayment")
                .field("phone_number", &mask_phone_number(phone_number))
                .field("account_reference", account_reference)
                .field("description", description)
                .finish(),
            MethodDetails::RedirectCapture {
                return_url,
                cancel_url,
                description,
            } => f
                .debug_struct("RedirectCapture")
                .field("return_url", return_url)
                .field("cancel_url", cancel_url)
                .field("description", description)
                .finish(),
            MethodDetails::Card {
                card_number,
                expiry_month,
                expiry_year,
                cardholder_name,
                ..
            } => f
                .debug_struct("Card")
                .field("card_number", &mask_card_number(card_number))
                .field("expiry_month", expiry_month)
                .field("expiry_year", expiry_year)
                .field("cvv", &"***")
                .field("cardholder_name", cardholder_name)
                .finish(),
        }
    }
}

impl MethodDetails {
    pub fn method(&self) -> PaymentMethod {
        match self {
            MethodDetails::PushPayment { .. } => PaymentMethod::PushPayment,
            MethodDetails::RedirectCapture { .. } => PaymentMethod::RedirectCapture,
            MethodDetails::Card { .. } => PaymentMethod::Card,
        }
    }
}

/// A validated, normalized payment request. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub amount: BigDecimal,
    pub currency: String,
    pub customer_reference: String,
    pub details: MethodDetails,
}

impl PaymentRequest {
    pub fn method(&self) -> PaymentMethod {
        self.details.method()
    }
}
