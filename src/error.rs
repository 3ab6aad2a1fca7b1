//! Caller-facing error taxonomy
//!
//! Every inbound operation answers with one of four codes: 200 success,
//! 400 invalid input, 402 payment failed, 500 internal error. Protocol
//! violations and ledger conflicts are operator alerts; callers only ever see
//! a generic message for them.

use crate::ledger::LedgerError;
use crate::payments::error::GatewayError;
use crate::payments::types::PaymentMethod;
use crate::payments::validator::{InvalidField, ValidationErrors};
use uuid::Uuid;

pub const CODE_OK: u16 = 200;
pub const CODE_INVALID_INPUT: u16 = 400;
pub const CODE_PAYMENT_FAILED: u16 = 402;
pub const CODE_INTERNAL_ERROR: u16 = 500;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("invalid request: {} field error(s)", .0.len())]
    InvalidField(Vec<InvalidField>),

    #[error("unsupported payment method: {0}")]
    UnsupportedMethod(String),

    #[error("transaction {0} not found")]
    TransactionNotFound(String),

    #[error("payment {transaction_id} failed: {reason}")]
    PaymentFailed { transaction_id: Uuid, reason: String },

    #[error("{method} gateway unavailable: {message}")]
    GatewayUnavailable { method: PaymentMethod, message: String },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("conflicting state: {0}")]
    ConflictingState(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl PaymentError {
    pub fn status_code(&self) -> u16 {
        match self {
            PaymentError::InvalidField(_)
            | PaymentError::UnsupportedMethod(_)
            | PaymentError::TransactionNotFound(_) => CODE_INVALID_INPUT,
            PaymentError::PaymentFailed { .. } => CODE_PAYMENT_FAILED,
            PaymentError::GatewayUnavailable { .. }
            | PaymentError::ProtocolViolation(_)
            | PaymentError::ConflictingState(_)
            | PaymentError::InternalError(_) => CODE_INTERNAL_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            PaymentError::InvalidField(_) => "invalid_field",
            PaymentError::UnsupportedMethod(_) => "unsupported_method",
            PaymentError::TransactionNotFound(_) => "transaction_not_found",
            PaymentError::PaymentFailed { .. } => "payment_failed",
            PaymentError::GatewayUnavailable { .. } => "gateway_unavailable",
            PaymentError::ProtocolViolation(_)
            | PaymentError::ConflictingState(_)
            | PaymentError::InternalError(_) => "internal_error",
        }
    }

    /// Message safe to return to the caller.
    pub fn user_message(&self) -> String {
        match self {
            PaymentError::InvalidField(_) => "The payment request is invalid".to_string(),
            PaymentError::UnsupportedMethod(method) => {
                format!("Payment method '{}' is not supported", method)
            }
            PaymentError::TransactionNotFound(reference) => {
                format!("No payment found for reference '{}'", reference)
            }
            PaymentError::PaymentFailed { reason, .. } => format!("Payment failed: {}", reason),
            PaymentError::GatewayUnavailable { .. } => {
                "The payment provider is temporarily unavailable. Please try again.".to_string()
            }
            PaymentError::ProtocolViolation(_)
            | PaymentError::ConflictingState(_)
            | PaymentError::InternalError(_) => "An internal error occurred".to_string(),
        }
    }
}

impl From<ValidationErrors> for PaymentError {
    fn from(errors: ValidationErrors) -> Self {
        PaymentError::InvalidField(errors.0)
    }
}

impl From<LedgerError> for PaymentError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(key) => PaymentError::TransactionNotFound(key.to_string()),
            LedgerError::ConflictingState { .. } | LedgerError::GatewayIdAlreadyAssigned { .. } => {
                PaymentError::ConflictingState(err.to_string())
            }
            LedgerError::Storage(message) => PaymentError::InternalError(message),
        }
    }
}

impl From<GatewayError> for PaymentError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable { gateway, message } => PaymentError::GatewayUnavailable {
                method: gateway,
                message,
            },
            GatewayError::ProtocolViolation { .. } => PaymentError::ProtocolViolation(err.to_string()),
            GatewayError::Unsupported { gateway, capability } => {
                PaymentError::UnsupportedMethod(format!("{} {}", gateway, capability))
            }
            GatewayError::Rejected { .. } | GatewayError::Token { .. } => {
                PaymentError::InternalError(err.to_string())
            }
        }
    }
}
