//! Gateway failure taxonomy

use crate::payments::types::PaymentMethod;
use serde_json::Value;

/// Failure of a token exchange. `Clone` so one refresh result can be shared
/// with every caller waiting on it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TokenError {
    #[error("token endpoint unreachable: {0}")]
    Unavailable(String),

    #[error("token endpoint rejected credentials: status {status}")]
    Rejected { status: u16 },

    #[error("malformed token response: {0}")]
    Malformed(String),

    #[error("invalid gateway credentials: {0}")]
    InvalidCredentials(String),

    #[error("no token source registered for gateway {0}")]
    UnknownGateway(String),
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Timeout or network failure. The gateway may have acted on the request,
    /// so the transaction must stay pending.
    #[error("{gateway} unavailable: {message}")]
    Unavailable { gateway: PaymentMethod, message: String },

    /// The gateway answered with a shape we do not understand.
    #[error("{gateway} protocol violation: {detail}")]
    ProtocolViolation {
        gateway: PaymentMethod,
        detail: String,
        raw: Option<Value>,
    },

    /// The gateway definitively declined the payment.
    #[error("{gateway} rejected the payment ({code}): {message}")]
    Rejected {
        gateway: PaymentMethod,
        code: String,
        message: String,
        raw: Value,
    },

    #[error("{capability} is not supported by {gateway}")]
    Unsupported {
        gateway: PaymentMethod,
        capability: &'static str,
    },

    #[error("{gateway} authentication failed: {source}")]
    Token {
        gateway: PaymentMethod,
        #[source]
        source: TokenError,
    },
}

impl GatewayError {
    pub fn unavailable(gateway: PaymentMethod, message: impl Into<String>) -> Self {
        GatewayError::Unavailable {
            gateway,
            message: message.into(),
        }
    }

    pub fn protocol(gateway: PaymentMethod, detail: impl Into<String>, raw: Option<Value>) -> Self {
        GatewayError::ProtocolViolation {
            gateway,
            detail: detail.into(),
            raw,
        }
    }

    /// Map a transport error. Timeouts and connection failures are
    /// `Unavailable`; a body that fails to decode is a protocol violation.
    pub fn from_reqwest(gateway: PaymentMethod, err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::protocol(gateway, format!("undecodable response: {}", err), None)
        } else {
            GatewayError::unavailable(gateway, err.to_string())
        }
    }

    pub fn from_token(gateway: PaymentMethod, source: TokenError) -> Self {
        match source {
            TokenError::Unavailable(message) => GatewayError::Unavailable { gateway, message },
            source => GatewayError::Token { gateway, source },
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
