use crate::error::{PaymentError, CODE_OK, CODE_PAYMENT_FAILED};
use crate::ledger::PaymentTransaction;
use crate::payments::types::PaymentStatus;
use serde::Serialize;
use serde_json::{json, Value};

/// Envelope returned by every inbound operation.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            code: CODE_OK,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn from_error(err: &PaymentError) -> Self {
        let data = match err {
            PaymentError::InvalidField(fields) => Some(json!({ "errors": fields })),
            PaymentError::PaymentFailed { transaction_id, .. } => Some(json!({
                "transaction_id": transaction_id,
                "status": PaymentStatus::Failed,
            })),
            _ => None,
        };
        Self {
            success: false,
            code: err.status_code(),
            message: err.user_message(),
            data,
        }
    }

    /// Describe a transaction. A failed payment answers 402 when
    /// `failed_is_error` is set, 200 otherwise.
    pub fn for_transaction(tx: &PaymentTransaction, failed_is_error: bool) -> Self {
        let (success, code, message) = match tx.status {
            PaymentStatus::Pending => (true, CODE_OK, "Payment is being processed"),
            PaymentStatus::Completed => (true, CODE_OK, "Payment completed"),
            PaymentStatus::Failed if failed_is_error => (false, CODE_PAYMENT_FAILED, "Payment failed"),
            PaymentStatus::Failed => (true, CODE_OK, "Payment failed"),
        };
        Self {
            success,
            code,
            message: message.to_string(),
            data: Some(transaction_view(tx)),
        }
    }

    pub fn with_data_field(mut self, key: &str, value: Value) -> Self {
        if value.is_null() {
            return self;
        }
        if let Some(Value::Object(map)) = self.data.as_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }
}

/// Caller-facing view of a transaction. Raw gateway payloads are not included.
pub fn transaction_view(tx: &PaymentTransaction) -> Value {
    json!({
        "transaction_id": tx.id,
        "gateway_transaction_id": tx.gateway_transaction_id,
        "method": tx.method,
        "amount": tx.amount.to_string(),
        "currency": tx.currency,
        "customer_reference": tx.customer_reference,
        "status": tx.status,
        "receipt": tx.receipt,
        "created_at": tx.created_at,
        "updated_at": tx.updated_at,
    })
}
