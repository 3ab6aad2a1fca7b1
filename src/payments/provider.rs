//! Gateway adapter trait
//!
//! Every gateway supports `initiate` and `query`. `capture`,
//! `parse_callback` and `find_by_reference` are optional capabilities: the
//! default implementations report [`GatewayError::Unsupported`], so only the
//! redirect/capture adapter overrides `capture`, only the push-payment adapter
//! overrides `parse_callback`, and only the card adapter can find a charge by
//! the ledger id it was submitted with.

use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::types::{PaymentMethod, PaymentRequest, PaymentStatus};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// What the gateway said when a payment was initiated.
#[derive(Debug, Clone)]
pub struct InitiateOutcome {
    /// Gateway-assigned reference (tracking id, order id, charge id)
    pub gateway_transaction_id: Option<String>,
    /// `Pending` for push and redirect flows, terminal for synchronous ones
    pub status: PaymentStatus,
    /// Where the customer must go to approve a redirect payment
    pub approval_url: Option<String>,
    /// Human-readable text from the gateway, safe to show the customer
    pub customer_message: Option<String>,
    pub raw: Value,
}

/// Result of a `query` or `capture` call.
#[derive(Debug, Clone)]
pub struct GatewayStatus {
    pub status: PaymentStatus,
    pub receipt: Option<String>,
    pub description: Option<String>,
    pub raw: Value,
}

/// A gateway record located by the ledger id sent at initiation.
#[derive(Debug, Clone)]
pub struct ReferenceMatch {
    pub gateway_transaction_id: String,
    pub status: GatewayStatus,
}

/// Metadata items carried by a push-payment callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallbackMetadata {
    pub amount: Option<BigDecimal>,
    pub receipt: Option<String>,
    pub transaction_date: Option<String>,
    pub phone_number: Option<String>,
}

/// A structurally valid push-payment callback.
#[derive(Debug, Clone)]
pub struct CallbackEvent {
    pub gateway_transaction_id: String,
    pub status: PaymentStatus,
    pub result_code: i64,
    pub description: String,
    pub metadata: CallbackMetadata,
    pub raw: Value,
}

#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Start a payment. `transaction_id` is the ledger id of the already
    /// persisted pending record and may be sent to the gateway as a reference.
    async fn initiate(&self, transaction_id: Uuid, request: &PaymentRequest) -> GatewayResult<InitiateOutcome>;

    /// Ask the gateway for the current status of `gateway_ref`.
    async fn query(&self, gateway_ref: &str) -> GatewayResult<GatewayStatus>;

    /// Finalize an approved order.
    async fn capture(&self, _gateway_ref: &str) -> GatewayResult<GatewayStatus> {
        Err(GatewayError::Unsupported {
            gateway: self.method(),
            capability: "capture",
        })
    }

    /// Structurally validate and decode an asynchronous callback.
    fn parse_callback(&self, _payload: &Value) -> GatewayResult<CallbackEvent> {
        Err(GatewayError::Unsupported {
            gateway: self.method(),
            capability: "callback",
        })
    }

    /// Find the gateway record of a payment whose initiate response was
    /// lost, by the ledger id it was submitted with. `Ok(None)` when the
    /// gateway has no such record.
    async fn find_by_reference(&self, _transaction_id: Uuid) -> GatewayResult<Option<ReferenceMatch>> {
        Err(GatewayError::Unsupported {
            gateway: self.method(),
            capability: "reference lookup",
        })
    }
}
