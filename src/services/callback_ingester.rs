//! Push-payment callback ingestion
//!
//! Callbacks are delivered at least once, so the same payload may arrive any
//! number of times. Replays are harmless because the ledger's status update
//! is idempotent. Anything that cannot be trusted is audited as a protocol
//! violation and left for the reconciler; the provider is acknowledged
//! either way.

use crate::ledger::{AuditEntry, AuditKind, LedgerError, LedgerKey, TransactionLedger, UpdateOutcome};
use crate::logging::redact_json;
use crate::payments::error::GatewayError;
use crate::payments::provider::GatewayAdapter;
use crate::payments::types::{PaymentMethod, PaymentStatus};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// What happened to one delivered callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The callback moved the transaction to a terminal status
    Applied { transaction_id: Uuid, status: PaymentStatus },
    /// The transaction already had this status
    Duplicate { transaction_id: Uuid },
    /// The callback was not trusted and nothing changed
    Rejected { reason: String },
}

pub struct CallbackIngester {
    gateway: Option<Arc<dyn GatewayAdapter>>,
    ledger: Arc<TransactionLedger>,
}

impl CallbackIngester {
    pub fn new(gateway: Option<Arc<dyn GatewayAdapter>>, ledger: Arc<TransactionLedger>) -> Self {
        Self { gateway, ledger }
    }

    #[instrument(skip(self, payload))]
    pub async fn ingest(&self, payload: &Value) -> IngestOutcome {
        let Some(gateway) = &self.gateway else {
            return self
                .reject(None, None, "push payment gateway is not configured", payload)
                .await;
        };

        let event = match gateway.parse_callback(payload) {
            Ok(event) => event,
            Err(GatewayError::ProtocolViolation { detail, .. }) => {
                return self.reject(None, None, &detail, payload).await;
            }
            Err(e) => return self.reject(None, None, &e.to_string(), payload).await,
        };

        let tx = match self
            .ledger
            .get(&LedgerKey::GatewayRef(event.gateway_transaction_id.clone()))
            .await
        {
            Ok(tx) => tx,
            Err(LedgerError::NotFound(_)) => {
                return self
                    .reject(None, Some(&event.gateway_transaction_id), "unknown tracking reference", payload)
                    .await;
            }
            Err(e) => {
                error!(gateway_ref = %event.gateway_transaction_id, error = %e, "Ledger lookup failed for callback");
                return IngestOutcome::Rejected { reason: e.to_string() };
            }
        };

        if tx.method != gateway.method() {
            let reason = format!("tracking reference belongs to a {} transaction", tx.method);
            return self
                .reject(Some(tx.id), Some(&event.gateway_transaction_id), &reason, payload)
                .await;
        }

        if event.status == PaymentStatus::Completed {
            if let Some(reported) = &event.metadata.amount {
                if reported != &tx.amount {
                    let reason = format!("callback amount {} does not match ledger amount {}", reported, tx.amount);
                    let outcome = self
                        .reject(Some(tx.id), Some(&event.gateway_transaction_id), &reason, payload)
                        .await;
                    if let Err(e) = self.ledger.flag_for_review(&tx, &reason).await {
                        error!(tx_id = %tx.id, error = %e, "Failed to flag transaction for review");
                    }
                    return outcome;
                }
            }
        }

        match self
            .ledger
            .update_status(
                &LedgerKey::Id(tx.id),
                event.status,
                redact_json(&event.raw),
                event.metadata.receipt.as_deref(),
            )
            .await
        {
            Ok(UpdateOutcome::Applied(tx)) => {
                info!(
                    tx_id = %tx.id,
                    gateway_ref = %event.gateway_transaction_id,
                    result_code = event.result_code,
                    status = %tx.status,
                    "Callback applied"
                );
                IngestOutcome::Applied {
                    transaction_id: tx.id,
                    status: tx.status,
                }
            }
            Ok(UpdateOutcome::AlreadyApplied(tx)) => {
                debug!(tx_id = %tx.id, gateway_ref = %event.gateway_transaction_id, "Duplicate callback ignored");
                IngestOutcome::Duplicate { transaction_id: tx.id }
            }
            Err(e) => {
                // Conflicts are audited by the ledger itself
                error!(tx_id = %tx.id, error = %e, "Callback could not be applied");
                IngestOutcome::Rejected { reason: e.to_string() }
            }
        }
    }

    async fn reject(
        &self,
        transaction_id: Option<Uuid>,
        gateway_ref: Option<&str>,
        reason: &str,
        payload: &Value,
    ) -> IngestOutcome {
        let mut entry = AuditEntry::new(
            AuditKind::ProtocolViolation,
            self.ledger.clock().now(),
            json!({"source": "callback", "reason": reason, "payload": redact_json(payload)}),
        )
        .with_gateway_ref(gateway_ref)
        .with_method(PaymentMethod::PushPayment);
        entry.transaction_id = transaction_id;
        self.ledger.audit(entry).await;

        IngestOutcome::Rejected {
            reason: reason.to_string(),
        }
    }
}
