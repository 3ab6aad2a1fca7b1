//! Payment Service
//!
//! The four inbound operations of the engine:
//! - `process_payment`: validate, persist a pending record, initiate
//! - `capture_redirect_payment`: finalize an approved redirect order
//! - `query_payment_status`: ledger lookup, with a live gateway query while pending
//! - `ingest_callback`: apply a push-payment callback, always acknowledged
//!
//! The pending record is written before the gateway is called. The gateway
//! call and the ledger write that follows it run in a spawned task, so a
//! caller that goes away mid-request cannot cut them short.

use crate::error::PaymentError;
use crate::ledger::{AuditEntry, AuditKind, LedgerKey, PaymentTransaction, TransactionFilter, TransactionLedger};
use crate::logging::{mask_phone_number, redact_json};
use crate::payments::error::GatewayError;
use crate::payments::provider::GatewayAdapter;
use crate::payments::registry::GatewayRegistry;
use crate::payments::types::{MethodDetails, PaymentMethod, PaymentRequest, PaymentStatus};
use crate::payments::validator::PaymentRequestValidator;
use crate::services::callback_ingester::CallbackIngester;
use crate::services::response::{transaction_view, ApiResponse};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Message returned for gateway declines; gateway text is kept in the ledger only.
const DECLINED_REASON: &str = "declined by the payment provider";

/// How an initiate call left the transaction.
#[derive(Debug)]
enum Settled {
    Pending {
        tx: PaymentTransaction,
        approval_url: Option<String>,
        customer_message: Option<String>,
    },
    Terminal(PaymentTransaction),
}

pub struct PaymentService {
    validator: PaymentRequestValidator,
    gateways: Arc<GatewayRegistry>,
    ledger: Arc<TransactionLedger>,
    callbacks: CallbackIngester,
}

impl PaymentService {
    pub fn new(gateways: Arc<GatewayRegistry>, ledger: Arc<TransactionLedger>) -> Self {
        let validator = PaymentRequestValidator::new(ledger.clock().clone());
        let callbacks = CallbackIngester::new(gateways.get(PaymentMethod::PushPayment), ledger.clone());
        Self {
            validator,
            gateways,
            ledger,
            callbacks,
        }
    }

    pub fn ledger(&self) -> &Arc<TransactionLedger> {
        &self.ledger
    }

    pub fn gateways(&self) -> &Arc<GatewayRegistry> {
        &self.gateways
    }

    fn gateway(&self, method: PaymentMethod) -> Result<Arc<dyn GatewayAdapter>, PaymentError> {
        self.gateways
            .get(method)
            .ok_or_else(|| PaymentError::UnsupportedMethod(method.to_string()))
    }

    // ------------------------------------------------------------------
    // processPayment
    // ------------------------------------------------------------------

    #[instrument(skip(self, data))]
    pub async fn process_payment(&self, method: &str, data: &Value) -> ApiResponse {
        match self.try_process_payment(method, data).await {
            Ok(response) => response,
            Err(e) => {
                if e.status_code() >= 500 {
                    error!(method = %method, error = %e, "Payment processing failed");
                }
                ApiResponse::from_error(&e)
            }
        }
    }

    async fn try_process_payment(&self, method: &str, data: &Value) -> Result<ApiResponse, PaymentError> {
        let method: PaymentMethod = method
            .parse()
            .map_err(|_| PaymentError::UnsupportedMethod(method.to_string()))?;
        let gateway = self.gateway(method)?;

        let request = match self.validator.validate(method, data) {
            Ok(request) => request,
            Err(errors) => {
                self.ledger
                    .audit(
                        AuditEntry::new(
                            AuditKind::ValidationFailure,
                            self.ledger.clock().now(),
                            json!({ "errors": errors.0 }),
                        )
                        .with_method(method),
                    )
                    .await;
                return Err(errors.into());
            }
        };

        let tx = self.ledger.create(&request).await?;
        if let MethodDetails::PushPayment { phone_number, .. } = &request.details {
            info!(tx_id = %tx.id, phone = %mask_phone_number(phone_number), amount = %tx.amount, "Initiating push payment");
        }

        let ledger = self.ledger.clone();
        let pending = tx.clone();
        let settled = tokio::spawn(async move { initiate_and_record(ledger, gateway, pending, request).await })
            .await
            .map_err(|e| PaymentError::InternalError(format!("initiate task for {} aborted: {}", tx.id, e)))??;

        Ok(match settled {
            Settled::Pending {
                tx,
                approval_url,
                customer_message,
            } => ApiResponse::for_transaction(&tx, true)
                .with_data_field("approval_url", json!(approval_url))
                .with_data_field("customer_message", json!(customer_message)),
            Settled::Terminal(tx) if tx.status == PaymentStatus::Failed => {
                return Err(PaymentError::PaymentFailed {
                    transaction_id: tx.id,
                    reason: DECLINED_REASON.to_string(),
                })
            }
            Settled::Terminal(tx) => ApiResponse::for_transaction(&tx, true),
        })
    }

    // ------------------------------------------------------------------
    // captureRedirectPayment
    // ------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn capture_redirect_payment(&self, order_id: &str) -> ApiResponse {
        match self.try_capture(order_id).await {
            Ok(response) => response,
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "Capture did not complete");
                ApiResponse::from_error(&e)
            }
        }
    }

    async fn try_capture(&self, order_id: &str) -> Result<ApiResponse, PaymentError> {
        let tx = self.ledger.get(&LedgerKey::GatewayRef(order_id.to_string())).await?;
        if tx.method != PaymentMethod::RedirectCapture {
            return Err(PaymentError::UnsupportedMethod(format!("capture for {}", tx.method)));
        }
        if tx.is_terminal() {
            info!(tx_id = %tx.id, status = %tx.status, "Capture requested for settled order");
            return Ok(ApiResponse::for_transaction(&tx, true));
        }

        let gateway = self.gateway(PaymentMethod::RedirectCapture)?;
        let ledger = self.ledger.clone();
        let order = order_id.to_string();
        let pending = tx.clone();
        let captured = tokio::spawn(async move {
            match gateway.capture(&order).await {
                Ok(result) => ledger
                    .apply_gateway_result(&pending, result.status, redact_json(&result.raw), result.receipt.as_deref())
                    .await
                    .map_err(PaymentError::from),
                Err(e) => Err(record_gateway_failure(&ledger, &pending, e).await),
            }
        })
        .await
        .map_err(|e| PaymentError::InternalError(format!("capture task for {} aborted: {}", tx.id, e)))?;

        match captured {
            Ok(tx) => Ok(ApiResponse::for_transaction(&tx, true)),
            // Flagged for review; the order stays pending for the reconciler
            Err(PaymentError::ProtocolViolation(_)) => Ok(ApiResponse::for_transaction(&tx, true)),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // queryPaymentStatus
    // ------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn query_payment_status(&self, reference: &str) -> ApiResponse {
        match self.try_query_status(reference).await {
            Ok(response) => response,
            Err(e) => ApiResponse::from_error(&e),
        }
    }

    async fn try_query_status(&self, reference: &str) -> Result<ApiResponse, PaymentError> {
        let tx = self
            .ledger
            .lookup(reference)
            .await?
            .ok_or_else(|| PaymentError::TransactionNotFound(reference.to_string()))?;

        if tx.is_terminal() {
            return Ok(ApiResponse::for_transaction(&tx, false));
        }

        let (Some(gateway_ref), Some(gateway)) = (tx.gateway_transaction_id.clone(), self.gateways.get(tx.method))
        else {
            return Ok(ApiResponse::for_transaction(&tx, false));
        };

        let tx = match gateway.query(&gateway_ref).await {
            Ok(result) => {
                self.ledger
                    .apply_gateway_result(&tx, result.status, redact_json(&result.raw), result.receipt.as_deref())
                    .await?
            }
            Err(e) => {
                let _ = record_gateway_failure(&self.ledger, &tx, e).await;
                tx
            }
        };

        Ok(ApiResponse::for_transaction(&tx, false))
    }

    /// Ledger search for support tooling. Never calls a gateway.
    pub async fn list_transactions(&self, filter: &TransactionFilter) -> ApiResponse {
        match self.ledger.query(filter).await {
            Ok(found) => {
                let items: Vec<Value> = found.iter().map(transaction_view).collect();
                ApiResponse::ok(
                    format!("{} transaction(s)", items.len()),
                    json!({ "transactions": items }),
                )
            }
            Err(e) => ApiResponse::from_error(&PaymentError::from(e)),
        }
    }

    // ------------------------------------------------------------------
    // ingestCallback
    // ------------------------------------------------------------------

    /// Apply a push callback. The provider always gets an acknowledgement.
    pub async fn ingest_callback(&self, payload: &Value) -> ApiResponse {
        let outcome = self.callbacks.ingest(payload).await;
        info!(outcome = ?outcome, "Push callback processed");
        ApiResponse::ok("Accepted", json!({"ResultCode": 0, "ResultDesc": "Accepted"}))
    }
}

/// Call the gateway and record the result. Runs detached from the caller.
async fn initiate_and_record(
    ledger: Arc<TransactionLedger>,
    gateway: Arc<dyn GatewayAdapter>,
    tx: PaymentTransaction,
    request: PaymentRequest,
) -> Result<Settled, PaymentError> {
    let outcome = match gateway.initiate(tx.id, &request).await {
        Ok(outcome) => outcome,
        Err(GatewayError::Rejected { code, message, raw, .. }) => {
            let payload = json!({"code": code, "message": message, "response": redact_json(&raw)});
            ledger
                .audit(
                    AuditEntry::new(AuditKind::GatewayRejected, ledger.clock().now(), payload.clone())
                        .for_transaction(tx.id)
                        .with_method(tx.method),
                )
                .await;
            let tx = ledger.apply_gateway_result(&tx, PaymentStatus::Failed, payload, None).await?;
            return Ok(Settled::Terminal(tx));
        }
        Err(e @ (GatewayError::Token { .. } | GatewayError::Unsupported { .. })) => {
            // Nothing reached the gateway
            let payload = json!({"error": e.to_string()});
            ledger.apply_gateway_result(&tx, PaymentStatus::Failed, payload, None).await?;
            return Err(PaymentError::InternalError(e.to_string()));
        }
        Err(e) => {
            // Unavailable or unreadable: the gateway may have acted, so stay pending
            let _ = record_gateway_failure(&ledger, &tx, e).await;
            return Ok(Settled::Pending {
                tx,
                approval_url: None,
                customer_message: None,
            });
        }
    };

    let payload = redact_json(&outcome.raw);
    let tx = match &outcome.gateway_transaction_id {
        Some(gateway_id) => ledger.assign_gateway_id(tx.id, gateway_id, &payload).await?,
        None => tx,
    };

    if outcome.status.is_terminal() {
        let receipt = match outcome.status {
            PaymentStatus::Completed => tx.gateway_transaction_id.clone(),
            _ => None,
        };
        let tx = ledger
            .apply_gateway_result(&tx, outcome.status, payload, receipt.as_deref())
            .await?;
        return Ok(Settled::Terminal(tx));
    }

    info!(
        tx_id = %tx.id,
        gateway_ref = tx.gateway_transaction_id.as_deref().unwrap_or_default(),
        method = %tx.method,
        "Payment initiated, awaiting completion"
    );
    Ok(Settled::Pending {
        tx,
        approval_url: outcome.approval_url,
        customer_message: outcome.customer_message,
    })
}

/// Audit a failed gateway call on a pending transaction. Protocol violations
/// also park the transaction for review.
pub(crate) async fn record_gateway_failure(ledger: &TransactionLedger, tx: &PaymentTransaction, err: GatewayError) -> PaymentError {
    let (kind, detail) = match &err {
        GatewayError::ProtocolViolation { detail, raw, .. } => (
            AuditKind::ProtocolViolation,
            json!({"detail": detail, "response": raw.as_ref().map(redact_json)}),
        ),
        GatewayError::Unavailable { message, .. } => (AuditKind::GatewayUnavailable, json!({"detail": message})),
        other => (AuditKind::GatewayUnavailable, json!({"detail": other.to_string()})),
    };

    ledger
        .audit(
            AuditEntry::new(kind, ledger.clock().now(), detail)
                .for_transaction(tx.id)
                .with_gateway_ref(tx.gateway_transaction_id.as_deref())
                .with_method(tx.method),
        )
        .await;

    if let GatewayError::ProtocolViolation { detail, .. } = &err {
        if let Err(e) = ledger.flag_for_review(tx, detail).await {
            error!(tx_id = %tx.id, error = %e, "Failed to flag transaction for review");
        }
    }

    PaymentError::from(err)
}
