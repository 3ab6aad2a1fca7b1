//! Payment endpoints

use super::AppState;
use crate::error::PaymentError;
use crate::ledger::TransactionFilter;
use crate::payments::types::{PaymentMethod, PaymentStatus};
use crate::payments::validator::InvalidField;
use crate::services::response::ApiResponse;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Handle POST /api/payments/{method}
pub async fn process_payment(
    State(service): State<AppState>,
    Path(method): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResponse {
    let data = match body {
        Ok(Json(data)) => data,
        Err(rejection) => {
            debug!(method = %method, error = %rejection, "Unreadable payment request body");
            return ApiResponse::from_error(&PaymentError::InvalidField(vec![InvalidField::new(
                "body",
                "request body must be a JSON object",
            )]));
        }
    };
    service.process_payment(&method, &data).await
}

/// Handle POST /api/payments/orders/{order_id}/capture
pub async fn capture_order(State(service): State<AppState>, Path(order_id): Path<String>) -> ApiResponse {
    service.capture_redirect_payment(&order_id).await
}

/// Handle GET /api/payments/status/{reference}
///
/// `reference` is either the gateway tracking reference or the ledger id.
pub async fn payment_status(State(service): State<AppState>, Path(reference): Path<String>) -> ApiResponse {
    service.query_payment_status(&reference).await
}

/// Handle POST /api/payments/callbacks/push
///
/// The provider retries anything that is not a 200, so even an unreadable
/// body is acknowledged; it is recorded by the ingester as a violation.
pub async fn push_callback(
    State(service): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResponse {
    let payload = match body {
        Ok(Json(payload)) => payload,
        Err(rejection) => {
            warn!(error = %rejection, "Unreadable push callback body");
            Value::Null
        }
    };
    service.ingest_callback(&payload).await
}

#[derive(Debug, Default, Deserialize)]
pub struct TransactionListQuery {
    pub customer_reference: Option<String>,
    pub status: Option<PaymentStatus>,
    pub method: Option<PaymentMethod>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl From<TransactionListQuery> for TransactionFilter {
    fn from(q: TransactionListQuery) -> Self {
        TransactionFilter {
            customer_reference: q.customer_reference,
            status: q.status,
            method: q.method,
            created_from: q.created_from,
            created_to: q.created_to,
            limit: q.limit,
        }
    }
}

/// Handle GET /api/payments/transactions
pub async fn list_transactions(
    State(service): State<AppState>,
    query: Result<Query<TransactionListQuery>, axum::extract::rejection::QueryRejection>,
) -> ApiResponse {
    match query {
        Ok(Query(query)) => service.list_transactions(&query.into()).await,
        Err(rejection) => ApiResponse::from_error(&PaymentError::InvalidField(vec![InvalidField::new(
            "query",
            rejection.body_text(),
        )])),
    }
}
