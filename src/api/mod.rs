//! HTTP surface
//!
//! Thin axum handlers over [`PaymentService`]. Every route answers with the
//! `{success, code, message, data}` envelope and an HTTP status equal to
//! `code`, except the push callback which is always acknowledged with 200.

pub mod health;
pub mod payments;

use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::services::payment_service::PaymentService;
use crate::services::response::ApiResponse;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Shared handler state
pub type AppState = Arc<PaymentService>;

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// Build the application router with request-id and logging layers.
pub fn router(service: AppState) -> Router {
    let api = Router::new()
        .route("/api/payments/transactions", get(payments::list_transactions))
        .route("/api/payments/{method}", post(payments::process_payment))
        .route("/api/payments/orders/{order_id}/capture", post(payments::capture_order))
        .route("/api/payments/status/{reference}", get(payments::payment_status))
        .route("/api/payments/callbacks/push", post(payments::push_callback))
        .with_state(service);

    Router::new()
        .route("/health", get(health::health))
        .merge(api)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}
