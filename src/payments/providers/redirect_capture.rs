//! Redirect/capture adapter
//!
//! Initiation creates an order and hands back an approval link. The customer
//! approves on the gateway's site; the order is then finalized with an
//! explicit `capture`.

use super::{read_json, send_with_token, str_field};
use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::provider::{GatewayAdapter, GatewayStatus, InitiateOutcome};
use crate::payments::token_cache::AccessTokenCache;
use crate::payments::types::{MethodDetails, PaymentMethod, PaymentRequest, PaymentStatus};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const ORDERS_PATH: &str = "/v2/checkout/orders";
pub const TOKEN_PATH: &str = "/v1/oauth2/token";

const ALREADY_CAPTURED: &str = "ORDER_ALREADY_CAPTURED";

#[derive(Debug, Clone, Deserialize)]
pub struct RedirectCaptureConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_brand_name")]
    pub brand_name: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_brand_name() -> String {
    "Payments".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

pub struct RedirectCaptureAdapter {
    http: reqwest::Client,
    config: RedirectCaptureConfig,
    tokens: Arc<AccessTokenCache>,
}

impl RedirectCaptureAdapter {
    pub fn new(http: reqwest::Client, config: RedirectCaptureConfig, tokens: Arc<AccessTokenCache>) -> Self {
        Self { http, config, tokens }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

/// Map an order status. Anything not yet finished or voided is still pending.
pub fn status_from_order_status(status: &str) -> PaymentStatus {
    match status {
        "COMPLETED" => PaymentStatus::Completed,
        "VOIDED" | "DECLINED" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    }
}

/// The link the customer must follow to approve the order.
fn approval_link(body: &Value) -> Option<String> {
    body.get("links")?
        .as_array()?
        .iter()
        .find(|link| matches!(link.get("rel").and_then(Value::as_str), Some("approve" | "payer-action")))
        .and_then(|link| link.get("href"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Id of the first capture of the first purchase unit.
fn capture_id(body: &Value) -> Option<String> {
    body.pointer("/purchase_units/0/payments/captures/0/id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn error_name(body: &Value) -> Option<&str> {
    body.pointer("/details/0/issue")
        .and_then(Value::as_str)
        .or_else(|| str_field(body, &["name", "error"]))
}

#[async_trait]
impl GatewayAdapter for RedirectCaptureAdapter {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::RedirectCapture
    }

    async fn initiate(&self, transaction_id: Uuid, request: &PaymentRequest) -> GatewayResult<InitiateOutcome> {
        let MethodDetails::RedirectCapture {
            return_url,
            cancel_url,
            description,
        } = &request.details
        else {
            return Err(GatewayError::Unsupported {
                gateway: PaymentMethod::RedirectCapture,
                capability: "non redirect-capture request",
            });
        };

        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": transaction_id.to_string(),
                "custom_id": request.customer_reference,
                "description": description.clone().unwrap_or_else(|| "Payment".to_string()),
                "amount": {
                    "currency_code": request.currency,
                    "value": request.amount.with_scale(2).to_string(),
                },
            }],
            "application_context": {
                "return_url": return_url,
                "cancel_url": cancel_url,
                "brand_name": self.config.brand_name,
                "user_action": "PAY_NOW",
            },
        });

        let url = self.url(ORDERS_PATH);
        let request_id = transaction_id.to_string();
        let response = send_with_token(&self.tokens, PaymentMethod::RedirectCapture, ORDERS_PATH, |token| {
            self.http
                .post(&url)
                .bearer_auth(token)
                .header("PayPal-Request-Id", &request_id)
                .json(&body)
        })
        .await?;
        let (status, body) = read_json(PaymentMethod::RedirectCapture, response).await?;

        if status.is_server_error() {
            return Err(GatewayError::unavailable(
                PaymentMethod::RedirectCapture,
                format!("status {}", status.as_u16()),
            ));
        }

        if !status.is_success() {
            return Err(GatewayError::Rejected {
                gateway: PaymentMethod::RedirectCapture,
                code: error_name(&body).unwrap_or("unknown").to_string(),
                message: str_field(&body, &["message", "error_description"])
                    .unwrap_or("order rejected")
                    .to_string(),
                raw: body,
            });
        }

        let (Some(order_id), Some(approval_url)) = (str_field(&body, &["id"]).map(str::to_string), approval_link(&body))
        else {
            return Err(GatewayError::protocol(
                PaymentMethod::RedirectCapture,
                "order response lacks an id or approval link",
                Some(body),
            ));
        };

        info!(tx_id = %transaction_id, order_id = %order_id, "Order created, awaiting approval");

        Ok(InitiateOutcome {
            gateway_transaction_id: Some(order_id),
            status: PaymentStatus::Pending,
            approval_url: Some(approval_url),
            customer_message: None,
            raw: body,
        })
    }

    async fn query(&self, gateway_ref: &str) -> GatewayResult<GatewayStatus> {
        let path = format!("{}/{}", ORDERS_PATH, gateway_ref);
        let url = self.url(&path);
        let response = send_with_token(&self.tokens, PaymentMethod::RedirectCapture, ORDERS_PATH, |token| {
            self.http.get(&url).bearer_auth(token)
        })
        .await?;
        let (status, body) = read_json(PaymentMethod::RedirectCapture, response).await?;

        if status.is_server_error() {
            return Err(GatewayError::unavailable(
                PaymentMethod::RedirectCapture,
                format!("status {}", status.as_u16()),
            ));
        }

        if !status.is_success() {
            return Err(GatewayError::protocol(
                PaymentMethod::RedirectCapture,
                format!("order lookup answered with status {}", status.as_u16()),
                Some(body),
            ));
        }

        let Some(order_status) = str_field(&body, &["status"]) else {
            return Err(GatewayError::protocol(
                PaymentMethod::RedirectCapture,
                "order has no status",
                Some(body),
            ));
        };

        Ok(GatewayStatus {
            status: status_from_order_status(order_status),
            receipt: capture_id(&body),
            description: Some(order_status.to_string()),
            raw: body,
        })
    }

    async fn capture(&self, gateway_ref: &str) -> GatewayResult<GatewayStatus> {
        let path = format!("{}/{}/capture", ORDERS_PATH, gateway_ref);
        let url = self.url(&path);
        let request_id = format!("capture-{}", gateway_ref);
        let response = send_with_token(&self.tokens, PaymentMethod::RedirectCapture, "/v2/checkout/orders/capture", |token| {
            self.http
                .post(&url)
                .bearer_auth(token)
                .header("PayPal-Request-Id", &request_id)
                .json(&json!({}))
        })
        .await?;
        let (status, body) = read_json(PaymentMethod::RedirectCapture, response).await?;

        if status.is_server_error() {
            return Err(GatewayError::unavailable(
                PaymentMethod::RedirectCapture,
                format!("status {}", status.as_u16()),
            ));
        }

        if status == StatusCode::UNPROCESSABLE_ENTITY && error_name(&body) == Some(ALREADY_CAPTURED) {
            info!(order_id = %gateway_ref, "Order already captured, reading its status");
            return self.query(gateway_ref).await;
        }

        if !status.is_success() {
            warn!(
                order_id = %gateway_ref,
                status = status.as_u16(),
                issue = error_name(&body).unwrap_or("unknown"),
                "Capture declined"
            );
            return Ok(GatewayStatus {
                status: PaymentStatus::Failed,
                receipt: None,
                description: error_name(&body).map(str::to_string),
                raw: body,
            });
        }

        let Some(order_status) = str_field(&body, &["status"]) else {
            return Err(GatewayError::protocol(
                PaymentMethod::RedirectCapture,
                "capture response has no status",
                Some(body),
            ));
        };

        let status = if order_status == "COMPLETED" {
            PaymentStatus::Completed
        } else {
            PaymentStatus::Failed
        };

        Ok(GatewayStatus {
            status,
            receipt: capture_id(&body),
            description: Some(order_status.to_string()),
            raw: body,
        })
    }
}
