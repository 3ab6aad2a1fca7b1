//! Synchronous card adapter
//!
//! The charge call answers with a final result, so `initiate` may return a
//! terminal status. Card data is forwarded once and never logged or kept.

use super::{read_json, str_field};
use crate::middleware::logging::log_external_call;
use crate::logging::mask_card_number;
use crate::payments::error::{GatewayError, GatewayResult, TokenError};
use crate::payments::provider::{GatewayAdapter, GatewayStatus, InitiateOutcome, ReferenceMatch};
use crate::payments::types::{MethodDetails, PaymentMethod, PaymentRequest, PaymentStatus};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::debug;
use uuid::Uuid;

const CHARGES_PATH: &str = "/v1/charges";

#[derive(Debug, Clone, Deserialize)]
pub struct CardGatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub signing_secret: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

pub struct SynchronousCardAdapter {
    http: reqwest::Client,
    config: CardGatewayConfig,
}

impl SynchronousCardAdapter {
    pub fn new(http: reqwest::Client, config: CardGatewayConfig) -> Self {
        Self { http, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

/// Hex HMAC-SHA256 of `body` keyed with `secret`, sent as `X-Signature`.
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String, TokenError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| TokenError::InvalidCredentials(format!("card signing secret: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Map a charge status. `None` for statuses this adapter does not know.
pub fn status_from_charge_status(status: &str) -> Option<PaymentStatus> {
    match status.to_ascii_lowercase().as_str() {
        "succeeded" | "approved" | "completed" => Some(PaymentStatus::Completed),
        "declined" | "failed" => Some(PaymentStatus::Failed),
        "pending" | "processing" => Some(PaymentStatus::Pending),
        _ => None,
    }
}

/// Strip the card block from a gateway echo before it is stored.
fn scrub(mut body: Value) -> Value {
    if let Some(obj) = body.as_object_mut() {
        obj.remove("card");
        obj.remove("source");
    }
    body
}

fn charge_status(body: &Value) -> GatewayResult<(PaymentStatus, Option<String>)> {
    let raw_status = str_field(body, &["status"]).ok_or_else(|| {
        GatewayError::protocol(PaymentMethod::Card, "charge has no status", Some(body.clone()))
    })?;
    let status = status_from_charge_status(raw_status).ok_or_else(|| {
        GatewayError::protocol(
            PaymentMethod::Card,
            format!("unknown charge status {}", raw_status),
            Some(body.clone()),
        )
    })?;
    let charge_id = str_field(body, &["id", "charge_id"]).map(str::to_string);
    Ok((status, charge_id))
}

#[async_trait]
impl GatewayAdapter for SynchronousCardAdapter {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Card
    }

    async fn initiate(&self, transaction_id: Uuid, request: &PaymentRequest) -> GatewayResult<InitiateOutcome> {
        let MethodDetails::Card {
            card_number,
            expiry_month,
            expiry_year,
            cvv,
            cardholder_name,
        } = &request.details
        else {
            return Err(GatewayError::Unsupported {
                gateway: PaymentMethod::Card,
                capability: "non card request",
            });
        };

        let payload = json!({
            "reference": transaction_id.to_string(),
            "amount": request.amount.to_string(),
            "currency": request.currency,
            "customer_reference": request.customer_reference,
            "card": {
                "number": card_number,
                "exp_month": expiry_month,
                "exp_year": expiry_year,
                "cvv": cvv,
                "holder_name": cardholder_name,
            },
        });
        let body = serde_json::to_vec(&payload).map_err(|e| {
            GatewayError::protocol(PaymentMethod::Card, format!("unencodable charge: {}", e), None)
        })?;
        let signature = sign_body(&self.config.signing_secret, &body).map_err(|source| GatewayError::Token {
            gateway: PaymentMethod::Card,
            source,
        })?;

        debug!(tx_id = %transaction_id, card = %mask_card_number(card_number), "Submitting card charge");
        let response = log_external_call(
            PaymentMethod::Card.as_str(),
            CHARGES_PATH,
            self.http
                .post(self.url(CHARGES_PATH))
                .bearer_auth(&self.config.api_key)
                .header("Idempotency-Key", transaction_id.to_string())
                .header("X-Signature", signature)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .send(),
        )
        .await
        .map_err(|e| GatewayError::from_reqwest(PaymentMethod::Card, e))?;

        let (status, body) = read_json(PaymentMethod::Card, response).await?;
        let body = scrub(body);

        if status.is_server_error() {
            return Err(GatewayError::unavailable(
                PaymentMethod::Card,
                format!("status {}", status.as_u16()),
            ));
        }

        if !status.is_success() {
            return Err(GatewayError::Rejected {
                gateway: PaymentMethod::Card,
                code: str_field(&body, &["code", "decline_code", "error"])
                    .unwrap_or("declined")
                    .to_string(),
                message: str_field(&body, &["message"]).unwrap_or("card declined").to_string(),
                raw: body,
            });
        }

        let (charge_status, charge_id) = charge_status(&body)?;
        if charge_id.is_none() {
            return Err(GatewayError::protocol(
                PaymentMethod::Card,
                "charge response has no id",
                Some(body),
            ));
        }

        Ok(InitiateOutcome {
            gateway_transaction_id: charge_id,
            status: charge_status,
            approval_url: None,
            customer_message: str_field(&body, &["message"]).map(str::to_string),
            raw: body,
        })
    }

    async fn query(&self, gateway_ref: &str) -> GatewayResult<GatewayStatus> {
        let response = log_external_call(
            PaymentMethod::Card.as_str(),
            CHARGES_PATH,
            self.http
                .get(self.url(&format!("{}/{}", CHARGES_PATH, gateway_ref)))
                .bearer_auth(&self.config.api_key)
                .send(),
        )
        .await
        .map_err(|e| GatewayError::from_reqwest(PaymentMethod::Card, e))?;

        let (status, body) = read_json(PaymentMethod::Card, response).await?;
        let body = scrub(body);

        if status.is_server_error() {
            return Err(GatewayError::unavailable(
                PaymentMethod::Card,
                format!("status {}", status.as_u16()),
            ));
        }
        if !status.is_success() {
            return Err(GatewayError::protocol(
                PaymentMethod::Card,
                format!("charge lookup answered with status {}", status.as_u16()),
                Some(body),
            ));
        }

        let (charge_status, charge_id) = charge_status(&body)?;
        Ok(GatewayStatus {
            status: charge_status,
            receipt: charge_id,
            description: str_field(&body, &["message"]).map(str::to_string),
            raw: body,
        })
    }

    async fn find_by_reference(&self, transaction_id: Uuid) -> GatewayResult<Option<ReferenceMatch>> {
        let reference = transaction_id.to_string();
        let response = log_external_call(
            PaymentMethod::Card.as_str(),
            CHARGES_PATH,
            self.http
                .get(format!("{}?reference={}", self.url(CHARGES_PATH), reference))
                .bearer_auth(&self.config.api_key)
                .send(),
        )
        .await
        .map_err(|e| GatewayError::from_reqwest(PaymentMethod::Card, e))?;

        let (status, body) = read_json(PaymentMethod::Card, response).await?;

        if status.is_server_error() {
            return Err(GatewayError::unavailable(
                PaymentMethod::Card,
                format!("status {}", status.as_u16()),
            ));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(GatewayError::protocol(
                PaymentMethod::Card,
                format!("charge search answered with status {}", status.as_u16()),
                Some(scrub(body)),
            ));
        }

        let charges = body.get("data").unwrap_or(&body).as_array().ok_or_else(|| {
            GatewayError::protocol(PaymentMethod::Card, "charge search has no data list", Some(scrub(body.clone())))
        })?;
        let Some(charge) = charges
            .iter()
            .find(|c| str_field(c, &["reference"]) == Some(reference.as_str()))
        else {
            return Ok(None);
        };

        let charge = scrub(charge.clone());
        let (charge_status, charge_id) = charge_status(&charge)?;
        let Some(charge_id) = charge_id else {
            return Err(GatewayError::protocol(
                PaymentMethod::Card,
                "charge search result has no id",
                Some(charge),
            ));
        };

        Ok(Some(ReferenceMatch {
            gateway_transaction_id: charge_id.clone(),
            status: GatewayStatus {
                status: charge_status,
                receipt: Some(charge_id),
                description: str_field(&charge, &["message"]).map(str::to_string),
                raw: charge,
            },
        }))
    }
}
