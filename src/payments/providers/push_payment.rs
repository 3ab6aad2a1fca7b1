//! Mobile-money push payment adapter
//!
//! The customer's handset is prompted to authorize the payment. `initiate`
//! only gets a tracking reference back; completion arrives later through the
//! callback (see [`PushPaymentAdapter::parse_callback`]) or is discovered by
//! polling with `query`.

use super::{int_field, read_json, send_with_token, str_field};
use crate::clock::Clock;
use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::provider::{
    CallbackEvent, CallbackMetadata, GatewayAdapter, GatewayStatus, InitiateOutcome,
};
use crate::payments::token_cache::AccessTokenCache;
use crate::payments::types::{MethodDetails, PaymentMethod, PaymentRequest, PaymentStatus};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bigdecimal::BigDecimal;
use chrono::FixedOffset;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const INITIATE_PATH: &str = "/mpesa/stkpush/v1/processrequest";
const QUERY_PATH: &str = "/mpesa/stkpushquery/v1/query";
pub const TOKEN_PATH: &str = "/oauth/v1/generate";

/// Error code the query endpoint returns while the customer has not yet answered
const STILL_PROCESSING: &str = "500.001.1001";

/// Gateway timestamps are in East Africa Time
const GATEWAY_UTC_OFFSET_SECS: i32 = 3 * 3600;

#[derive(Debug, Clone, Deserialize)]
pub struct PushPaymentConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub short_code: String,
    pub pass_key: String,
    pub callback_url: String,
    #[serde(default = "default_transaction_type")]
    pub transaction_type: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_transaction_type() -> String {
    "CustomerPayBillOnline".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

pub struct PushPaymentAdapter {
    http: reqwest::Client,
    config: PushPaymentConfig,
    tokens: Arc<AccessTokenCache>,
    clock: Arc<dyn Clock>,
}

impl PushPaymentAdapter {
    pub fn new(
        http: reqwest::Client,
        config: PushPaymentConfig,
        tokens: Arc<AccessTokenCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http,
            config,
            tokens,
            clock,
        }
    }

    /// `(password, timestamp)`: the password is
    /// `base64(short_code + pass_key + timestamp)` and is only accepted by the
    /// gateway close to `timestamp`.
    pub fn signature(&self) -> (String, String) {
        let now = self.clock.now();
        let timestamp = match FixedOffset::east_opt(GATEWAY_UTC_OFFSET_SECS) {
            Some(offset) => now.with_timezone(&offset).format("%Y%m%d%H%M%S").to_string(),
            None => now.format("%Y%m%d%H%M%S").to_string(),
        };
        let password = BASE64.encode(format!(
            "{}{}{}",
            self.config.short_code, self.config.pass_key, timestamp
        ));
        (password, timestamp)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post_signed(&self, path: &str, body: &Value) -> GatewayResult<(reqwest::StatusCode, Value)> {
        let url = self.url(path);
        let response = send_with_token(&self.tokens, PaymentMethod::PushPayment, path, |token| {
            self.http.post(&url).bearer_auth(token).json(body)
        })
        .await?;
        read_json(PaymentMethod::PushPayment, response).await
    }
}

/// Map a query result code: `0` completed, `1` still pending, anything else failed.
pub fn status_from_result_code(code: i64) -> PaymentStatus {
    match code {
        0 => PaymentStatus::Completed,
        1 => PaymentStatus::Pending,
        _ => PaymentStatus::Failed,
    }
}

#[async_trait]
impl GatewayAdapter for PushPaymentAdapter {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::PushPayment
    }

    async fn initiate(&self, transaction_id: Uuid, request: &PaymentRequest) -> GatewayResult<InitiateOutcome> {
        let MethodDetails::PushPayment {
            phone_number,
            account_reference,
            description,
        } = &request.details
        else {
            return Err(GatewayError::Unsupported {
                gateway: PaymentMethod::PushPayment,
                capability: "non push-payment request",
            });
        };

        let (password, timestamp) = self.signature();
        let body = json!({
            "BusinessShortCode": self.config.short_code,
            "Password": password,
            "Timestamp": timestamp,
            "TransactionType": self.config.transaction_type,
            "Amount": request.amount.with_scale(0).to_string(),
            "PartyA": phone_number,
            "PartyB": self.config.short_code,
            "PhoneNumber": phone_number,
            "CallBackURL": self.config.callback_url,
            "AccountReference": account_reference,
            "TransactionDesc": description,
        });

        debug!(tx_id = %transaction_id, "Sending push payment request");
        let (status, body) = self.post_signed(INITIATE_PATH, &body).await?;

        if status.is_server_error() {
            return Err(GatewayError::unavailable(
                PaymentMethod::PushPayment,
                format!("status {}", status.as_u16()),
            ));
        }

        if !status.is_success() {
            return Err(GatewayError::Rejected {
                gateway: PaymentMethod::PushPayment,
                code: str_field(&body, &["errorCode"]).unwrap_or("unknown").to_string(),
                message: str_field(&body, &["errorMessage"])
                    .unwrap_or("request rejected")
                    .to_string(),
                raw: body,
            });
        }

        let Some(response_code) = int_field(&body, "ResponseCode") else {
            return Err(GatewayError::protocol(
                PaymentMethod::PushPayment,
                "initiate response has no ResponseCode",
                Some(body),
            ));
        };

        if response_code != 0 {
            return Err(GatewayError::Rejected {
                gateway: PaymentMethod::PushPayment,
                code: response_code.to_string(),
                message: str_field(&body, &["ResponseDescription"])
                    .unwrap_or("request rejected")
                    .to_string(),
                raw: body,
            });
        }

        let Some(checkout_id) = str_field(&body, &["CheckoutRequestID"]).map(str::to_string) else {
            return Err(GatewayError::protocol(
                PaymentMethod::PushPayment,
                "accepted initiate response has no CheckoutRequestID",
                Some(body),
            ));
        };

        Ok(InitiateOutcome {
            gateway_transaction_id: Some(checkout_id),
            status: PaymentStatus::Pending,
            approval_url: None,
            customer_message: str_field(&body, &["CustomerMessage"]).map(str::to_string),
            raw: body,
        })
    }

    async fn query(&self, gateway_ref: &str) -> GatewayResult<GatewayStatus> {
        let (password, timestamp) = self.signature();
        let request = json!({
            "BusinessShortCode": self.config.short_code,
            "Password": password,
            "Timestamp": timestamp,
            "CheckoutRequestID": gateway_ref,
        });

        let (status, body) = self.post_signed(QUERY_PATH, &request).await?;

        if str_field(&body, &["errorCode"]) == Some(STILL_PROCESSING) {
            return Ok(GatewayStatus {
                status: PaymentStatus::Pending,
                receipt: None,
                description: str_field(&body, &["errorMessage"]).map(str::to_string),
                raw: body,
            });
        }

        if status.is_server_error() {
            return Err(GatewayError::unavailable(
                PaymentMethod::PushPayment,
                format!("status {}", status.as_u16()),
            ));
        }

        if !status.is_success() {
            return Err(GatewayError::protocol(
                PaymentMethod::PushPayment,
                format!("query answered with status {}", status.as_u16()),
                Some(body),
            ));
        }

        let Some(result_code) = int_field(&body, "ResultCode") else {
            return Err(GatewayError::protocol(
                PaymentMethod::PushPayment,
                "query response has no ResultCode",
                Some(body),
            ));
        };

        Ok(GatewayStatus {
            status: status_from_result_code(result_code),
            receipt: None,
            description: str_field(&body, &["ResultDesc"]).map(str::to_string),
            raw: body,
        })
    }

    fn parse_callback(&self, payload: &Value) -> GatewayResult<CallbackEvent> {
        parse_push_callback(payload)
    }
}

/// Decode the nested `Body.stkCallback` envelope.
pub fn parse_push_callback(payload: &Value) -> GatewayResult<CallbackEvent> {
    let violation =
        |detail: &str| GatewayError::protocol(PaymentMethod::PushPayment, detail, Some(payload.clone()));

    let callback = payload
        .get("Body")
        .and_then(|b| b.get("stkCallback"))
        .filter(|c| c.is_object())
        .ok_or_else(|| violation("missing Body.stkCallback envelope"))?;

    let checkout_id = str_field(callback, &["CheckoutRequestID"])
        .ok_or_else(|| violation("missing CheckoutRequestID"))?;
    let result_code = int_field(callback, "ResultCode").ok_or_else(|| violation("missing ResultCode"))?;
    let description = str_field(callback, &["ResultDesc"]).unwrap_or_default().to_string();

    let metadata = match callback.get("CallbackMetadata") {
        None | Some(Value::Null) => CallbackMetadata::default(),
        Some(meta) => {
            let items = meta
                .get("Item")
                .and_then(Value::as_array)
                .ok_or_else(|| violation("CallbackMetadata.Item is not a list"))?;
            scan_metadata(items)
        }
    };

    let status = if result_code == 0 {
        if metadata.receipt.is_none() {
            return Err(violation("successful callback carries no receipt number"));
        }
        PaymentStatus::Completed
    } else {
        PaymentStatus::Failed
    };

    Ok(CallbackEvent {
        gateway_transaction_id: checkout_id.to_string(),
        status,
        result_code,
        description,
        metadata,
        raw: payload.clone(),
    })
}

/// Pick the recognized `{Name, Value}` items; unknown names are ignored.
fn scan_metadata(items: &[Value]) -> CallbackMetadata {
    let mut metadata = CallbackMetadata::default();
    for item in items {
        let Some(name) = item.get("Name").and_then(Value::as_str) else {
            warn!("Skipping callback metadata item without a name");
            continue;
        };
        let value = match item.get("Value") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        match name {
            "Amount" => metadata.amount = BigDecimal::from_str(&value).ok(),
            "MpesaReceiptNumber" => metadata.receipt = Some(value),
            "TransactionDate" => metadata.transaction_date = Some(value),
            "PhoneNumber" => metadata.phone_number = Some(value),
            _ => {}
        }
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success_callback() -> Value {
        json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            {"Name": "Amount", "Value": 500.00},
                            {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                            {"Name": "Balance"},
                            {"Name": "TransactionDate", "Value": 20191219102115u64},
                            {"Name": "PhoneNumber", "Value": 254708374149u64}
                        ]
                    }
                }
            }
        })
    }

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(status_from_result_code(0), PaymentStatus::Completed);
        assert_eq!(status_from_result_code(1), PaymentStatus::Pending);
        assert_eq!(status_from_result_code(1032), PaymentStatus::Failed);
        assert_eq!(status_from_result_code(-1), PaymentStatus::Failed);
    }

    #[test]
    fn test_successful_callback_extracts_metadata() {
        let event = parse_push_callback(&success_callback()).unwrap();

        assert_eq!(event.gateway_transaction_id, "ws_CO_191220191020363925");
        assert_eq!(event.status, PaymentStatus::Completed);
        assert_eq!(event.metadata.receipt.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(event.metadata.amount, Some(BigDecimal::from(500)));
        assert_eq!(event.metadata.transaction_date.as_deref(), Some("20191219102115"));
        assert_eq!(event.metadata.phone_number.as_deref(), Some("254708374149"));
    }

    #[test]
    fn test_cancelled_callback_fails_without_metadata() {
        let payload = json!({
            "Body": {"stkCallback": {
                "MerchantRequestID": "1",
                "CheckoutRequestID": "ws_CO_1",
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user"
            }}
        });
        let event = parse_push_callback(&payload).unwrap();
        assert_eq!(event.status, PaymentStatus::Failed);
        assert_eq!(event.metadata, CallbackMetadata::default());
    }

    #[test]
    fn test_malformed_envelopes_are_protocol_violations() {
        let cases = [
            json!({}),
            json!({"Body": {}}),
            json!({"Body": {"stkCallback": "nope"}}),
            json!({"Body": {"stkCallback": {"ResultCode": 0}}}),
            json!({"Body": {"stkCallback": {"CheckoutRequestID": "ws_CO_1"}}}),
            json!({"Body": {"stkCallback": {
                "CheckoutRequestID": "ws_CO_1", "ResultCode": 0,
                "CallbackMetadata": {"Item": {"Name": "Amount"}}
            }}}),
            json!({"Body": {"stkCallback": {"CheckoutRequestID": "ws_CO_1", "ResultCode": 0}}}),
        ];
        for payload in cases {
            assert!(
                matches!(parse_push_callback(&payload), Err(GatewayError::ProtocolViolation { .. })),
                "payload {payload}"
            );
        }
    }
}
