//! Gateway adapters and the HTTP plumbing they share

pub mod card;
pub mod push_payment;
pub mod redirect_capture;

pub use card::{CardGatewayConfig, SynchronousCardAdapter};
pub use push_payment::{PushPaymentAdapter, PushPaymentConfig};
pub use redirect_capture::{RedirectCaptureAdapter, RedirectCaptureConfig};

use crate::middleware::logging::log_external_call;
use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::token_cache::AccessTokenCache;
use crate::payments::types::PaymentMethod;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Upper bound applied to every configured gateway timeout
pub const MAX_GATEWAY_TIMEOUT_SECS: u64 = 120;

/// Build the HTTP client for one gateway with a bounded timeout.
pub fn http_client(timeout_secs: u64) -> reqwest::Result<reqwest::Client> {
    let timeout = Duration::from_secs(timeout_secs.clamp(1, MAX_GATEWAY_TIMEOUT_SECS));
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .build()
}

/// Send a bearer-authenticated request. A 401 invalidates the token and the
/// request is retried exactly once with a fresh one.
pub(crate) async fn send_with_token<F>(
    tokens: &AccessTokenCache,
    gateway: PaymentMethod,
    endpoint: &str,
    build: F,
) -> GatewayResult<reqwest::Response>
where
    F: Fn(&str) -> RequestBuilder,
{
    let mut retried = false;
    loop {
        let token = tokens
            .get(gateway.as_str())
            .await
            .map_err(|e| GatewayError::from_token(gateway, e))?;

        let response = log_external_call(gateway.as_str(), endpoint, build(&token.value).send())
            .await
            .map_err(|e| GatewayError::from_reqwest(gateway, e))?;

        if response.status() == StatusCode::UNAUTHORIZED && !retried {
            tokens.invalidate(gateway.as_str(), &token.value);
            retried = true;
            continue;
        }
        return Ok(response);
    }
}

/// Read a JSON body. An empty or non-JSON body is a protocol violation,
/// except on 5xx where the gateway is simply unavailable.
pub(crate) async fn read_json(
    gateway: PaymentMethod,
    response: reqwest::Response,
) -> GatewayResult<(StatusCode, Value)> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| GatewayError::from_reqwest(gateway, e))?;

    match serde_json::from_str::<Value>(&text) {
        Ok(body) => Ok((status, body)),
        Err(_) if status.is_server_error() => Err(GatewayError::unavailable(
            gateway,
            format!("status {}", status.as_u16()),
        )),
        Err(e) => Err(GatewayError::protocol(
            gateway,
            format!("status {} with non-JSON body: {}", status.as_u16(), e),
            Some(Value::String(text.chars().take(512).collect())),
        )),
    }
}

/// First string found at any of `keys`.
pub(crate) fn str_field<'a>(body: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| body.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

/// Integer that some gateways send as a number and others as a string.
pub(crate) fn int_field(body: &Value, key: &str) -> Option<i64> {
    match body.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
