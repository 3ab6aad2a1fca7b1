//! Access token cache
//!
//! One instance per process, shared by every adapter that needs a bearer
//! token. Tokens are cached per gateway key and refreshed single-flight:
//! while a refresh is in flight, every caller for that gateway awaits the
//! same shared future and observes the same result, success or error.

use crate::clock::Clock;
use crate::payments::error::TokenError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Fraction of a token's lifetime that is never used
pub const DEFAULT_SAFETY_MARGIN_RATIO: f64 = 0.1;

/// Longest token lifetime honoured; issuers claiming more are refreshed daily
pub const MAX_TOKEN_TTL_SECS: i64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub gateway: String,
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// A token as returned by the issuing endpoint.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_in: Duration,
}

/// Performs the credential exchange for one gateway.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<IssuedToken, TokenError>;
}

type RefreshFuture = Shared<BoxFuture<'static, Result<AccessToken, TokenError>>>;

struct Slot {
    source: Arc<dyn TokenSource>,
    token: Option<AccessToken>,
    inflight: Option<(u64, RefreshFuture)>,
    generation: u64,
}

pub struct AccessTokenCache {
    clock: Arc<dyn Clock>,
    safety_margin_ratio: f64,
    slots: Mutex<HashMap<String, Slot>>,
}

impl AccessTokenCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_safety_margin(clock, DEFAULT_SAFETY_MARGIN_RATIO)
    }

    pub fn with_safety_margin(clock: Arc<dyn Clock>, safety_margin_ratio: f64) -> Self {
        Self {
            clock,
            safety_margin_ratio: safety_margin_ratio.clamp(0.0, 0.9),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Register the token source for `gateway`, replacing any previous one.
    pub fn register(&self, gateway: impl Into<String>, source: Arc<dyn TokenSource>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(
            gateway.into(),
            Slot {
                source,
                token: None,
                inflight: None,
                generation: 0,
            },
        );
    }

    /// Return a valid token for `gateway`, refreshing it if absent or expired.
    pub async fn get(&self, gateway: &str) -> Result<AccessToken, TokenError> {
        let (generation, refresh) = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let slot = slots
                .get_mut(gateway)
                .ok_or_else(|| TokenError::UnknownGateway(gateway.to_string()))?;

            if let Some(token) = &slot.token {
                if token.is_valid_at(self.clock.now()) {
                    return Ok(token.clone());
                }
            }

            match slot.inflight.clone() {
                Some((generation, refresh)) => {
                    debug!(gateway = %gateway, "Joining in-flight token refresh");
                    (generation, refresh)
                }
                None => {
                    slot.generation += 1;
                    let refresh = self.refresh(gateway, slot.source.clone());
                    slot.inflight = Some((slot.generation, refresh.clone()));
                    (slot.generation, refresh)
                }
            }
        };

        let result = refresh.await;

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(gateway) {
            if matches!(slot.inflight, Some((g, _)) if g == generation) {
                slot.inflight = None;
                if let Ok(token) = &result {
                    slot.token = Some(token.clone());
                }
            }
        }

        result
    }

    /// Drop the cached token for `gateway` if it is still `token`. Used when
    /// the gateway rejects a token before its computed expiry.
    pub fn invalidate(&self, gateway: &str, token: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(gateway) {
            if slot.token.as_ref().is_some_and(|t| t.value == token) {
                warn!(gateway = %gateway, "Invalidating rejected access token");
                slot.token = None;
            }
        }
    }

    fn refresh(&self, gateway: &str, source: Arc<dyn TokenSource>) -> RefreshFuture {
        let clock = self.clock.clone();
        let ratio = self.safety_margin_ratio;
        let gateway = gateway.to_string();

        async move {
            let issued_at = clock.now();
            let issued = source.fetch().await?;

            let ttl_ms = issued
                .expires_in
                .num_milliseconds()
                .clamp(0, MAX_TOKEN_TTL_SECS * 1000);
            let margin_ms = (ttl_ms as f64 * ratio).round() as i64;
            let expires_at = Duration::try_milliseconds(ttl_ms - margin_ms)
                .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
                .ok_or_else(|| TokenError::Malformed(format!("token lifetime of {} ms is out of range", ttl_ms)))?;

            info!(
                gateway = %gateway,
                ttl_secs = ttl_ms / 1000,
                expires_at = %expires_at,
                "Access token refreshed"
            );

            Ok::<_, TokenError>(AccessToken {
                gateway,
                value: issued.access_token,
                expires_at,
            })
        }
        .boxed()
        .shared()
    }
}

/// How the client-credentials exchange is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantStyle {
    /// `GET <url>?grant_type=client_credentials` with basic auth
    Query,
    /// `POST <url>` with a `grant_type=client_credentials` form body and basic auth
    Form,
}

/// OAuth-style client-credentials token endpoint returning
/// `{access_token, expires_in}`.
pub struct ClientCredentialsSource {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    style: GrantStyle,
}

impl ClientCredentialsSource {
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        style: GrantStyle,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            style,
        }
    }
}

#[async_trait]
impl TokenSource for ClientCredentialsSource {
    async fn fetch(&self) -> Result<IssuedToken, TokenError> {
        let request = match self.style {
            GrantStyle::Query => self
                .http
                .get(format!("{}?grant_type=client_credentials", self.token_url)),
            GrantStyle::Form => self
                .http
                .post(&self.token_url)
                .form(&[("grant_type", "client_credentials")]),
        };

        let response = request
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .send()
            .await
            .map_err(|e| TokenError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TokenError::Unavailable(format!("status {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(TokenError::Rejected {
                status: status.as_u16(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TokenError::Malformed(e.to_string()))?;
        parse_token_response(&body)
    }
}

/// `expires_in` arrives as a number from some issuers and a string from others.
pub fn parse_token_response(body: &Value) -> Result<IssuedToken, TokenError> {
    let access_token = body
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| TokenError::Malformed("missing access_token".to_string()))?;

    let expires_in = match body.get("expires_in") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .filter(|secs| *secs >= 0)
    .ok_or_else(|| TokenError::Malformed("missing or invalid expires_in".to_string()))?;

    let expires_in = Duration::try_seconds(expires_in.min(MAX_TOKEN_TTL_SECS))
        .ok_or_else(|| TokenError::Malformed(format!("expires_in {} is out of range", expires_in)))?;

    Ok(IssuedToken {
        access_token: access_token.to_string(),
        expires_in,
    })
}
