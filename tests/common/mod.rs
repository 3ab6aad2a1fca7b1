//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use payorch::clock::{Clock, ManualClock};
use payorch::ledger::{InMemoryAuditLog, InMemoryTransactionStore, TransactionLedger};
use payorch::payments::error::{GatewayError, GatewayResult, TokenError};
use payorch::payments::provider::{CallbackEvent, GatewayAdapter, GatewayStatus, InitiateOutcome, ReferenceMatch};
use payorch::payments::providers::push_payment::parse_push_callback;
use payorch::payments::registry::GatewayRegistry;
use payorch::payments::token_cache::{IssuedToken, TokenSource};
use payorch::payments::types::{PaymentMethod, PaymentRequest, PaymentStatus};
use payorch::services::PaymentService;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

// ============================================================================
// Fake gateway
// ============================================================================

type InitiateFn = Box<dyn Fn(Uuid) -> GatewayResult<InitiateOutcome> + Send + Sync>;
type StatusFn = Box<dyn Fn(&str) -> GatewayResult<GatewayStatus> + Send + Sync>;
type LookupFn = Box<dyn Fn(Uuid) -> GatewayResult<Option<ReferenceMatch>> + Send + Sync>;

/// Scriptable adapter that counts every call it receives.
pub struct FakeGateway {
    method: PaymentMethod,
    on_initiate: Mutex<InitiateFn>,
    on_query: Mutex<StatusFn>,
    on_capture: Mutex<StatusFn>,
    on_lookup: Mutex<LookupFn>,
    hold: Mutex<Option<Arc<Notify>>>,
    pub initiate_calls: AtomicUsize,
    pub query_calls: AtomicUsize,
    pub capture_calls: AtomicUsize,
    pub lookup_calls: AtomicUsize,
}

impl FakeGateway {
    /// Accepts every initiation and reports it pending on every query.
    /// Reference lookups are unsupported until scripted.
    /// Gateway references are `ref-<n>` for push payments, `order-<n>` for
    /// redirect orders and `ch-<n>` for card charges.
    pub fn new(method: PaymentMethod) -> Arc<Self> {
        let counter = Arc::new(AtomicUsize::new(0));
        let synchronous = method == PaymentMethod::Card;
        let prefix = match method {
            PaymentMethod::PushPayment => "ref",
            PaymentMethod::RedirectCapture => "order",
            PaymentMethod::Card => "ch",
        };
        Arc::new(Self {
            method,
            on_initiate: Mutex::new(Box::new(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let reference = format!("{prefix}-{n}");
                Ok(InitiateOutcome {
                    gateway_transaction_id: Some(reference.clone()),
                    status: if synchronous { PaymentStatus::Completed } else { PaymentStatus::Pending },
                    approval_url: (method == PaymentMethod::RedirectCapture)
                        .then(|| format!("https://pay.example.com/approve/{reference}")),
                    customer_message: None,
                    raw: json!({"reference": reference}),
                })
            })),
            on_query: Mutex::new(Box::new(|_| Ok(gateway_status(PaymentStatus::Pending)))),
            on_capture: Mutex::new(Box::new(|_| Ok(gateway_status(PaymentStatus::Completed)))),
            on_lookup: Mutex::new(Box::new(move |_| {
                Err(GatewayError::Unsupported {
                    gateway: method,
                    capability: "reference lookup",
                })
            })),
            hold: Mutex::new(None),
            initiate_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            capture_calls: AtomicUsize::new(0),
            lookup_calls: AtomicUsize::new(0),
        })
    }

    pub fn on_initiate(&self, f: impl Fn(Uuid) -> GatewayResult<InitiateOutcome> + Send + Sync + 'static) {
        *self.on_initiate.lock().unwrap() = Box::new(f);
    }

    pub fn on_query(&self, f: impl Fn(&str) -> GatewayResult<GatewayStatus> + Send + Sync + 'static) {
        *self.on_query.lock().unwrap() = Box::new(f);
    }

    pub fn on_capture(&self, f: impl Fn(&str) -> GatewayResult<GatewayStatus> + Send + Sync + 'static) {
        *self.on_capture.lock().unwrap() = Box::new(f);
    }

    pub fn on_lookup(&self, f: impl Fn(Uuid) -> GatewayResult<Option<ReferenceMatch>> + Send + Sync + 'static) {
        *self.on_lookup.lock().unwrap() = Box::new(f);
    }

    /// Park every later initiation after it is counted until the returned
    /// handle is notified.
    pub fn hold_initiations(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.hold.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn initiations(&self) -> usize {
        self.initiate_calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> usize {
        self.capture_calls.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayAdapter for FakeGateway {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    async fn initiate(&self, transaction_id: Uuid, _request: &PaymentRequest) -> GatewayResult<InitiateOutcome> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.hold.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        (self.on_initiate.lock().unwrap())(transaction_id)
    }

    async fn query(&self, gateway_ref: &str) -> GatewayResult<GatewayStatus> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        (self.on_query.lock().unwrap())(gateway_ref)
    }

    async fn capture(&self, gateway_ref: &str) -> GatewayResult<GatewayStatus> {
        if self.method != PaymentMethod::RedirectCapture {
            return Err(GatewayError::Unsupported {
                gateway: self.method,
                capability: "capture",
            });
        }
        self.capture_calls.fetch_add(1, Ordering::SeqCst);
        (self.on_capture.lock().unwrap())(gateway_ref)
    }

    async fn find_by_reference(&self, transaction_id: Uuid) -> GatewayResult<Option<ReferenceMatch>> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        (self.on_lookup.lock().unwrap())(transaction_id)
    }

    fn parse_callback(&self, payload: &Value) -> GatewayResult<CallbackEvent> {
        match self.method {
            PaymentMethod::PushPayment => parse_push_callback(payload),
            _ => Err(GatewayError::Unsupported {
                gateway: self.method,
                capability: "callback",
            }),
        }
    }
}

pub fn gateway_status(status: PaymentStatus) -> GatewayStatus {
    let receipt = (status == PaymentStatus::Completed).then(|| "RCPT123".to_string());
    GatewayStatus {
        status,
        receipt,
        description: None,
        raw: json!({"status": status.as_str()}),
    }
}

// ============================================================================
// Fake token source
// ============================================================================

/// Token source that counts fetches and can be slowed down or made to fail.
pub struct FakeTokenSource {
    pub calls: AtomicUsize,
    pub ttl: Duration,
    pub delay: std::time::Duration,
    pub fail: bool,
}

impl FakeTokenSource {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            ttl,
            delay: std::time::Duration::ZERO,
            fail: false,
        })
    }

    pub fn slow(ttl: Duration, delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            ttl,
            delay,
            fail: false,
        })
    }

    pub fn failing(delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            ttl: Duration::seconds(3600),
            delay,
            fail: true,
        })
    }

    pub fn fetches(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for FakeTokenSource {
    async fn fetch(&self) -> Result<IssuedToken, TokenError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(TokenError::Rejected { status: 400 });
        }
        Ok(IssuedToken {
            access_token: format!("token-{n}"),
            expires_in: self.ttl,
        })
    }
}

// ============================================================================
// Service harness
// ============================================================================

pub struct Harness {
    pub clock: ManualClock,
    pub store: Arc<InMemoryTransactionStore>,
    pub audit: Arc<InMemoryAuditLog>,
    pub ledger: Arc<TransactionLedger>,
    pub gateways: Arc<GatewayRegistry>,
    pub service: Arc<PaymentService>,
}

impl Harness {
    pub fn new(adapters: &[Arc<FakeGateway>]) -> Self {
        let clock = ManualClock::new(start_time());
        let store = Arc::new(InMemoryTransactionStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let clock_port: Arc<dyn Clock> = Arc::new(clock.clone());
        let ledger = Arc::new(TransactionLedger::new(store.clone(), audit.clone(), clock_port));

        let mut registry = GatewayRegistry::new();
        for adapter in adapters {
            registry.register(adapter.clone());
        }
        let gateways = Arc::new(registry);
        let service = Arc::new(PaymentService::new(gateways.clone(), ledger.clone()));

        Self {
            clock,
            store,
            audit,
            ledger,
            gateways,
            service,
        }
    }
}

// ============================================================================
// Request and callback bodies
// ============================================================================

pub fn push_request() -> Value {
    json!({
        "amount": 500,
        "phone_number": "0712345678",
        "customer_reference": "CUST-1001",
        "description": "Order 1001"
    })
}

pub fn redirect_request() -> Value {
    json!({
        "amount": "25.50",
        "currency": "USD",
        "customer_reference": "CUST-2001",
        "return_url": "https://shop.example.com/return",
        "cancel_url": "https://shop.example.com/cancel"
    })
}

pub fn card_request(cvv: &str) -> Value {
    json!({
        "amount": "49.99",
        "customer_reference": "CUST-3001",
        "card_number": "4111 1111 1111 1111",
        "expiry_month": 12,
        "expiry_year": 2030,
        "cvv": cvv
    })
}

pub fn push_callback(checkout_id: &str, result_code: i64, amount: Option<i64>) -> Value {
    let mut callback = json!({
        "MerchantRequestID": "29115-34620561-1",
        "CheckoutRequestID": checkout_id,
        "ResultCode": result_code,
        "ResultDesc": if result_code == 0 {
            "The service request is processed successfully."
        } else {
            "Request cancelled by user"
        },
    });
    if let Some(amount) = amount {
        callback["CallbackMetadata"] = json!({
            "Item": [
                {"Name": "Amount", "Value": amount},
                {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                {"Name": "TransactionDate", "Value": 20260302091502i64},
                {"Name": "PhoneNumber", "Value": 254712345678i64}
            ]
        });
    }
    json!({ "Body": { "stkCallback": callback } })
}
