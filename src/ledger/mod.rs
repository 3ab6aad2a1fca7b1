//! Transaction ledger
//!
//! The ledger owns every payment transaction and is the single idempotency
//! boundary of the engine. Callbacks, reconciler sweeps and synchronous
//! gateway results all go through [`TransactionLedger::update_status`],
//! which applies `pending -> completed|failed` at most once:
//!
//! - same terminal status again: no-op success
//! - different terminal status: rejected as [`LedgerError::ConflictingState`]
//!   and recorded for manual review
//!
//! No locks are taken. The store's conditional transition (`WHERE status =
//! 'pending'`) decides races between a callback and a reconciler query.

pub mod audit;
pub mod memory;

pub use audit::{AuditEntry, AuditKind, AuditLog, InMemoryAuditLog};
pub use memory::InMemoryTransactionStore;

use crate::clock::Clock;
use crate::payments::types::{PaymentMethod, PaymentRequest, PaymentStatus};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub gateway_transaction_id: Option<String>,
    pub method: PaymentMethod,
    pub amount: BigDecimal,
    pub currency: String,
    pub customer_reference: String,
    pub status: PaymentStatus,
    /// Latest gateway payload, redacted before storage
    pub raw_payload: Value,
    pub receipt: Option<String>,
    pub attempts: i32,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub flagged_for_review: bool,
    pub review_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentTransaction {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// How a caller identifies a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerKey {
    Id(Uuid),
    GatewayRef(String),
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerKey::Id(id) => write!(f, "{}", id),
            LedgerKey::GatewayRef(r) => write!(f, "gateway ref {}", r),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub customer_reference: Option<String>,
    pub status: Option<PaymentStatus>,
    pub method: Option<PaymentMethod>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl TransactionFilter {
    pub const DEFAULT_LIMIT: i64 = 100;

    pub fn matches(&self, tx: &PaymentTransaction) -> bool {
        self.customer_reference
            .as_ref()
            .is_none_or(|r| &tx.customer_reference == r)
            && self.status.is_none_or(|s| tx.status == s)
            && self.method.is_none_or(|m| tx.method == m)
            && self.created_from.is_none_or(|from| tx.created_at >= from)
            && self.created_to.is_none_or(|to| tx.created_at < to)
    }

    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, 1000)
    }
}

/// Result of a status update that did not fail.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// The transition was applied by this call
    Applied(PaymentTransaction),
    /// The transaction was already in the requested status; nothing changed
    AlreadyApplied(PaymentTransaction),
}

impl UpdateOutcome {
    pub fn into_transaction(self) -> PaymentTransaction {
        match self {
            UpdateOutcome::Applied(tx) | UpdateOutcome::AlreadyApplied(tx) => tx,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("transaction {0} not found")]
    NotFound(LedgerKey),

    #[error("transaction {id} is {current}, refusing transition to {requested}")]
    ConflictingState {
        id: Uuid,
        current: PaymentStatus,
        requested: PaymentStatus,
    },

    #[error("transaction {id} already carries gateway id {existing}")]
    GatewayIdAlreadyAssigned { id: Uuid, existing: String },

    #[error("ledger storage error: {0}")]
    Storage(String),
}

/// Persistence port for payment transactions.
///
/// `transition` and `assign_gateway_id` are conditional writes: they return
/// `false` instead of overwriting when their precondition no longer holds.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert(&self, tx: &PaymentTransaction) -> Result<(), LedgerError>;

    async fn get(&self, id: Uuid) -> Result<Option<PaymentTransaction>, LedgerError>;

    async fn find_by_gateway_id(&self, gateway_id: &str) -> Result<Option<PaymentTransaction>, LedgerError>;

    /// Set the gateway id if none is set yet.
    async fn assign_gateway_id(
        &self,
        id: Uuid,
        gateway_id: &str,
        payload: &Value,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// Move a pending transaction to `to`. No-op when it is no longer pending.
    async fn transition(
        &self,
        id: Uuid,
        to: PaymentStatus,
        payload: &Value,
        receipt: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    async fn record_attempt(
        &self,
        id: Uuid,
        next_poll_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    async fn flag_for_review(&self, id: Uuid, reason: &str, at: DateTime<Utc>) -> Result<(), LedgerError>;

    async fn query(&self, filter: &TransactionFilter) -> Result<Vec<PaymentTransaction>, LedgerError>;

    /// Pending, unflagged transactions created before `created_before` whose
    /// next poll time has come, oldest first.
    async fn due_for_reconciliation(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentTransaction>, LedgerError>;
}

pub struct TransactionLedger {
    store: Arc<dyn TransactionStore>,
    audit: Arc<dyn AuditLog>,
    clock: Arc<dyn Clock>,
}

impl TransactionLedger {
    pub fn new(store: Arc<dyn TransactionStore>, audit: Arc<dyn AuditLog>, clock: Arc<dyn Clock>) -> Self {
        Self { store, audit, clock }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Persist a new pending transaction for an accepted request.
    #[instrument(skip(self, request), fields(method = %request.method()))]
    pub async fn create(&self, request: &PaymentRequest) -> Result<PaymentTransaction, LedgerError> {
        let now = self.clock.now();
        let tx = PaymentTransaction {
            id: Uuid::new_v4(),
            gateway_transaction_id: None,
            method: request.method(),
            amount: request.amount.clone(),
            currency: request.currency.clone(),
            customer_reference: request.customer_reference.clone(),
            status: PaymentStatus::Pending,
            raw_payload: Value::Null,
            receipt: None,
            attempts: 0,
            next_poll_at: None,
            flagged_for_review: false,
            review_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&tx).await?;

        crate::log_payment!(
            event = "created",
            tx_id = tx.id,
            method = tx.method,
            amount = tx.amount,
            currency = tx.currency,
        );
        Ok(tx)
    }

    pub async fn get(&self, key: &LedgerKey) -> Result<PaymentTransaction, LedgerError> {
        let found = match key {
            LedgerKey::Id(id) => self.store.get(*id).await?,
            LedgerKey::GatewayRef(r) => self.store.find_by_gateway_id(r).await?,
        };
        found.ok_or_else(|| LedgerError::NotFound(key.clone()))
    }

    /// Resolve a caller-supplied reference: a gateway reference first, then a
    /// ledger id.
    pub async fn lookup(&self, reference: &str) -> Result<Option<PaymentTransaction>, LedgerError> {
        if let Some(tx) = self.store.find_by_gateway_id(reference).await? {
            return Ok(Some(tx));
        }
        match Uuid::parse_str(reference) {
            Ok(id) => self.store.get(id).await,
            Err(_) => Ok(None),
        }
    }

    /// Attach the gateway's reference. Assigning the same id again is a no-op;
    /// a different id is rejected.
    pub async fn assign_gateway_id(
        &self,
        id: Uuid,
        gateway_id: &str,
        payload: &Value,
    ) -> Result<PaymentTransaction, LedgerError> {
        let applied = self
            .store
            .assign_gateway_id(id, gateway_id, payload, self.clock.now())
            .await?;
        let tx = self.get(&LedgerKey::Id(id)).await?;

        match &tx.gateway_transaction_id {
            Some(existing) if existing == gateway_id => {
                if applied {
                    debug!(tx_id = %id, gateway_ref = %gateway_id, "Gateway reference assigned");
                }
                Ok(tx)
            }
            Some(existing) => Err(LedgerError::GatewayIdAlreadyAssigned {
                id,
                existing: existing.clone(),
            }),
            None => Err(LedgerError::Storage(format!("gateway id for {} was not stored", id))),
        }
    }

    /// Apply `pending -> status` at most once.
    #[instrument(skip(self, payload, receipt))]
    pub async fn update_status(
        &self,
        key: &LedgerKey,
        status: PaymentStatus,
        payload: Value,
        receipt: Option<&str>,
    ) -> Result<UpdateOutcome, LedgerError> {
        let current = self.get(key).await?;

        if current.status == status {
            debug!(tx_id = %current.id, status = %status, "Status already applied");
            return Ok(UpdateOutcome::AlreadyApplied(current));
        }
        if current.is_terminal() || !status.is_terminal() {
            return Err(self.conflict(&current, status, &payload).await);
        }

        let now = self.clock.now();
        if self.store.transition(current.id, status, &payload, receipt, now).await? {
            let tx = PaymentTransaction {
                status,
                raw_payload: payload,
                receipt: receipt.map(str::to_string).or(current.receipt.clone()),
                updated_at: now,
                ..current
            };

            self.audit(
                AuditEntry::new(
                    AuditKind::StatusTransition,
                    now,
                    json!({"from": PaymentStatus::Pending, "to": status, "receipt": tx.receipt}),
                )
                .for_transaction(tx.id)
                .with_gateway_ref(tx.gateway_transaction_id.as_deref())
                .with_method(tx.method),
            )
            .await;

            info!(
                tx_id = %tx.id,
                gateway_ref = tx.gateway_transaction_id.as_deref().unwrap_or_default(),
                method = %tx.method,
                status = %status,
                "Payment status updated"
            );
            return Ok(UpdateOutcome::Applied(tx));
        }

        // Another writer got there first
        let latest = self.get(&LedgerKey::Id(current.id)).await?;
        if latest.status == status {
            debug!(tx_id = %latest.id, status = %status, "Concurrent writer applied the same status");
            Ok(UpdateOutcome::AlreadyApplied(latest))
        } else {
            Err(self.conflict(&latest, status, &payload).await)
        }
    }

    async fn conflict(&self, current: &PaymentTransaction, requested: PaymentStatus, payload: &Value) -> LedgerError {
        self.audit(
            AuditEntry::new(
                AuditKind::ConflictingState,
                self.clock.now(),
                json!({"current": current.status, "requested": requested, "payload": payload}),
            )
            .for_transaction(current.id)
            .with_gateway_ref(current.gateway_transaction_id.as_deref())
            .with_method(current.method),
        )
        .await;

        LedgerError::ConflictingState {
            id: current.id,
            current: current.status,
            requested,
        }
    }

    /// Apply a status reported by a gateway query or capture and return the
    /// transaction as it now stands. A non-terminal report changes nothing; a
    /// conflict is already audited by `update_status` and the stored state
    /// wins.
    pub async fn apply_gateway_result(
        &self,
        tx: &PaymentTransaction,
        status: PaymentStatus,
        payload: Value,
        receipt: Option<&str>,
    ) -> Result<PaymentTransaction, LedgerError> {
        if !status.is_terminal() {
            return Ok(tx.clone());
        }
        match self.update_status(&LedgerKey::Id(tx.id), status, payload, receipt).await {
            Ok(outcome) => Ok(outcome.into_transaction()),
            Err(LedgerError::ConflictingState { .. }) => self.get(&LedgerKey::Id(tx.id)).await,
            Err(e) => Err(e),
        }
    }

    /// Count a reconciliation query and schedule the next one.
    pub async fn record_attempt(&self, id: Uuid, next_poll_at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.store.record_attempt(id, next_poll_at, self.clock.now()).await
    }

    /// Park a pending transaction for an operator. It stays pending and is no
    /// longer polled.
    pub async fn flag_for_review(&self, tx: &PaymentTransaction, reason: &str) -> Result<(), LedgerError> {
        let now = self.clock.now();
        self.store.flag_for_review(tx.id, reason, now).await?;
        self.audit(
            AuditEntry::new(AuditKind::ReviewFlagged, now, json!({"reason": reason}))
                .for_transaction(tx.id)
                .with_gateway_ref(tx.gateway_transaction_id.as_deref())
                .with_method(tx.method),
        )
        .await;
        Ok(())
    }

    pub async fn query(&self, filter: &TransactionFilter) -> Result<Vec<PaymentTransaction>, LedgerError> {
        self.store.query(filter).await
    }

    /// Pending transactions older than `grace` that are due for a poll.
    pub async fn due_for_reconciliation(
        &self,
        grace: chrono::Duration,
        limit: i64,
    ) -> Result<Vec<PaymentTransaction>, LedgerError> {
        let now = self.clock.now();
        self.store.due_for_reconciliation(now - grace, now, limit).await
    }

    /// Log and persist an audit entry. A failing audit sink never fails the
    /// operation that produced the entry.
    pub async fn audit(&self, entry: AuditEntry) {
        entry.log();
        let kind = entry.kind;
        if let Err(e) = self.audit.record(entry).await {
            error!(audit = kind.as_str(), error = %e, "Failed to persist audit entry");
        }
    }

    pub async fn audit_trail(&self, id: Uuid) -> Result<Vec<AuditEntry>, LedgerError> {
        self.audit.entries_for(id).await
    }
}
