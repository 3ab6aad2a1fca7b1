//! Append-only audit trail
//!
//! Every applied status transition, validation failure, protocol violation
//! and ledger conflict produces one [`AuditEntry`]. Entries are also emitted
//! as structured log lines at a level matching their severity.

use crate::ledger::LedgerError;
use crate::payments::types::PaymentMethod;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    StatusTransition,
    ValidationFailure,
    GatewayRejected,
    GatewayUnavailable,
    ProtocolViolation,
    ConflictingState,
    ReviewFlagged,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::StatusTransition => "status_transition",
            AuditKind::ValidationFailure => "validation_failure",
            AuditKind::GatewayRejected => "gateway_rejected",
            AuditKind::GatewayUnavailable => "gateway_unavailable",
            AuditKind::ProtocolViolation => "protocol_violation",
            AuditKind::ConflictingState => "conflicting_state",
            AuditKind::ReviewFlagged => "review_flagged",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        Some(match value {
            "status_transition" => AuditKind::StatusTransition,
            "validation_failure" => AuditKind::ValidationFailure,
            "gateway_rejected" => AuditKind::GatewayRejected,
            "gateway_unavailable" => AuditKind::GatewayUnavailable,
            "protocol_violation" => AuditKind::ProtocolViolation,
            "conflicting_state" => AuditKind::ConflictingState,
            "review_flagged" => AuditKind::ReviewFlagged,
            _ => return None,
        })
    }

    /// Operator alerts as opposed to normal lifecycle records
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            AuditKind::ProtocolViolation | AuditKind::ConflictingState | AuditKind::ReviewFlagged
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub kind: AuditKind,
    pub transaction_id: Option<Uuid>,
    pub gateway_transaction_id: Option<String>,
    pub method: Option<PaymentMethod>,
    pub detail: Value,
}

impl AuditEntry {
    pub fn new(kind: AuditKind, recorded_at: DateTime<Utc>, detail: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            recorded_at,
            kind,
            transaction_id: None,
            gateway_transaction_id: None,
            method: None,
            detail,
        }
    }

    pub fn for_transaction(mut self, transaction_id: Uuid) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn with_gateway_ref(mut self, gateway_ref: Option<&str>) -> Self {
        self.gateway_transaction_id = gateway_ref.map(str::to_string);
        self
    }

    pub fn with_method(mut self, method: PaymentMethod) -> Self {
        self.method = Some(method);
        self
    }

    /// Emit the entry as a log line.
    pub fn log(&self) {
        let tx_id = self.transaction_id.map(|id| id.to_string()).unwrap_or_default();
        let gateway_ref = self.gateway_transaction_id.as_deref().unwrap_or_default();
        let method = self.method.map(|m| m.as_str()).unwrap_or_default();

        match self.kind {
            AuditKind::ConflictingState => error!(
                audit = self.kind.as_str(),
                tx_id = %tx_id,
                gateway_ref = %gateway_ref,
                method = %method,
                detail = %self.detail,
                "Ledger conflict requires manual review"
            ),
            kind if kind.is_alert() => warn!(
                audit = kind.as_str(),
                tx_id = %tx_id,
                gateway_ref = %gateway_ref,
                method = %method,
                detail = %self.detail,
                "Payment audit alert"
            ),
            AuditKind::ValidationFailure | AuditKind::GatewayUnavailable | AuditKind::GatewayRejected => warn!(
                audit = self.kind.as_str(),
                tx_id = %tx_id,
                method = %method,
                detail = %self.detail,
                "Payment audit event"
            ),
            _ => info!(
                audit = self.kind.as_str(),
                tx_id = %tx_id,
                gateway_ref = %gateway_ref,
                method = %method,
                "Payment audit event"
            ),
        }
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), LedgerError>;

    async fn entries_for(&self, transaction_id: Uuid) -> Result<Vec<AuditEntry>, LedgerError>;
}

/// Audit log kept in process memory.
#[derive(Default, Clone)]
pub struct InMemoryAuditLog {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    pub async fn count_of(&self, kind: AuditKind) -> usize {
        self.entries.read().await.iter().filter(|e| e.kind == kind).count()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<(), LedgerError> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn entries_for(&self, transaction_id: Uuid) -> Result<Vec<AuditEntry>, LedgerError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.transaction_id == Some(transaction_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_db_round_trip() {
        for kind in [
            AuditKind::StatusTransition,
            AuditKind::ValidationFailure,
            AuditKind::GatewayRejected,
            AuditKind::GatewayUnavailable,
            AuditKind::ProtocolViolation,
            AuditKind::ConflictingState,
            AuditKind::ReviewFlagged,
        ] {
            assert_eq!(AuditKind::from_db(kind.as_str()), Some(kind));
        }
        assert_eq!(AuditKind::from_db("bogus"), None);
    }

    #[tokio::test]
    async fn test_entries_filtered_by_transaction() {
        let log = InMemoryAuditLog::new();
        let tx = Uuid::new_v4();
        let now = Utc::now();

        log.record(AuditEntry::new(AuditKind::StatusTransition, now, json!({})).for_transaction(tx))
            .await
            .unwrap();
        log.record(AuditEntry::new(AuditKind::ValidationFailure, now, json!({})))
            .await
            .unwrap();

        assert_eq!(log.entries_for(tx).await.unwrap().len(), 1);
        assert_eq!(log.count_of(AuditKind::ValidationFailure).await, 1);
        assert_eq!(log.entries().await.len(), 2);
    }
}
