use crate::database::error::DatabaseError;
use crate::ledger::{AuditEntry, AuditKind, AuditLog, LedgerError};
use crate::payments::types::PaymentMethod;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, FromRow)]
struct AuditRow {
    id: Uuid,
    recorded_at: DateTime<Utc>,
    kind: String,
    transaction_id: Option<Uuid>,
    gateway_transaction_id: Option<String>,
    method: Option<String>,
    detail: Value,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = DatabaseError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let kind = AuditKind::from_db(&row.kind)
            .ok_or_else(|| DatabaseError::Decode(format!("unknown audit kind {}", row.kind)))?;
        let method = row
            .method
            .map(|m| m.parse::<PaymentMethod>())
            .transpose()
            .map_err(DatabaseError::Decode)?;

        Ok(AuditEntry {
            id: row.id,
            recorded_at: row.recorded_at,
            kind,
            transaction_id: row.transaction_id,
            gateway_transaction_id: row.gateway_transaction_id,
            method,
            detail: row.detail,
        })
    }
}

/// Append-only `payment_audit_log` table.
#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO payment_audit_log
                (id, recorded_at, kind, transaction_id, gateway_transaction_id, method, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.recorded_at)
        .bind(entry.kind.as_str())
        .bind(entry.transaction_id)
        .bind(&entry.gateway_transaction_id)
        .bind(entry.method.map(|m| m.as_str()))
        .bind(&entry.detail)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn entries_for(&self, transaction_id: Uuid) -> Result<Vec<AuditEntry>, LedgerError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, recorded_at, kind, transaction_id, gateway_transaction_id, method, detail
            FROM payment_audit_log
            WHERE transaction_id = $1
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| AuditEntry::try_from(row).map_err(LedgerError::from))
            .collect()
    }
}
