//! Postgres-backed [`TransactionStore`]
//!
//! Conditional writes carry their precondition in the `WHERE` clause, so a
//! callback and a reconciler query racing on the same row cannot both win.
//! Each applied status change also lands in `payment_status_history` within
//! the same database transaction.

use crate::database::error::DatabaseError;
use crate::database::scoped::with_transaction;
use crate::ledger::{LedgerError, PaymentTransaction, TransactionFilter, TransactionStore};
use crate::middleware::logging::log_database_query;
use crate::payments::types::{PaymentMethod, PaymentStatus};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::debug;
use uuid::Uuid;

const COLUMNS: &str = "id, gateway_transaction_id, method, amount, currency, customer_reference, status, \
                       raw_payload, receipt, attempts, next_poll_at, flagged_for_review, review_reason, \
                       created_at, updated_at";

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    gateway_transaction_id: Option<String>,
    method: String,
    amount: BigDecimal,
    currency: String,
    customer_reference: String,
    status: String,
    raw_payload: Value,
    receipt: Option<String>,
    attempts: i32,
    next_poll_at: Option<DateTime<Utc>>,
    flagged_for_review: bool,
    review_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for PaymentTransaction {
    type Error = DatabaseError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let method = row
            .method
            .parse::<PaymentMethod>()
            .map_err(DatabaseError::Decode)?;
        let status = PaymentStatus::from_db_status(&row.status)
            .ok_or_else(|| DatabaseError::Decode(format!("unknown status {}", row.status)))?;

        Ok(PaymentTransaction {
            id: row.id,
            gateway_transaction_id: row.gateway_transaction_id,
            method,
            amount: row.amount,
            currency: row.currency.trim().to_string(),
            customer_reference: row.customer_reference,
            status,
            raw_payload: row.raw_payload,
            receipt: row.receipt,
            attempts: row.attempts,
            next_poll_at: row.next_poll_at,
            flagged_for_review: row.flagged_for_review,
            review_reason: row.review_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_transactions(rows: Vec<TransactionRow>) -> Result<Vec<PaymentTransaction>, LedgerError> {
    rows.into_iter()
        .map(|row| PaymentTransaction::try_from(row).map_err(LedgerError::from))
        .collect()
}

#[derive(Clone)]
pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(&self, clause: &str, value: impl ToString) -> Result<Option<PaymentTransaction>, LedgerError> {
        let sql = format!("SELECT {} FROM payment_transactions WHERE {}", COLUMNS, clause);
        let row = log_database_query(
            "fetch_transaction_where",
            sqlx::query_as::<_, TransactionRow>(&sql)
                .bind(value.to_string())
                .fetch_optional(&self.pool),
        )
        .await?;
        row.map(PaymentTransaction::try_from)
            .transpose()
            .map_err(LedgerError::from)
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn insert(&self, tx: &PaymentTransaction) -> Result<(), LedgerError> {
        log_database_query(
            "insert_transaction",
            sqlx::query(
                r#"
                INSERT INTO payment_transactions (
                    id, gateway_transaction_id, method, amount, currency, customer_reference,
                    status, raw_payload, receipt, attempts, next_poll_at, flagged_for_review,
                    review_reason, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
            )
            .bind(tx.id)
            .bind(&tx.gateway_transaction_id)
            .bind(tx.method.as_str())
            .bind(&tx.amount)
            .bind(&tx.currency)
            .bind(&tx.customer_reference)
            .bind(tx.status.as_str())
            .bind(&tx.raw_payload)
            .bind(&tx.receipt)
            .bind(tx.attempts)
            .bind(tx.next_poll_at)
            .bind(tx.flagged_for_review)
            .bind(&tx.review_reason)
            .bind(tx.created_at)
            .bind(tx.updated_at)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PaymentTransaction>, LedgerError> {
        let sql = format!("SELECT {} FROM payment_transactions WHERE id = $1", COLUMNS);
        let row = log_database_query(
            "get_transaction",
            sqlx::query_as::<_, TransactionRow>(&sql)
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.map(PaymentTransaction::try_from)
            .transpose()
            .map_err(LedgerError::from)
    }

    async fn find_by_gateway_id(&self, gateway_id: &str) -> Result<Option<PaymentTransaction>, LedgerError> {
        self.fetch_one_where("gateway_transaction_id = $1", gateway_id).await
    }

    async fn assign_gateway_id(
        &self,
        id: Uuid,
        gateway_id: &str,
        payload: &Value,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let result = log_database_query(
            "assign_gateway_id",
            sqlx::query(
                r#"
                UPDATE payment_transactions
                SET gateway_transaction_id = $1,
                    raw_payload = $2,
                    updated_at = $3
                WHERE id = $4 AND gateway_transaction_id IS NULL
                "#,
            )
            .bind(gateway_id)
            .bind(payload)
            .bind(at)
            .bind(id)
            .execute(&self.pool),
        )
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn transition(
        &self,
        id: Uuid,
        to: PaymentStatus,
        payload: &Value,
        receipt: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let payload = payload.clone();
        let receipt = receipt.map(str::to_string);

        let applied = with_transaction(&self.pool, move |conn| {
            Box::pin(async move {
                let updated = sqlx::query(
                    r#"
                    UPDATE payment_transactions
                    SET status = $1,
                        raw_payload = $2,
                        receipt = COALESCE($3, receipt),
                        next_poll_at = NULL,
                        updated_at = $4
                    WHERE id = $5 AND status = 'pending'
                    "#,
                )
                .bind(to.as_str())
                .bind(&payload)
                .bind(&receipt)
                .bind(at)
                .bind(id)
                .execute(&mut *conn)
                .await?
                .rows_affected();

                if updated == 0 {
                    return Ok(false);
                }

                sqlx::query(
                    r#"
                    INSERT INTO payment_status_history
                        (transaction_id, from_status, to_status, receipt, payload, changed_at)
                    VALUES ($1, 'pending', $2, $3, $4, $5)
                    "#,
                )
                .bind(id)
                .bind(to.as_str())
                .bind(&receipt)
                .bind(&payload)
                .bind(at)
                .execute(&mut *conn)
                .await?;

                Ok(true)
            })
        })
        .await?;

        debug!(tx_id = %id, status = %to, applied, "Conditional status transition");
        Ok(applied)
    }

    async fn record_attempt(
        &self,
        id: Uuid,
        next_poll_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        log_database_query(
            "record_attempt",
            sqlx::query(
                r#"
                UPDATE payment_transactions
                SET attempts = attempts + 1,
                    next_poll_at = $1,
                    updated_at = $2
                WHERE id = $3 AND status = 'pending'
                "#,
            )
            .bind(next_poll_at)
            .bind(at)
            .bind(id)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn flag_for_review(&self, id: Uuid, reason: &str, at: DateTime<Utc>) -> Result<(), LedgerError> {
        log_database_query(
            "flag_for_review",
            sqlx::query(
                r#"
                UPDATE payment_transactions
                SET flagged_for_review = TRUE,
                    review_reason = $1,
                    updated_at = $2
                WHERE id = $3
                "#,
            )
            .bind(reason)
            .bind(at)
            .bind(id)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn query(&self, filter: &TransactionFilter) -> Result<Vec<PaymentTransaction>, LedgerError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM payment_transactions WHERE TRUE", COLUMNS));

        if let Some(customer) = &filter.customer_reference {
            builder.push(" AND customer_reference = ").push_bind(customer.clone());
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(method) = filter.method {
            builder.push(" AND method = ").push_bind(method.as_str());
        }
        if let Some(from) = filter.created_from {
            builder.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = filter.created_to {
            builder.push(" AND created_at < ").push_bind(to);
        }
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.effective_limit());

        let rows = log_database_query(
            "query_transactions",
            builder.build_query_as::<TransactionRow>().fetch_all(&self.pool),
        )
        .await?;
        into_transactions(rows)
    }

    async fn due_for_reconciliation(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentTransaction>, LedgerError> {
        let sql = format!(
            r#"
            SELECT {} FROM payment_transactions
            WHERE status = 'pending'
            AND flagged_for_review = FALSE
            AND created_at <= $1
            AND (next_poll_at IS NULL OR next_poll_at <= $2)
            ORDER BY created_at ASC
            LIMIT $3
            "#,
            COLUMNS
        );
        let rows = log_database_query(
            "due_for_reconciliation",
            sqlx::query_as::<_, TransactionRow>(&sql)
                .bind(created_before)
                .bind(now)
                .bind(limit.max(0))
                .fetch_all(&self.pool),
        )
        .await?;
        into_transactions(rows)
    }
}
