use crate::ledger::{LedgerError, PaymentTransaction, TransactionFilter, TransactionStore};
use crate::payments::types::PaymentStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Transaction store kept in process memory.
///
/// Conditional writes happen under the write lock, so they have the same
/// compare-and-set semantics as the Postgres store's `WHERE` clauses.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    transactions: Arc<RwLock<HashMap<Uuid, PaymentTransaction>>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, tx: &PaymentTransaction) -> Result<(), LedgerError> {
        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(&tx.id) {
            return Err(LedgerError::Storage(format!("duplicate transaction id {}", tx.id)));
        }
        transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PaymentTransaction>, LedgerError> {
        Ok(self.transactions.read().await.get(&id).cloned())
    }

    async fn find_by_gateway_id(&self, gateway_id: &str) -> Result<Option<PaymentTransaction>, LedgerError> {
        Ok(self
            .transactions
            .read()
            .await
            .values()
            .find(|tx| tx.gateway_transaction_id.as_deref() == Some(gateway_id))
            .cloned())
    }

    async fn assign_gateway_id(
        &self,
        id: Uuid,
        gateway_id: &str,
        payload: &Value,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let mut transactions = self.transactions.write().await;
        let taken = transactions
            .values()
            .any(|tx| tx.id != id && tx.gateway_transaction_id.as_deref() == Some(gateway_id));
        if taken {
            return Err(LedgerError::Storage(format!(
                "gateway id {} already belongs to another transaction",
                gateway_id
            )));
        }

        match transactions.get_mut(&id) {
            Some(tx) if tx.gateway_transaction_id.is_none() => {
                tx.gateway_transaction_id = Some(gateway_id.to_string());
                tx.raw_payload = payload.clone();
                tx.updated_at = at;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn transition(
        &self,
        id: Uuid,
        to: PaymentStatus,
        payload: &Value,
        receipt: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let mut transactions = self.transactions.write().await;
        match transactions.get_mut(&id) {
            Some(tx) if tx.status == PaymentStatus::Pending => {
                tx.status = to;
                tx.raw_payload = payload.clone();
                if let Some(receipt) = receipt {
                    tx.receipt = Some(receipt.to_string());
                }
                tx.next_poll_at = None;
                tx.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_attempt(
        &self,
        id: Uuid,
        next_poll_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut transactions = self.transactions.write().await;
        if let Some(tx) = transactions.get_mut(&id) {
            tx.attempts += 1;
            tx.next_poll_at = Some(next_poll_at);
            tx.updated_at = at;
        }
        Ok(())
    }

    async fn flag_for_review(&self, id: Uuid, reason: &str, at: DateTime<Utc>) -> Result<(), LedgerError> {
        let mut transactions = self.transactions.write().await;
        if let Some(tx) = transactions.get_mut(&id) {
            tx.flagged_for_review = true;
            tx.review_reason = Some(reason.to_string());
            tx.updated_at = at;
        }
        Ok(())
    }

    async fn query(&self, filter: &TransactionFilter) -> Result<Vec<PaymentTransaction>, LedgerError> {
        let transactions = self.transactions.read().await;
        let mut found: Vec<PaymentTransaction> =
            transactions.values().filter(|tx| filter.matches(tx)).cloned().collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(filter.effective_limit() as usize);
        Ok(found)
    }

    async fn due_for_reconciliation(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentTransaction>, LedgerError> {
        let transactions = self.transactions.read().await;
        let mut due: Vec<PaymentTransaction> = transactions
            .values()
            .filter(|tx| {
                tx.status == PaymentStatus::Pending
                    && !tx.flagged_for_review
                    && tx.created_at <= created_before
                    && tx.next_poll_at.is_none_or(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }
}
