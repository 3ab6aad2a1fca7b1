//! Status Reconciler Worker
//!
//! Backstop for lost callbacks and timed-out gateway calls. Every sweep picks
//! the transactions that are still pending after the grace period, asks their
//! gateway for the current status, and applies any terminal answer through
//! the ledger. Per-transaction backoff keeps the query rate bounded:
//! `next_poll_at = now + min(base * 2^attempts, max)`.
//!
//! A transaction whose initiate call timed out has no gateway reference. If
//! the gateway can search by the ledger id it was submitted with, the
//! reference is recovered and the result applied; otherwise it is flagged.
//!
//! Callbacks and sweeps may race on the same transaction. The ledger's
//! terminal-once update settles it; no locking happens here.

use crate::ledger::{LedgerError, PaymentTransaction, TransactionLedger};
use crate::logging::redact_json;
use crate::payments::error::GatewayError;
use crate::payments::provider::GatewayAdapter;
use crate::payments::registry::GatewayRegistry;
use crate::payments::types::PaymentStatus;
use crate::services::payment_service::record_gateway_failure;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// How often a sweep runs (seconds)
    pub poll_interval_secs: u64,
    /// Transactions younger than this are left to their callback (seconds)
    pub grace_period_secs: u64,
    /// Most transactions examined per sweep
    pub batch_size: i64,
    /// First backoff delay after an inconclusive query (seconds)
    pub base_backoff_secs: u64,
    /// Backoff ceiling (seconds)
    pub max_backoff_secs: u64,
    /// Queries before a transaction is handed to an operator
    pub max_attempts: i32,
    /// Pause between consecutive gateway queries within a sweep (milliseconds)
    pub min_query_spacing_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            grace_period_secs: 120,
            batch_size: 50,
            base_backoff_secs: 30,
            max_backoff_secs: 1800,
            max_attempts: 20,
            min_query_spacing_ms: 200,
        }
    }
}

impl ReconcilerConfig {
    /// Let `RECONCILER_*` variables override the loaded values.
    pub fn apply_env_overrides(mut self) -> Self {
        fn env_or<T: std::str::FromStr>(key: &str, current: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(current)
        }

        self.poll_interval_secs = env_or("RECONCILER_POLL_INTERVAL_SECS", self.poll_interval_secs);
        self.grace_period_secs = env_or("RECONCILER_GRACE_PERIOD_SECS", self.grace_period_secs);
        self.batch_size = env_or("RECONCILER_BATCH_SIZE", self.batch_size);
        self.base_backoff_secs = env_or("RECONCILER_BASE_BACKOFF_SECS", self.base_backoff_secs);
        self.max_backoff_secs = env_or("RECONCILER_MAX_BACKOFF_SECS", self.max_backoff_secs);
        self.max_attempts = env_or("RECONCILER_MAX_ATTEMPTS", self.max_attempts);
        self.min_query_spacing_ms = env_or("RECONCILER_MIN_QUERY_SPACING_MS", self.min_query_spacing_ms);
        self
    }

    /// Delay before the next query of a transaction queried `attempts` times.
    pub fn backoff_delay(&self, attempts: i32) -> Duration {
        let factor = 1u64.checked_shl(attempts.max(0) as u32).unwrap_or(u64::MAX);
        let secs = self
            .base_backoff_secs
            .saturating_mul(factor)
            .min(self.max_backoff_secs);
        Duration::from_secs(secs)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Counts for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_pending: usize,
    pub flagged: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Settled(PaymentStatus),
    StillPending,
    Flagged,
    Errored,
}

// ============================================================================
// Reconciler Worker
// ============================================================================

pub struct StatusReconciler {
    ledger: Arc<TransactionLedger>,
    gateways: Arc<GatewayRegistry>,
    config: ReconcilerConfig,
}

impl StatusReconciler {
    pub fn new(ledger: Arc<TransactionLedger>, gateways: Arc<GatewayRegistry>, config: ReconcilerConfig) -> Self {
        Self {
            ledger,
            gateways,
            config,
        }
    }

    /// Main worker loop, until `shutdown_rx` changes.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            grace_period_secs = self.config.grace_period_secs,
            "Status reconciler started"
        );

        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping status reconciler");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) if report.examined > 0 => info!(?report, "Reconciliation sweep finished"),
                        Ok(_) => debug!("Reconciliation sweep found nothing due"),
                        Err(e) => error!(error = %e, "Reconciliation sweep failed"),
                    }
                }
            }
        }

        info!("Status reconciler stopped");
    }

    /// Examine every transaction currently due.
    #[instrument(skip(self), fields(worker = "status_reconciler"))]
    pub async fn sweep(&self) -> Result<SweepReport, ReconcilerError> {
        let due = self
            .ledger
            .due_for_reconciliation(
                chrono::Duration::seconds(self.config.grace_period_secs as i64),
                self.config.batch_size,
            )
            .await?;

        let mut report = SweepReport::default();
        let spacing = Duration::from_millis(self.config.min_query_spacing_ms);

        for (i, tx) in due.iter().enumerate() {
            if i > 0 && !spacing.is_zero() {
                sleep(spacing).await;
            }
            report.examined += 1;

            let resolution = match self.reconcile(tx).await {
                Ok(resolution) => resolution,
                Err(e) => {
                    error!(tx_id = %tx.id, method = %tx.method, error = %e, "Failed to reconcile transaction");
                    Resolution::Errored
                }
            };
            match resolution {
                Resolution::Settled(PaymentStatus::Completed) => report.completed += 1,
                Resolution::Settled(PaymentStatus::Failed) => report.failed += 1,
                Resolution::Settled(PaymentStatus::Pending) | Resolution::StillPending => report.still_pending += 1,
                Resolution::Flagged => report.flagged += 1,
                Resolution::Errored => report.errors += 1,
            }
        }

        Ok(report)
    }

    async fn reconcile(&self, tx: &PaymentTransaction) -> Result<Resolution, LedgerError> {
        if tx.attempts >= self.config.max_attempts {
            self.ledger
                .flag_for_review(tx, "reconciliation attempts exhausted")
                .await?;
            return Ok(Resolution::Flagged);
        }

        let Some(gateway) = self.gateways.get(tx.method) else {
            warn!(tx_id = %tx.id, method = %tx.method, "No gateway configured for pending transaction");
            self.schedule_next(tx).await?;
            return Ok(Resolution::StillPending);
        };

        let Some(gateway_ref) = tx.gateway_transaction_id.as_deref() else {
            return self.resolve_by_reference(tx, gateway.as_ref()).await;
        };

        debug!(tx_id = %tx.id, gateway_ref = %gateway_ref, attempt = tx.attempts + 1, "Querying gateway");

        match gateway.query(gateway_ref).await {
            Ok(result) if result.status.is_terminal() => {
                let settled = self
                    .ledger
                    .apply_gateway_result(tx, result.status, redact_json(&result.raw), result.receipt.as_deref())
                    .await?;
                info!(tx_id = %tx.id, gateway_ref = %gateway_ref, status = %settled.status, "Reconciled pending transaction");
                Ok(Resolution::Settled(settled.status))
            }
            Ok(_) => {
                self.schedule_next(tx).await?;
                Ok(Resolution::StillPending)
            }
            Err(e) => self.query_failed(tx, e).await,
        }
    }

    /// A transaction whose initiate response never arrived has no gateway
    /// reference. Look it up by the ledger id it was sent with.
    async fn resolve_by_reference(
        &self,
        tx: &PaymentTransaction,
        gateway: &dyn GatewayAdapter,
    ) -> Result<Resolution, LedgerError> {
        debug!(tx_id = %tx.id, attempt = tx.attempts + 1, "Looking up gateway record by ledger reference");

        match gateway.find_by_reference(tx.id).await {
            Ok(Some(found)) => {
                let raw = redact_json(&found.status.raw);
                let tx = self
                    .ledger
                    .assign_gateway_id(tx.id, &found.gateway_transaction_id, &raw)
                    .await?;
                info!(tx_id = %tx.id, gateway_ref = %found.gateway_transaction_id, "Recovered gateway reference");

                if !found.status.status.is_terminal() {
                    self.schedule_next(&tx).await?;
                    return Ok(Resolution::StillPending);
                }
                let settled = self
                    .ledger
                    .apply_gateway_result(&tx, found.status.status, raw, found.status.receipt.as_deref())
                    .await?;
                info!(tx_id = %tx.id, status = %settled.status, "Reconciled pending transaction");
                Ok(Resolution::Settled(settled.status))
            }
            Ok(None) => {
                debug!(tx_id = %tx.id, "Gateway has no record for ledger reference yet");
                self.schedule_next(tx).await?;
                Ok(Resolution::StillPending)
            }
            Err(GatewayError::Unsupported { .. }) => {
                warn!(tx_id = %tx.id, method = %tx.method, "Pending transaction never received a gateway reference");
                self.ledger
                    .flag_for_review(tx, "no gateway reference after grace period")
                    .await?;
                Ok(Resolution::Flagged)
            }
            Err(e) => self.query_failed(tx, e).await,
        }
    }

    async fn query_failed(&self, tx: &PaymentTransaction, err: GatewayError) -> Result<Resolution, LedgerError> {
        let unreadable = matches!(err, GatewayError::ProtocolViolation { .. });
        let _ = record_gateway_failure(&self.ledger, tx, err).await;
        if unreadable {
            return Ok(Resolution::Flagged);
        }
        self.schedule_next(tx).await?;
        Ok(Resolution::Errored)
    }

    async fn schedule_next(&self, tx: &PaymentTransaction) -> Result<(), LedgerError> {
        let delay = self.config.backoff_delay(tx.attempts);
        let next_poll_at = self.ledger.clock().now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(self.config.max_backoff_secs as i64));
        self.ledger.record_attempt(tx.id, next_poll_at).await
    }
}
