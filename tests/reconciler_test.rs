//! Status reconciler sweeps against in-memory storage and fake gateways

mod common;

#[cfg(test)]
mod tests {
    use crate::common::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use payorch::clock::Clock;
    use payorch::ledger::{
        AuditKind, InMemoryTransactionStore, LedgerError, LedgerKey, PaymentTransaction, TransactionFilter,
        TransactionLedger, TransactionStore,
    };
    use payorch::payments::error::GatewayError;
    use payorch::payments::provider::ReferenceMatch;
    use payorch::payments::types::{PaymentMethod, PaymentStatus};
    use payorch::services::PaymentService;
    use payorch::workers::{ReconcilerConfig, StatusReconciler, SweepReport};
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;
    use uuid::Uuid;

    fn config() -> ReconcilerConfig {
        ReconcilerConfig {
            grace_period_secs: 120,
            base_backoff_secs: 30,
            max_backoff_secs: 600,
            max_attempts: 5,
            min_query_spacing_ms: 0,
            ..Default::default()
        }
    }

    fn reconciler(h: &Harness, config: ReconcilerConfig) -> StatusReconciler {
        StatusReconciler::new(h.ledger.clone(), h.gateways.clone(), config)
    }

    async fn push_tx(h: &Harness, reference: &str) -> PaymentTransaction {
        h.ledger.get(&LedgerKey::GatewayRef(reference.into())).await.unwrap()
    }

    #[tokio::test]
    async fn test_lost_callback_is_resolved_once() {
        let gateway = FakeGateway::new(PaymentMethod::PushPayment);
        let h = Harness::new(&[gateway.clone()]);
        let worker = reconciler(&h, config());
        h.service.process_payment("push_payment", &push_request()).await;

        // Still inside the grace period
        h.clock.advance(Duration::seconds(60));
        assert_eq!(worker.sweep().await.unwrap().examined, 0);
        assert_eq!(gateway.queries(), 0);

        gateway.on_query(|_| Ok(gateway_status(PaymentStatus::Completed)));
        h.clock.advance(Duration::seconds(120));
        let report = worker.sweep().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                examined: 1,
                completed: 1,
                ..Default::default()
            }
        );

        let tx = push_tx(&h, "ref-1").await;
        assert_eq!(tx.status, PaymentStatus::Completed);
        assert_eq!(tx.receipt.as_deref(), Some("RCPT123"));

        // The late callback and later sweeps change nothing
        h.service.ingest_callback(&push_callback("ref-1", 0, Some(500))).await;
        h.clock.advance(Duration::seconds(600));
        assert_eq!(worker.sweep().await.unwrap().examined, 0);
        assert_eq!(gateway.queries(), 1);
        assert_eq!(h.audit.count_of(AuditKind::StatusTransition).await, 1);
        assert_eq!(h.audit.count_of(AuditKind::ConflictingState).await, 0);
    }

    #[tokio::test]
    async fn test_inconclusive_queries_back_off() {
        let gateway = FakeGateway::new(PaymentMethod::PushPayment);
        let h = Harness::new(&[gateway.clone()]);
        let worker = reconciler(&h, config());
        h.service.process_payment("push_payment", &push_request()).await;
        h.clock.advance(Duration::seconds(150));

        assert_eq!(worker.sweep().await.unwrap().still_pending, 1);
        let tx = push_tx(&h, "ref-1").await;
        assert_eq!(tx.attempts, 1);
        assert_eq!(tx.next_poll_at, Some(h.ledger.clock().now() + Duration::seconds(30)));

        // Not due again until the backoff has elapsed
        assert_eq!(worker.sweep().await.unwrap().examined, 0);
        h.clock.advance(Duration::seconds(30));
        assert_eq!(worker.sweep().await.unwrap().still_pending, 1);

        let tx = push_tx(&h, "ref-1").await;
        assert_eq!(tx.attempts, 2);
        assert_eq!(tx.next_poll_at, Some(h.ledger.clock().now() + Duration::seconds(60)));
        assert_eq!(gateway.queries(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_are_flagged() {
        let gateway = FakeGateway::new(PaymentMethod::PushPayment);
        let h = Harness::new(&[gateway.clone()]);
        let worker = reconciler(
            &h,
            ReconcilerConfig {
                max_attempts: 2,
                ..config()
            },
        );
        h.service.process_payment("push_payment", &push_request()).await;

        h.clock.advance(Duration::seconds(150));
        worker.sweep().await.unwrap();
        h.clock.advance(Duration::seconds(30));
        worker.sweep().await.unwrap();
        h.clock.advance(Duration::seconds(60));
        let report = worker.sweep().await.unwrap();

        assert_eq!(report.flagged, 1);
        assert_eq!(gateway.queries(), 2);
        let tx = push_tx(&h, "ref-1").await;
        assert_eq!(tx.status, PaymentStatus::Pending);
        assert!(tx.flagged_for_review);
        assert_eq!(h.audit.count_of(AuditKind::ReviewFlagged).await, 1);

        h.clock.advance(Duration::seconds(3600));
        assert_eq!(worker.sweep().await.unwrap().examined, 0);
    }

    #[tokio::test]
    async fn test_transaction_without_gateway_reference_is_flagged() {
        let gateway = FakeGateway::new(PaymentMethod::PushPayment);
        gateway.on_initiate(|_| Err(GatewayError::unavailable(PaymentMethod::PushPayment, "timeout")));
        let h = Harness::new(&[gateway.clone()]);
        let worker = reconciler(&h, config());
        h.service.process_payment("push_payment", &push_request()).await;

        h.clock.advance(Duration::seconds(150));
        let report = worker.sweep().await.unwrap();

        assert_eq!(report.flagged, 1);
        assert_eq!(gateway.queries(), 0);
    }

    #[tokio::test]
    async fn test_card_charge_without_reference_is_found_by_ledger_id() {
        let gateway = FakeGateway::new(PaymentMethod::Card);
        gateway.on_initiate(|_| Err(GatewayError::unavailable(PaymentMethod::Card, "timeout")));
        gateway.on_lookup(|_| {
            Ok(Some(ReferenceMatch {
                gateway_transaction_id: "ch-late".into(),
                status: gateway_status(PaymentStatus::Completed),
            }))
        });
        let h = Harness::new(&[gateway.clone()]);
        let worker = reconciler(&h, config());
        h.service.process_payment("card", &card_request("123")).await;

        h.clock.advance(Duration::seconds(150));
        let report = worker.sweep().await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(report.flagged, 0);
        assert_eq!(gateway.lookups(), 1);
        assert_eq!(gateway.queries(), 0);
        let tx = push_tx(&h, "ch-late").await;
        assert_eq!(tx.status, PaymentStatus::Completed);
        assert!(!tx.flagged_for_review);
    }

    #[tokio::test]
    async fn test_card_charge_not_yet_visible_is_retried() {
        let gateway = FakeGateway::new(PaymentMethod::Card);
        gateway.on_initiate(|_| Err(GatewayError::unavailable(PaymentMethod::Card, "timeout")));
        gateway.on_lookup(|_| Ok(None));
        let h = Harness::new(&[gateway.clone()]);
        let worker = reconciler(&h, config());
        h.service.process_payment("card", &card_request("123")).await;

        h.clock.advance(Duration::seconds(150));
        assert_eq!(worker.sweep().await.unwrap().still_pending, 1);

        let pending = h.ledger.query(&TransactionFilter::default()).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].gateway_transaction_id.is_none());
        assert!(!pending[0].flagged_for_review);
    }

    /// Store whose attempt bookkeeping fails for one transaction.
    struct FailingAttempts {
        inner: Arc<InMemoryTransactionStore>,
        broken: Mutex<Option<Uuid>>,
    }

    #[async_trait]
    impl TransactionStore for FailingAttempts {
        async fn insert(&self, tx: &PaymentTransaction) -> Result<(), LedgerError> {
            self.inner.insert(tx).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<PaymentTransaction>, LedgerError> {
            self.inner.get(id).await
        }

        async fn find_by_gateway_id(&self, gateway_id: &str) -> Result<Option<PaymentTransaction>, LedgerError> {
            self.inner.find_by_gateway_id(gateway_id).await
        }

        async fn assign_gateway_id(
            &self,
            id: Uuid,
            gateway_id: &str,
            payload: &Value,
            at: DateTime<Utc>,
        ) -> Result<bool, LedgerError> {
            self.inner.assign_gateway_id(id, gateway_id, payload, at).await
        }

        async fn transition(
            &self,
            id: Uuid,
            to: PaymentStatus,
            payload: &Value,
            receipt: Option<&str>,
            at: DateTime<Utc>,
        ) -> Result<bool, LedgerError> {
            self.inner.transition(id, to, payload, receipt, at).await
        }

        async fn record_attempt(
            &self,
            id: Uuid,
            next_poll_at: DateTime<Utc>,
            at: DateTime<Utc>,
        ) -> Result<(), LedgerError> {
            if *self.broken.lock().unwrap() == Some(id) {
                return Err(LedgerError::Storage("connection reset".into()));
            }
            self.inner.record_attempt(id, next_poll_at, at).await
        }

        async fn flag_for_review(&self, id: Uuid, reason: &str, at: DateTime<Utc>) -> Result<(), LedgerError> {
            self.inner.flag_for_review(id, reason, at).await
        }

        async fn query(&self, filter: &TransactionFilter) -> Result<Vec<PaymentTransaction>, LedgerError> {
            self.inner.query(filter).await
        }

        async fn due_for_reconciliation(
            &self,
            created_before: DateTime<Utc>,
            now: DateTime<Utc>,
            limit: i64,
        ) -> Result<Vec<PaymentTransaction>, LedgerError> {
            self.inner.due_for_reconciliation(created_before, now, limit).await
        }
    }

    #[tokio::test]
    async fn test_storage_error_on_one_transaction_does_not_stop_the_sweep() {
        let gateway = FakeGateway::new(PaymentMethod::PushPayment);
        gateway.on_query(|reference| {
            let status = if reference == "ref-2" { PaymentStatus::Completed } else { PaymentStatus::Pending };
            Ok(gateway_status(status))
        });
        let h = Harness::new(&[gateway.clone()]);
        let store = Arc::new(FailingAttempts {
            inner: h.store.clone(),
            broken: Mutex::new(None),
        });
        let clock: Arc<dyn Clock> = Arc::new(h.clock.clone());
        let ledger = Arc::new(TransactionLedger::new(store.clone(), h.audit.clone(), clock));
        let service = PaymentService::new(h.gateways.clone(), ledger.clone());
        let worker = StatusReconciler::new(ledger.clone(), h.gateways.clone(), config());

        service.process_payment("push_payment", &push_request()).await;
        service.process_payment("push_payment", &push_request()).await;
        let first = ledger.get(&LedgerKey::GatewayRef("ref-1".into())).await.unwrap();
        *store.broken.lock().unwrap() = Some(first.id);

        h.clock.advance(Duration::seconds(150));
        let report = worker.sweep().await.unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(push_tx(&h, "ref-2").await.status, PaymentStatus::Completed);
        assert_eq!(push_tx(&h, "ref-1").await.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_query_errors_are_audited_and_retried_later() {
        let gateway = FakeGateway::new(PaymentMethod::PushPayment);
        gateway.on_query(|_| Err(GatewayError::unavailable(PaymentMethod::PushPayment, "status 503")));
        let h = Harness::new(&[gateway.clone()]);
        let worker = reconciler(&h, config());
        h.service.process_payment("push_payment", &push_request()).await;

        h.clock.advance(Duration::seconds(150));
        assert_eq!(worker.sweep().await.unwrap().errors, 1);
        assert_eq!(h.audit.count_of(AuditKind::GatewayUnavailable).await, 1);
        assert_eq!(push_tx(&h, "ref-1").await.attempts, 1);

        gateway.on_query(|_| Ok(gateway_status(PaymentStatus::Failed)));
        h.clock.advance(Duration::seconds(30));
        assert_eq!(worker.sweep().await.unwrap().failed, 1);
        assert_eq!(push_tx(&h, "ref-1").await.status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_unreadable_query_response_is_flagged() {
        let gateway = FakeGateway::new(PaymentMethod::RedirectCapture);
        gateway.on_query(|_| {
            Err(GatewayError::protocol(
                PaymentMethod::RedirectCapture,
                "order status missing",
                None,
            ))
        });
        let h = Harness::new(&[gateway.clone()]);
        let worker = reconciler(&h, config());
        h.service.process_payment("redirect_capture", &redirect_request()).await;

        h.clock.advance(Duration::seconds(150));
        assert_eq!(worker.sweep().await.unwrap().flagged, 1);
        assert!(push_tx(&h, "order-1").await.flagged_for_review);
        assert_eq!(h.audit.count_of(AuditKind::ProtocolViolation).await, 1);
    }

    #[tokio::test]
    async fn test_sweep_racing_a_callback_transitions_once() {
        let gateway = FakeGateway::new(PaymentMethod::PushPayment);
        gateway.on_query(|_| Ok(gateway_status(PaymentStatus::Completed)));
        let h = Harness::new(&[gateway.clone()]);
        let worker = reconciler(&h, config());
        h.service.process_payment("push_payment", &push_request()).await;
        h.clock.advance(Duration::seconds(150));

        let callback = push_callback("ref-1", 0, Some(500));
        let (report, ack) = tokio::join!(worker.sweep(), h.service.ingest_callback(&callback));
        report.unwrap();
        assert_eq!(ack.code, 200);

        assert_eq!(push_tx(&h, "ref-1").await.status, PaymentStatus::Completed);
        assert_eq!(h.audit.count_of(AuditKind::StatusTransition).await, 1);
        assert_eq!(h.audit.count_of(AuditKind::ConflictingState).await, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = Harness::new(&[FakeGateway::new(PaymentMethod::PushPayment)]);
        let worker = Arc::new(reconciler(
            &h,
            ReconcilerConfig {
                poll_interval_secs: 1,
                ..config()
            },
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = worker.clone();
        let handle = tokio::spawn(async move { running.run(shutdown_rx).await });

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("reconciler stops after shutdown")
            .unwrap();
    }
}
