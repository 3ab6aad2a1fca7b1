use anyhow::Context;
use payorch::api;
use payorch::clock::{Clock, SystemClock};
use payorch::config::Settings;
use payorch::database::{self, PgAuditLog, PgTransactionStore};
use payorch::ledger::TransactionLedger;
use payorch::logging::init_tracing;
use payorch::payments::providers::{
    self, http_client, PushPaymentAdapter, RedirectCaptureAdapter, SynchronousCardAdapter,
};
use payorch::payments::{AccessTokenCache, ClientCredentialsSource, GatewayRegistry, GrantStyle, PaymentMethod};
use payorch::services::PaymentService;
use payorch::workers::StatusReconciler;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("Starting payment orchestration service");

    let settings = Settings::load().context("failed to load configuration")?;

    let pool = database::init_pool(&settings.database)
        .await
        .context("failed to connect to the database")?;
    database::run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // One token cache per process, shared by every adapter
    let tokens = Arc::new(AccessTokenCache::with_safety_margin(
        clock.clone(),
        settings.token_cache.safety_margin_ratio,
    ));

    let mut registry = GatewayRegistry::new();
    let mut longest_timeout = 0;

    if let Some(config) = settings.push_payment.clone() {
        let http = http_client(config.timeout_secs)?;
        tokens.register(
            PaymentMethod::PushPayment.as_str(),
            Arc::new(ClientCredentialsSource::new(
                http.clone(),
                format!("{}{}", config.base_url, providers::push_payment::TOKEN_PATH),
                config.consumer_key.clone(),
                config.consumer_secret.clone(),
                GrantStyle::Query,
            )),
        );
        longest_timeout = longest_timeout.max(config.timeout_secs);
        registry.register(Arc::new(PushPaymentAdapter::new(http, config, tokens.clone(), clock.clone())));
    }

    if let Some(config) = settings.redirect_capture.clone() {
        let http = http_client(config.timeout_secs)?;
        tokens.register(
            PaymentMethod::RedirectCapture.as_str(),
            Arc::new(ClientCredentialsSource::new(
                http.clone(),
                format!("{}{}", config.base_url, providers::redirect_capture::TOKEN_PATH),
                config.client_id.clone(),
                config.client_secret.clone(),
                GrantStyle::Form,
            )),
        );
        longest_timeout = longest_timeout.max(config.timeout_secs);
        registry.register(Arc::new(RedirectCaptureAdapter::new(http, config, tokens.clone())));
    }

    if let Some(config) = settings.card.clone() {
        let http = http_client(config.timeout_secs)?;
        longest_timeout = longest_timeout.max(config.timeout_secs);
        registry.register(Arc::new(SynchronousCardAdapter::new(http, config)));
    }

    let methods = registry.methods();
    if methods.is_empty() {
        warn!("No payment gateway is configured; every payment request will be refused");
    }
    info!(methods = ?methods, "Payment gateways configured");

    if settings.reconciler.grace_period_secs <= longest_timeout {
        warn!(
            grace_period_secs = settings.reconciler.grace_period_secs,
            gateway_timeout_secs = longest_timeout,
            "Reconciler grace period does not exceed the gateway timeout; in-flight initiations may be queried"
        );
    }

    let ledger = Arc::new(TransactionLedger::new(
        Arc::new(PgTransactionStore::new(pool.clone())),
        Arc::new(PgAuditLog::new(pool.clone())),
        clock.clone(),
    ));
    let registry = Arc::new(registry);
    let service = Arc::new(PaymentService::new(registry.clone(), ledger.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = StatusReconciler::new(ledger, registry, settings.reconciler.clone());
    let reconciler_handle = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

    let app = api::router(service);
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(address = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("HTTP server stopped, waiting for reconciler");
    let _ = shutdown_tx.send(true);
    reconciler_handle.await.context("reconciler task panicked")?;

    pool.close().await;
    info!("Payment orchestration service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
