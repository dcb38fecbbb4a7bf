use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use auction_engine::api;
use auction_engine::audit::AuditLog;
use auction_engine::config::{self, EnginePolicy};
use auction_engine::delinquency::DelinquencyMonitor;
use auction_engine::gateway::HttpGateway;
use auction_engine::service::AuctionService;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,auction_engine=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let policy = EnginePolicy::from_env();
    info!(
        "policy: deadline {}s, session TTL {}s, sweep every {}s, {} strikes",
        policy.payment_deadline_secs,
        policy.checkout_session_ttl_secs,
        policy.sweep_interval_secs,
        policy.max_failed_attempts
    );

    let gateway = Arc::new(HttpGateway::new(config::gateway_base_url()));
    let audit = Arc::new(
        AuditLog::new(Path::new(config::audit_dir())).context("failed to open audit log")?,
    );
    info!("audit trail: {}", audit.file_path().display());

    let service = Arc::new(AuctionService::new(&policy, gateway, Arc::clone(&audit)));

    let cancel = CancellationToken::new();
    let monitor = Arc::new(DelinquencyMonitor::new(
        Arc::clone(service.auction()),
        Arc::clone(service.reconciler()),
        audit,
        policy.sweep_interval_secs,
    ));
    let sweep_handle = tokio::spawn(DelinquencyMonitor::run(monitor, cancel.clone()));

    let bind: SocketAddr = config::api_bind()
        .parse()
        .context("invalid ENGINE_BIND address")?;
    let app = api::router(service);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    info!("listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // The sweep stops with the server so no transition lands mid-shutdown
    cancel.cancel();
    sweep_handle.await.ok();
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("ctrl-c received, shutting down");
    }
    cancel.cancel();
}
