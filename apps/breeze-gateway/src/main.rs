//! Breeze Gateway Binary
//!
//! Starts the broker gateway HTTP service.
//!
//! The stream manager is built here so shutdown closes every feed socket and
//! `/health` reports open streams. Tick sinks are wired by whatever embeds the
//! library; this binary opens no streams of its own.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin breeze-gateway
//! ```
//!
//! # Environment Variables
//!
//! - `BREEZE_API_BASE_URL`: REST base URL (default: ICICI Direct production)
//! - `BREEZE_STREAM_URL`: tick feed URL (default: `wss://livestream.icicidirect.com/`)
//! - `BREEZE_GATEWAY_HTTP_PORT`: HTTP port (default: 8080)
//! - `BREEZE_RATE_LIMIT_MAX_CALLS` / `BREEZE_RATE_LIMIT_WINDOW_SECS`: per-user quota (100 / 60)
//! - `BREEZE_RETRY_MAX_ATTEMPTS` / `BREEZE_RETRY_BASE_DELAY_MS`: retry policy (3 / 1000)
//! - `BREEZE_CIRCUIT_FAILURE_THRESHOLD` / `BREEZE_CIRCUIT_COOLDOWN_SECS`: breaker (5 / 60)
//! - `BREEZE_SESSION_LOCK_MINUTES` / `BREEZE_MAX_AUTH_FAILURES`: lockout (30 / 3)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use breeze_gateway::application::ports::CredentialStore;
use breeze_gateway::infrastructure::http::{AppState, HttpServer};
use breeze_gateway::infrastructure::resilience::RateLimiter;
use breeze_gateway::infrastructure::telemetry;
use breeze_gateway::{
    BrokerGateway, GatewayConfig, InMemoryCredentialStore, LoginService, RealtimeStreamManager,
    SessionCache, SessionFsm, SessionRepository, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between rate-limit and cache pruning passes.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Another component may have installed a provider already.
    let _ = rustls::crypto::ring::default_provider().install_default();

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Breeze Gateway");

    // Initialize Prometheus metrics
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = GatewayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Session storage
    let store: Arc<dyn CredentialStore> = Arc::new(InMemoryCredentialStore::new());
    let cache = Arc::new(SessionCache::new(config.session.cache_ttl));
    let repo = SessionRepository::new(store, Arc::clone(&cache));

    // Services
    let fsm = Arc::new(SessionFsm::new(repo.clone(), config.fsm_config()));
    let gateway = Arc::new(BrokerGateway::from_config(&config, repo.clone())?);
    let login = Arc::new(LoginService::new(
        Arc::clone(&fsm),
        gateway.clone(),
        config.session.session_lifetime,
    ));
    let streams = RealtimeStreamManager::new(repo, config.stream_config(), shutdown_token.clone());

    // HTTP surface
    let state = Arc::new(
        AppState::new(env!("CARGO_PKG_VERSION"), fsm, gateway.clone())
            .with_login(login)
            .with_circuit_breaker(Arc::clone(gateway.circuit_breaker()))
            .with_stream_manager(streams.clone()),
    );
    let server = HttpServer::new(config.server.http_port, state, shutdown_token.clone());
    let server_handle = tokio::spawn(server.run());

    let maintenance_handle = tokio::spawn(run_maintenance(
        Arc::clone(gateway.rate_limiter()),
        cache,
        shutdown_token.clone(),
    ));

    await_shutdown(shutdown_token).await;

    streams.stop_all();

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "HTTP server failed"),
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server task panicked"),
        Err(_) => tracing::warn!("HTTP server did not stop within the shutdown timeout"),
    }
    let _ = maintenance_handle.await;

    tracing::info!("Breeze Gateway stopped");
    Ok(())
}

/// Prune expired rate-limit windows and cache entries until cancelled.
async fn run_maintenance(
    limiter: Arc<RateLimiter>,
    cache: Arc<SessionCache>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let windows = limiter.prune_expired();
                let sessions = cache.prune_expired();
                if windows + sessions > 0 {
                    tracing::debug!(windows, sessions, "Pruned expired entries");
                }
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        http_port = config.server.http_port,
        rate_limit = config.rate_limit.max_calls,
        retry_attempts = config.retry.max_attempts,
        breaker_threshold = config.circuit_breaker.failure_threshold,
        replay_subscriptions = config.stream.replay_subscriptions,
        "Configuration loaded"
    );
    tracing::debug!(
        api_base_url = %config.broker.api_base_url,
        stream_url = %config.broker.stream_url,
        "Broker endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
