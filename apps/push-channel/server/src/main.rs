use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::{signal, sync::oneshot};
use tracing::{info, warn};

mod push;
mod security;
mod session;
mod telemetry;
mod uidl;

use security::SecurityToken;
use session::SessionRegistry;

const RECYCLE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct ServerConfig {
    listen_addr: SocketAddr,
    disable_xsrf_protection: bool,
    shutdown_grace: Duration,
    session_idle_timeout: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "push-channel-server",
    author,
    version,
    about = "Session-scoped UIDL push server (WebSocket with streaming fallback)"
)]
struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "PUSH_CHANNEL_LISTEN_ADDR", default_value = "127.0.0.1:8090")]
    listen_addr: String,

    /// Stop issuing and checking the per-session security key (development only).
    #[arg(long, env = "PUSH_CHANNEL_DISABLE_XSRF_PROTECTION", default_value_t = false)]
    disable_xsrf_protection: bool,

    /// Grace period for open connections during shutdown.
    #[arg(long, env = "PUSH_CHANNEL_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,

    /// Sessions without connections are forgotten after this long.
    #[arg(long, env = "PUSH_CHANNEL_SESSION_IDLE_SECS", default_value_t = 1800)]
    session_idle_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        Ok(ServerConfig {
            listen_addr,
            disable_xsrf_protection: cli.disable_xsrf_protection,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            session_idle_timeout: Duration::from_secs(cli.session_idle_secs),
        })
    }
}

pub struct AppState {
    registry: SessionRegistry,
    token: SecurityToken,
    metrics: PrometheusHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let config = ServerConfig::try_from(Cli::parse())?;
    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let registry = SessionRegistry::new();
    let state = Arc::new(AppState {
        registry: registry.clone(),
        token: SecurityToken::new(!config.disable_xsrf_protection),
        metrics,
    });
    info!(
        listen_addr = %config.listen_addr,
        xsrf_protection = state.token.is_enabled(),
        "starting push-channel server"
    );

    let recycler = registry.spawn_recycler(RECYCLE_INTERVAL, config.session_idle_timeout);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("push-channel server listening on {}", config.listen_addr);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; draining connections"
    );
    let _ = stop_tx.send(());
    recycler.abort();

    match tokio::time::timeout(config.shutdown_grace, server).await {
        Ok(joined) => joined
            .context("server task failed")?
            .context("server shutdown with error")?,
        Err(_) => warn!("push connections still open after the grace period; exiting"),
    }
    info!("graceful shutdown complete");
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/push/runtime", get(runtime_handler))
        .route("/push", get(push::push_get).post(push::push_post))
        .with_state(state)
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Descriptor the client loads before it is allowed to connect.
async fn runtime_handler() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "transports": ["websocket", "streaming"],
        "trackMessageLength": true,
    }))
}
