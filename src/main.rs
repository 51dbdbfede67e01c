mod auth;
mod authority;
mod clock;
mod config;
mod health;
mod http;
mod ledger;
mod metrics;
mod resilience;
mod routes;
mod store;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::cache::{KeyDbVerdictStore, VerdictStore};
use crate::auth::context::ContextSigner;
use crate::auth::relay::{Relay, RelaySettings};
use crate::authority::http::HttpAuthority;
use crate::authority::CredentialAuthority;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::ledger::keydb::KeyDbRateLedger;
use crate::ledger::RateLedger;
use crate::metrics::MetricsRegistry;
use crate::routes::RouteTable;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "authrelay",
    about = "Authenticating, rate-limiting relay for the appointment platform"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/authrelay/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub relay: Arc<Relay>,
    pub routes: Arc<RouteTable>,
    pub authority: Arc<dyn CredentialAuthority>,
    /// Also used directly by the health check.
    pub verdicts: Arc<dyn VerdictStore>,
    pub signer: ContextSigner,
    pub metrics: MetricsRegistry,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        authority: Arc<dyn CredentialAuthority>,
        verdicts: Arc<dyn VerdictStore>,
        ledger: Arc<dyn RateLedger>,
        clock: Arc<dyn Clock>,
        signer: ContextSigner,
        http_client: reqwest::Client,
    ) -> Result<Self> {
        let routes = RouteTable::from_config(&config).context("failed to build route table")?;
        let metrics = MetricsRegistry::new();
        let relay = Relay::new(
            RelaySettings::from_config(&config),
            Arc::clone(&authority),
            Arc::clone(&verdicts),
            ledger,
            clock,
            Arc::clone(&metrics.metrics),
        );
        Ok(Self {
            config,
            relay: Arc::new(relay),
            routes: Arc::new(routes),
            authority,
            verdicts,
            signer,
            metrics,
            http_client,
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .proxy
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, routes = config.routes.len(), "starting authrelay");

    // ---- Infrastructure clients ----
    let keydb = store::redis::create_keydb_pool(&config.keydb).await?;

    let http_client = reqwest::Client::builder()
        .user_agent(concat!("authrelay/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_millis(config.authority.timeout_ms))
        .build()
        .context("failed to build reqwest client")?;

    let signer = ContextSigner::from_env(&config.identity_context.signing_key_env)?;

    // ---- Relay collaborators ----
    let authority: Arc<dyn CredentialAuthority> =
        Arc::new(HttpAuthority::new(&config.authority, http_client.clone()));
    let verdicts: Arc<dyn VerdictStore> = Arc::new(KeyDbVerdictStore::new(keydb.clone()));
    let ledger: Arc<dyn RateLedger> = Arc::new(KeyDbRateLedger::new(keydb));

    // ---- App state ----
    let state = AppState::new(
        Arc::clone(&config),
        authority,
        verdicts,
        ledger,
        Arc::new(SystemClock),
        signer,
        http_client,
    )?;
    tracing::info!(
        routes = state.routes.len(),
        policy = ?config.degraded.policy,
        "relay initialised"
    );

    run_http_server(state).await
}
