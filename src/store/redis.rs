//! KeyDB / Redis client pool creation.
//!
//! The verdict cache and the rate ledger share one [`fred::clients::Pool`].
//! Every command sent through it carries the per-operation timeout from
//! [`crate::config::KeyDbConfig`].

use std::time::Duration;

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::ClientLike;
use fred::types::config::{ConnectionConfig, PerformanceConfig, ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::Builder;

use crate::config::KeyDbConfig;

/// Create and connect the shared KeyDB pool.
///
/// The auth token is read from the environment variable named by
/// `config.auth_token_env`.  Connectivity is verified with a PING before the
/// pool is handed out.
pub async fn create_keydb_pool(config: &KeyDbConfig) -> Result<Pool> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    let endpoint = strip_scheme(&config.endpoint);
    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(host, port),
        ..fred::types::config::Config::default()
    };
    if config.tls || config.endpoint.starts_with("rediss://") {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }
    if let Some(token) = auth_token {
        fred_config.password = Some(token);
    }

    let op_timeout = Duration::from_millis(config.op_timeout_ms);
    let mut builder = Builder::from_config(fred_config);
    builder
        .set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2))
        .set_performance_config(PerformanceConfig {
            default_command_timeout: op_timeout,
            ..PerformanceConfig::default()
        })
        .set_connection_config(ConnectionConfig {
            connection_timeout: op_timeout.max(Duration::from_secs(1)),
            ..ConnectionConfig::default()
        });

    let pool = builder
        .build_pool(config.pool_size.max(1))
        .context("failed to build KeyDB connection pool")?;
    pool.init().await.context("failed to connect to KeyDB")?;

    let _: String = pool
        .ping(None)
        .await
        .context("KeyDB PING failed after connect")?;

    tracing::info!(
        host,
        port,
        tls = config.tls,
        pool_size = config.pool_size,
        op_timeout_ms = config.op_timeout_ms,
        "KeyDB pool ready"
    );

    Ok(pool)
}

fn strip_scheme(endpoint: &str) -> &str {
    endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://")
}

/// Parse `host:port`, defaulting the port to 6379.  Trailing path segments
/// (e.g. a database index) are ignored.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);
    anyhow::ensure!(!endpoint.is_empty(), "empty KeyDB endpoint");

    match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
            Ok((host, port))
        }
        None => Ok((endpoint, 6379)),
    }
}
