//! Readthrough proxy - caching reverse proxy for idempotent reads
//!
//! Serves GET requests from an on-disk cache, fetching each resource from
//! the upstream at most once while concurrent clients stream the in-flight
//! body. Other requests pass straight through to the upstream.

mod config;
mod error;
mod server;

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::server::{start_server, ServerState, SharedState};
use readthrough_cache::{Cache, CacheConfig, HttpUpstream};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("readthrough_proxy=info".parse()?)
        .add_directive("readthrough_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting readthrough proxy...");

    // Load configuration from environment
    let config = Config::from_env()?;
    info!("Port: {}", config.port);
    info!("Upstream: {}", config.upstream_url);
    info!("Cache dir: {:?}", config.cache_dir);
    info!("Journal file: {:?}", config.journal_file);
    info!("Expiration: {} seconds", config.expiration_secs);
    info!("Sweep interval: {} seconds", config.sweep_interval_secs);

    // Fail fast when the upstream is unreachable.
    let client = reqwest::Client::new();
    client.get(&config.upstream_url).send().await.map_err(|e| {
        ProxyError::Config(format!(
            "failed to connect to upstream {}: {}",
            config.upstream_url, e
        ))
    })?;

    let cache = Cache::new(
        CacheConfig {
            journal_path: config.journal_file.clone(),
            cache_dir: config.cache_dir.clone(),
            upstream_url: config.upstream_url.clone(),
            expiration: Duration::from_secs(config.expiration_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        },
        HttpUpstream::with_client(client.clone()),
    )
    .await?;

    let state: SharedState = Arc::new(ServerState::new(
        cache,
        client,
        config.upstream_url.clone(),
    ));

    start_server(state, config.port)
        .await
        .map_err(|e| ProxyError::Io(Box::new(e)))?;

    Ok(())
}
