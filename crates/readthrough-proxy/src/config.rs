//! Proxy configuration parsed from environment variables

use crate::error::{ProxyError, Result};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub upstream_url: String,
    pub journal_file: PathBuf,
    pub cache_dir: PathBuf,
    pub expiration_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Config {
    /// Parse configuration from environment variables. `UPSTREAM_URL` is
    /// required; everything else has a default.
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(8080);

        let upstream_url = env::var("UPSTREAM_URL").map_err(|_| {
            ProxyError::Config("UPSTREAM_URL environment variable is required".to_string())
        })?;

        let journal_file = env::var("JOURNAL_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./cache.json"));

        let cache_dir = env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./cache"));

        // Zero disables expiration.
        let expiration_secs = env::var("CACHE_EXPIRATION_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        // Zero disables the sweeper.
        let sweep_interval_secs = env::var("SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(300);

        Ok(Self {
            port,
            upstream_url,
            journal_file,
            cache_dir,
            expiration_secs,
            sweep_interval_secs,
        })
    }
}
