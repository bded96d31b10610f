//! Read-through cache engine for idempotent upstream fetches
//!
//! Requests are fingerprinted by path and query parameters. The first
//! request for a fingerprint triggers a single upstream fetch whose body is
//! teed to an on-disk blob and to every concurrent reader; later requests
//! stream straight from disk. Entry metadata is journaled to a single JSON
//! file, and a background sweeper expires old entries and removes orphaned
//! blob files.

mod backend;
mod entry;
mod error;
mod response;
mod store;
mod sweeper;
#[cfg(test)]
mod testing;
mod types;
mod upstream;
mod util;

pub use error::{CacheError, Result};
pub use types::{parse_query, CacheRequest, CacheStats, Params, ResponseSink};
pub use upstream::{HttpUpstream, Upstream, UpstreamResponse};

use crate::backend::Backend;
use crate::entry::EntryStatus;
use crate::store::MetaStore;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::info;
use url::Url;

/// Construction parameters for a [`Cache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Journal file persisting the entry index.
    pub journal_path: PathBuf,
    /// Directory owned by this process for blob files. Created if absent;
    /// its parent must exist. Truncated on startup.
    pub cache_dir: PathBuf,
    /// Base URL whose path is joined with request paths.
    pub upstream_url: String,
    /// Age after which `cached` entries are reset. Zero disables expiration.
    pub expiration: Duration,
    /// Sweeper pass interval. Zero disables the sweeper.
    pub sweep_interval: Duration,
}

/// The cache facade: construction plus the single `serve` entry point.
pub struct Cache<F> {
    backend: Arc<Backend<F>>,
    sweeper_quit: mpsc::Sender<()>,
}

impl<F> std::fmt::Debug for Cache<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").finish_non_exhaustive()
    }
}

impl<F: Upstream> Cache<F> {
    /// Validate the configuration, load the journal, reset state left over
    /// from a previous process, truncate the cache directory, and start the
    /// sweeper.
    pub async fn new(config: CacheConfig, fetcher: F) -> Result<Self> {
        if config.journal_path.as_os_str().is_empty() {
            return Err(CacheError::Config("journal file path is empty".to_string()));
        }
        if config.cache_dir.as_os_str().is_empty() {
            return Err(CacheError::Config("cache dir not provided".to_string()));
        }
        let base_url = Url::parse(&config.upstream_url).map_err(|e| {
            CacheError::Config(format!(
                "invalid upstream URL {}: {}",
                config.upstream_url, e
            ))
        })?;

        ensure_cache_dir(&config.cache_dir).await?;

        let store = MetaStore::new(config.journal_path.clone());
        let index = store.load().await?;

        // After a restart nothing on disk can be trusted: in-flight buffers
        // are gone and the directory is about to be truncated, so every
        // entry past `init` starts over.
        for entry in index.values() {
            match entry.status() {
                EntryStatus::InProgress | EntryStatus::Cached => entry.reset(),
                _ => entry.clear_blob_path(),
            }
        }
        util::remove_dir_contents(&config.cache_dir).await?;

        let backend = Arc::new(Backend::new(
            fetcher,
            base_url,
            config.cache_dir.clone(),
            store,
            config.expiration,
            index,
        ));
        backend.persist().await?;

        let (sweeper_quit, quit_rx) = mpsc::channel(1);
        if !config.sweep_interval.is_zero() {
            tokio::spawn(sweeper::run(
                Arc::clone(&backend),
                config.sweep_interval,
                quit_rx,
            ));
        }

        info!(
            cache_dir = ?config.cache_dir,
            journal = ?config.journal_path,
            expiration_secs = config.expiration.as_secs(),
            "cache initialized"
        );
        Ok(Self {
            backend,
            sweeper_quit,
        })
    }

    /// Serve one request into `sink`: from the blob file, from an in-flight
    /// fetch, or by initiating a fresh upstream fetch. Returns
    /// [`CacheError::NoCache`] when the caller should fall back to its
    /// pass-through path.
    pub async fn serve<S: ResponseSink>(&self, sink: &mut S, req: &CacheRequest) -> Result<()> {
        Arc::clone(&self.backend).serve(sink, req).await
    }

    /// Point-in-time counts over the entry index.
    pub async fn stats(&self) -> CacheStats {
        self.backend.stats().await
    }

    /// Stop the sweeper. In-flight requests and downloads are unaffected.
    pub async fn shutdown(&self) {
        let _ = self.sweeper_quit.send(()).await;
    }
}

/// Create the cache directory if missing (parent must exist) with mode 0700.
async fn ensure_cache_dir(dir: &std::path::Path) -> Result<()> {
    match fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(CacheError::Config(format!(
            "cache dir {} is not a directory",
            dir.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir(dir).await.map_err(|e| {
                CacheError::Config(format!(
                    "failed to create cache dir {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
            }
            Ok(())
        }
        Err(e) => Err(CacheError::Config(format!(
            "failed to stat cache dir {}: {}",
            dir.display(),
            e
        ))),
    }
}
