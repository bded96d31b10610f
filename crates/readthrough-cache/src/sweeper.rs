//! Periodic expiration and orphan collection
//!
//! Metadata is invalidated first and files deleted only once nothing
//! references them, so a reader holding an open blob is never pulled out
//! from under a live entry.

use crate::backend::Backend;
use crate::entry::EntryStatus;
use crate::upstream::Upstream;
use crate::util;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error};

/// Run sweep passes every `sweep_interval` until the quit channel signals.
/// A zero interval disables the sweeper entirely.
pub(crate) async fn run<F: Upstream>(
    backend: Arc<Backend<F>>,
    sweep_interval: Duration,
    mut quit: mpsc::Receiver<()>,
) {
    if sweep_interval.is_zero() {
        return;
    }
    let mut ticker = interval(sweep_interval);
    // The first tick completes immediately; the first pass should not.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                backend.mark_expired().await;
                backend.collect_orphans().await;
            }
            _ = quit.recv() => {
                debug!("sweeper stopped");
                return;
            }
        }
    }
}

impl<F: Upstream> Backend<F> {
    /// Reset every expired `cached` entry to `init`. Zero expiration
    /// disables this phase.
    pub(crate) async fn mark_expired(&self) {
        let expiration = self.expiration();
        if expiration.is_zero() {
            return;
        }
        debug!("marking expired cache entries");
        for (id, entry) in self.entries().await {
            if entry.status() != EntryStatus::Cached || !entry.expired(expiration) {
                continue;
            }
            let token = entry.transition().lock().await;
            // Re-check: a racer may have moved the entry while we waited.
            if entry.status() != EntryStatus::Cached || !entry.expired(expiration) {
                continue;
            }
            debug!(entry_id = %id, "entry expired");
            entry.reset();
            if let Err(e) = self.persist().await {
                error!(entry_id = %id, error = %e, "failed to journal expired entry");
            }
            drop(token);
        }
    }

    /// Delete cache-directory files referenced by no `in progress` or
    /// `cached` entry, and clear stale blob paths on entries in other
    /// states.
    pub(crate) async fn collect_orphans(&self) {
        debug!("collecting orphan cache files");

        let mut in_use: HashSet<String> = HashSet::new();
        for (id, entry) in self.entries().await {
            let blob_path = entry.blob_path();
            if blob_path.is_empty() {
                continue;
            }
            match entry.status() {
                EntryStatus::Cached | EntryStatus::InProgress => {
                    if let Some(name) = Path::new(&blob_path).file_name() {
                        in_use.insert(name.to_string_lossy().into_owned());
                    }
                }
                _ => {
                    let token = entry.transition().lock().await;
                    entry.clear_blob_path();
                    if let Err(e) = self.persist().await {
                        error!(entry_id = %id, error = %e, "failed to journal cleared blob path");
                    }
                    drop(token);
                }
            }
        }

        let files = match util::list_files(self.cache_dir()).await {
            Ok(files) => files,
            Err(e) => {
                error!(error = %e, "failed to list cache dir");
                return;
            }
        };
        for file in files {
            if in_use.contains(&file) {
                continue;
            }
            debug!(file = %file, "deleting orphan cache file");
            if let Err(e) = fs::remove_file(self.cache_dir().join(&file)).await {
                error!(file = %file, error = %e, "failed to delete orphan cache file");
            }
        }
    }
}
