//! Identifier and cache-directory utilities

use crate::error::{CacheError, Result};
use rand::Rng;
use std::path::{Path, PathBuf};
use tokio::fs;

const BASE64URL_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Length of an entry ID.
pub(crate) const ENTRY_ID_LEN: usize = 25;

/// Length of the random suffix in a blob file name.
pub(crate) const BLOB_SUFFIX_LEN: usize = 10;

/// Returns a random base64url string of the provided length.
/// Not guaranteed to be unique.
pub(crate) fn generate_id(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| BASE64URL_CHARSET[rng.gen_range(0..BASE64URL_CHARSET.len())] as char)
        .collect()
}

/// Compose the on-disk blob path for an entry: `<dir>/<id>_<random>.blob`.
pub(crate) fn blob_file_path(cache_dir: &Path, entry_id: &str) -> PathBuf {
    cache_dir.join(format!("{}_{}.blob", entry_id, generate_id(BLOB_SUFFIX_LEN)))
}

/// List the basenames of all files in `dir`.
pub(crate) async fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| CacheError::Io(Box::new(e)))?;
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Remove everything inside `dir`, leaving the directory itself in place.
pub(crate) async fn remove_dir_contents(dir: &Path) -> Result<()> {
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
    }
    Ok(())
}
