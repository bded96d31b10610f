//! Durable metadata journal: the full index rewritten as one JSON document

use crate::entry::{Entry, EntryRecord};
use crate::error::{CacheError, Result};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

/// Persists the entry index to a single journal file.
///
/// Every mutation rewrites the whole document; callers hold the backend lock
/// across [`save`](Self::save) so writes never interleave.
#[derive(Debug)]
pub(crate) struct MetaStore {
    file_path: PathBuf,
    /// Suppresses writes in tests exercising pure state-machine behavior.
    nosave: bool,
}

impl MetaStore {
    pub(crate) fn new(file_path: PathBuf) -> Self {
        Self {
            file_path,
            nosave: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn disabled() -> Self {
        Self {
            file_path: PathBuf::new(),
            nosave: true,
        }
    }

    /// Write the index to the journal file, replacing its contents.
    pub(crate) async fn save(&self, index: &HashMap<String, Arc<Entry>>) -> Result<()> {
        if self.nosave {
            return Ok(());
        }
        // BTreeMap snapshot for stable key order in the document.
        let records: BTreeMap<&str, EntryRecord> = index
            .iter()
            .map(|(id, entry)| (id.as_str(), entry.record()))
            .collect();
        let data = serde_json::to_vec_pretty(&records)?;
        fs::write(&self.file_path, data)
            .await
            .map_err(|e| CacheError::Journal(Box::new(e)))?;
        debug!(path = ?self.file_path, entries = records.len(), "journal written");
        Ok(())
    }

    /// Read the journal into an index. A missing file, empty content, or the
    /// literal `[]` all yield an empty index.
    pub(crate) async fn load(&self) -> Result<HashMap<String, Arc<Entry>>> {
        let data = match fs::read_to_string(&self.file_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(CacheError::Io(Box::new(e))),
        };
        if data.is_empty() || data == "[]" {
            return Ok(HashMap::new());
        }
        let records: HashMap<String, EntryRecord> = serde_json::from_str(&data)?;
        Ok(records
            .into_iter()
            .map(|(id, record)| (id, Arc::new(Entry::from_record(record))))
            .collect())
    }
}
