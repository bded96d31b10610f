//! Cache entries: fingerprint, lifecycle state, and the reader latch

use crate::response::ResponseBuffer;
use crate::types::Params;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Lifecycle state of a cache entry, serialized with the journal wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    #[serde(rename = "init")]
    Init,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "cached")]
    Cached,
    #[serde(rename = "no cache")]
    NoCache,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryStatus::Init => "init",
            EntryStatus::InProgress => "in progress",
            EntryStatus::Cached => "cached",
            EntryStatus::NoCache => "no cache",
        };
        f.write_str(s)
    }
}

/// Durable fields of an entry, as written to the journal.
///
/// Unknown fields are tolerated on read; `created` is unix seconds clamped
/// to zero on write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    pub path: String,
    #[serde(default)]
    pub params: Params,
    #[serde(with = "unix_seconds")]
    pub created: DateTime<Utc>,
    pub status: EntryStatus,
    #[serde(rename = "cached_file", default)]
    pub blob_path: String,
}

/// One record in the index.
///
/// The fingerprint (`path`, `params`) and `created` are fixed at creation;
/// status, blob path, and the transient buffer handle live behind a short
/// field lock. The transition token serializes status transitions and fetch
/// initiation, and is never held across the field lock in the other order.
#[derive(Debug)]
pub struct Entry {
    path: String,
    params: Params,
    created: DateTime<Utc>,
    inner: StdMutex<EntryInner>,
    transition: Mutex<()>,
    readers: ReaderLatch,
}

#[derive(Debug)]
struct EntryInner {
    status: EntryStatus,
    blob_path: String,
    resp: Option<Arc<ResponseBuffer>>,
}

impl Entry {
    pub(crate) fn new(path: String, params: Params) -> Self {
        Self::with_created(path, params, Utc::now())
    }

    pub(crate) fn with_created(path: String, params: Params, created: DateTime<Utc>) -> Self {
        Self {
            path,
            params,
            created,
            inner: StdMutex::new(EntryInner {
                status: EntryStatus::Init,
                blob_path: String::new(),
                resp: None,
            }),
            transition: Mutex::new(()),
            readers: ReaderLatch::new(),
        }
    }

    pub(crate) fn from_record(record: EntryRecord) -> Self {
        let entry = Self::with_created(record.path, record.params, record.created);
        {
            let mut inner = entry.inner.lock().unwrap();
            inner.status = record.status;
            inner.blob_path = record.blob_path;
        }
        entry
    }

    pub(crate) fn record(&self) -> EntryRecord {
        let inner = self.inner.lock().unwrap();
        EntryRecord {
            path: self.path.clone(),
            params: self.params.clone(),
            created: self.created,
            status: inner.status,
            blob_path: inner.blob_path.clone(),
        }
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn params(&self) -> &Params {
        &self.params
    }

    pub(crate) fn status(&self) -> EntryStatus {
        self.inner.lock().unwrap().status
    }

    pub(crate) fn blob_path(&self) -> String {
        self.inner.lock().unwrap().blob_path.clone()
    }

    pub(crate) fn response(&self) -> Option<Arc<ResponseBuffer>> {
        self.inner.lock().unwrap().resp.clone()
    }

    /// Token serializing transitions and fetch initiation on this entry.
    pub(crate) fn transition(&self) -> &Mutex<()> {
        &self.transition
    }

    pub(crate) fn readers(&self) -> &ReaderLatch {
        &self.readers
    }

    /// Move to `in progress` with a fresh buffer and reserved blob path.
    /// Caller holds the transition token.
    pub(crate) fn begin_fetch(&self, resp: Arc<ResponseBuffer>, blob_path: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = EntryStatus::InProgress;
        inner.blob_path = blob_path;
        inner.resp = Some(resp);
    }

    /// Drop the buffer and move to `cached`. Caller holds the transition
    /// token and has drained the reader latch.
    pub(crate) fn finish_fetch(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = EntryStatus::Cached;
        inner.resp = None;
    }

    /// Back to `init` with no blob and no buffer. Caller holds the
    /// transition token.
    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = EntryStatus::Init;
        inner.blob_path.clear();
        inner.resp = None;
    }

    /// Clear a stale blob path without touching the status.
    pub(crate) fn clear_blob_path(&self) {
        self.inner.lock().unwrap().blob_path.clear();
    }

    /// Whether `created + expiration` lies in the past.
    pub(crate) fn expired(&self, expiration: Duration) -> bool {
        let age = (Utc::now() - self.created).num_seconds();
        age >= 0 && age as u64 > expiration.as_secs()
    }
}

/// Counts live readers attached to an entry's response buffer so the
/// downloader can delay buffer teardown until they drain.
#[derive(Debug)]
pub(crate) struct ReaderLatch {
    count: watch::Sender<usize>,
}

impl ReaderLatch {
    fn new() -> Self {
        Self {
            count: watch::channel(0).0,
        }
    }

    /// Register a reader. The returned guard detaches on drop, including
    /// error exits from the copy loop.
    pub(crate) fn attach(&self) -> ReaderGuard {
        self.count.send_modify(|n| *n += 1);
        ReaderGuard {
            count: self.count.clone(),
        }
    }

    /// Wait until no readers remain attached.
    pub(crate) async fn drain(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives as long as the entry, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

pub(crate) struct ReaderGuard {
    count: watch::Sender<usize>,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n -= 1);
    }
}

mod unix_seconds {
    //! `created` codec: unix seconds, clamped to zero on write.

    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(t.timestamp().max(0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = i64::deserialize(d)?;
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {}", secs)))
    }
}
