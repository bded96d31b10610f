//! In-memory response buffer: the tee between one downloader and many readers
//!
//! While an entry is `in progress` the downloader appends upstream body bytes
//! here and every concurrent request streams from its own read position.
//! Readers poll: when they catch up to the write frontier they sleep briefly
//! and report an empty chunk, which the caller retries.

use crate::error::{CacheError, Result};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::io;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// How long a caught-up reader suspends before reporting an empty chunk.
pub(crate) const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Captured upstream status and headers plus the append-only body log.
#[derive(Debug)]
pub(crate) struct ResponseBuffer {
    status: StatusCode,
    headers: HeaderMap,
    body: RwLock<BodyState>,
}

#[derive(Debug)]
struct BodyState {
    bytes: Vec<u8>,
    completed: bool,
    written: u64,
    error: Option<Arc<io::Error>>,
}

impl ResponseBuffer {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            headers,
            body: RwLock::new(BodyState {
                bytes: Vec::new(),
                completed: false,
                written: 0,
                error: None,
            }),
        }
    }

    pub(crate) fn status(&self) -> StatusCode {
        self.status
    }

    pub(crate) fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Append body bytes. Only the downloader calls this; appending after
    /// [`complete`](Self::complete) is a programmer error.
    pub(crate) fn append(&self, chunk: &[u8]) -> Result<()> {
        let mut body = self.body.write().unwrap();
        if body.completed {
            return Err(CacheError::AlreadyCompleted);
        }
        body.bytes.extend_from_slice(chunk);
        Ok(())
    }

    /// Set the completion flag with the byte total and terminal error.
    pub(crate) fn complete(&self, written: u64, error: Option<io::Error>) {
        let mut body = self.body.write().unwrap();
        body.completed = true;
        body.written = written;
        body.error = error.map(Arc::new);
    }

    /// Total bytes recorded at completion.
    pub(crate) fn written(&self) -> u64 {
        self.body.read().unwrap().written
    }

    /// Copy of the full body accumulated so far, for the blob write.
    pub(crate) fn body_snapshot(&self) -> Vec<u8> {
        self.body.read().unwrap().bytes.clone()
    }

}

/// One reader's view of the buffer: a position advancing toward the frontier.
#[derive(Debug)]
pub(crate) struct BufferReader {
    buf: Arc<ResponseBuffer>,
    pos: usize,
}

impl BufferReader {
    /// A reader positioned at the start of the body.
    pub(crate) fn new(buf: Arc<ResponseBuffer>) -> Self {
        Self { buf, pos: 0 }
    }

    /// Next step of the read loop.
    ///
    /// Returns `Ok(None)` at end-of-stream, `Ok(Some(chunk))` with the bytes
    /// available past the current position, or an empty chunk after a short
    /// suspend when the reader has caught up to an unfinished write. A
    /// terminal upstream error takes precedence over buffered bytes.
    pub(crate) async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        {
            let body = self.buf.body.read().unwrap();
            if let Some(err) = &body.error {
                return Err(CacheError::UpstreamRead(Arc::clone(err)));
            }
            if self.pos < body.bytes.len() {
                let chunk = Bytes::copy_from_slice(&body.bytes[self.pos..]);
                self.pos += chunk.len();
                return Ok(Some(chunk));
            }
            if body.completed {
                return Ok(None);
            }
        }
        tokio::time::sleep(READ_POLL_INTERVAL).await;
        Ok(Some(Bytes::new()))
    }
}
