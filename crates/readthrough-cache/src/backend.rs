//! The coordinator: fingerprint index, state machine, and downloader
//!
//! One backend owns the entry index, the cache directory, and the journal.
//! `serve` resolves a request to an entry and drives it through the state
//! machine; a spawned downloader task copies the upstream body into the
//! response buffer and onward to disk while readers stream concurrently.

use crate::entry::{Entry, EntryStatus};
use crate::error::{CacheError, Result};
use crate::response::{BufferReader, ResponseBuffer};
use crate::store::MetaStore;
use crate::types::{CacheRequest, CacheStats, ResponseSink};
use crate::upstream::Upstream;
use crate::util;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use http::{HeaderMap, StatusCode};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use url::Url;

const BLOB_READ_CHUNK: usize = 64 * 1024;

pub(crate) struct Backend<F> {
    fetcher: F,
    base_url: Url,
    cache_dir: PathBuf,
    store: MetaStore,
    /// The backend lock: index mutation, ID generation, and journal writes.
    /// Lock order is entry transition token first, this lock second.
    index: Mutex<HashMap<String, Arc<Entry>>>,
    expiration: Duration,
}

impl<F: Upstream> Backend<F> {
    pub(crate) fn new(
        fetcher: F,
        base_url: Url,
        cache_dir: PathBuf,
        store: MetaStore,
        expiration: Duration,
        index: HashMap<String, Arc<Entry>>,
    ) -> Self {
        Self {
            fetcher,
            base_url,
            cache_dir,
            store,
            index: Mutex::new(index),
            expiration,
        }
    }

    pub(crate) fn cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }

    pub(crate) fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Serve one request, dispatching on the entry's current state.
    pub(crate) async fn serve<S: ResponseSink>(
        self: Arc<Self>,
        sink: &mut S,
        req: &CacheRequest,
    ) -> Result<()> {
        let (id, entry) = self.find_or_create(req).await?;
        match entry.status() {
            EntryStatus::Init => self.serve_init(&id, &entry, sink, req).await,
            EntryStatus::InProgress => self.serve_in_progress(&id, &entry, sink).await,
            EntryStatus::Cached => self.serve_cached(&id, &entry, sink).await,
            EntryStatus::NoCache => Err(CacheError::NoCache),
        }
    }

    /// Resolve a fingerprint to its entry, creating and journaling a fresh
    /// one when absent.
    async fn find_or_create(&self, req: &CacheRequest) -> Result<(String, Arc<Entry>)> {
        let mut index = self.index.lock().await;
        for (id, entry) in index.iter() {
            if req.matches(entry.path(), entry.params()) {
                return Ok((id.clone(), Arc::clone(entry)));
            }
        }

        let id = loop {
            let candidate = util::generate_id(util::ENTRY_ID_LEN);
            if !index.contains_key(&candidate) {
                break candidate;
            }
        };
        let entry = Arc::new(Entry::new(req.path.clone(), req.params.clone()));
        index.insert(id.clone(), Arc::clone(&entry));
        if let Err(e) = self.store.save(&index).await {
            index.remove(&id);
            return Err(e);
        }
        debug!(entry_id = %id, path = %req.path, "created cache entry");
        Ok((id, entry))
    }

    /// Initiate the upstream fetch for an `init` entry, then serve this
    /// request from the new buffer.
    async fn serve_init<S: ResponseSink>(
        self: Arc<Self>,
        id: &str,
        entry: &Arc<Entry>,
        sink: &mut S,
        req: &CacheRequest,
    ) -> Result<()> {
        let token = entry.transition().lock().await;

        // A racer may have started (or finished) the fetch while we waited
        // for the token; dispatch on whatever state it left behind.
        match entry.status() {
            EntryStatus::Init => {}
            EntryStatus::InProgress => {
                debug!(entry_id = %id, "entry already in progress");
                drop(token);
                return self.serve_in_progress(id, entry, sink).await;
            }
            EntryStatus::Cached => {
                drop(token);
                return self.serve_cached(id, entry, sink).await;
            }
            EntryStatus::NoCache => return Err(CacheError::NoCache),
        }

        let url = self.upstream_url(&req.path, &req.raw_query);
        let upstream = self.fetcher.fetch(url, req.headers.clone()).await?;

        let buf = Arc::new(ResponseBuffer::new(upstream.status, upstream.headers));
        let blob_path = util::blob_file_path(&self.cache_dir, id)
            .to_string_lossy()
            .into_owned();
        entry.begin_fetch(Arc::clone(&buf), blob_path);
        if let Err(e) = self.persist().await {
            // Nothing observed the transition yet; undo it so the next
            // request retries cleanly.
            entry.reset();
            return Err(e);
        }

        debug!(entry_id = %id, path = %req.path, "entry in progress");
        let downloader = Arc::clone(&self);
        let download_id = id.to_string();
        let download_entry = Arc::clone(entry);
        tokio::spawn(async move {
            downloader
                .download(download_id, download_entry, buf, upstream.body)
                .await;
        });

        drop(token);
        self.serve_in_progress(id, entry, sink).await
    }

    /// Stream the captured status, headers, and body from the in-memory
    /// buffer, staying attached to the reader latch for the duration.
    async fn serve_in_progress<S: ResponseSink>(
        &self,
        id: &str,
        entry: &Arc<Entry>,
        sink: &mut S,
    ) -> Result<()> {
        let Some(buf) = entry.response() else {
            // The downloader tore the buffer down between dispatch and here.
            return match entry.status() {
                EntryStatus::Cached => self.serve_cached(id, entry, sink).await,
                status => Err(CacheError::State(format!(
                    "entry {} has no response buffer in state {}",
                    id, status
                ))),
            };
        };

        sink.begin(buf.status(), buf.headers()).await?;

        let _guard = entry.readers().attach();
        let mut reader = BufferReader::new(buf);
        loop {
            match reader.next_chunk().await? {
                None => break,
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => sink.write_chunk(chunk).await?,
            }
        }
        Ok(())
    }

    /// Stream the blob file to the sink.
    async fn serve_cached<S: ResponseSink>(
        &self,
        id: &str,
        entry: &Arc<Entry>,
        sink: &mut S,
    ) -> Result<()> {
        let blob_path = entry.blob_path();
        let mut file = fs::File::open(&blob_path).await?;
        debug!(entry_id = %id, path = %blob_path, "serving cached entry");

        sink.begin(StatusCode::OK, &HeaderMap::new()).await?;
        let mut chunk = vec![0u8; BLOB_READ_CHUNK];
        loop {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            sink.write_chunk(Bytes::copy_from_slice(&chunk[..n])).await?;
        }
        Ok(())
    }

    /// Copy the upstream body into the buffer, then persist the blob and
    /// move the entry to `cached`; on any failure reset it to `init` so the
    /// next request retries. The upstream stream is dropped on every exit.
    async fn download(
        self: Arc<Self>,
        id: String,
        entry: Arc<Entry>,
        buf: Arc<ResponseBuffer>,
        mut body: BoxStream<'static, io::Result<Bytes>>,
    ) {
        let mut written: u64 = 0;
        let mut read_err: Option<io::Error> = None;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    if let Err(e) = buf.append(&bytes) {
                        read_err = Some(io::Error::other(e.to_string()));
                        break;
                    }
                    written += bytes.len() as u64;
                }
                Err(e) => {
                    read_err = Some(e);
                    break;
                }
            }
        }
        drop(body);

        let failed = read_err.is_some();
        buf.complete(written, read_err);
        if failed {
            warn!(entry_id = %id, "upstream read failed, resetting entry");
            self.reset_entry(&id, &entry).await;
            return;
        }

        let blob_path = entry.blob_path();
        if let Err(e) = fs::write(&blob_path, buf.body_snapshot()).await {
            error!(entry_id = %id, path = %blob_path, error = %e, "failed to write blob, resetting entry");
            self.reset_entry(&id, &entry).await;
            return;
        }

        // Readers attached to the buffer must finish before it is dropped.
        entry.readers().drain().await;

        let token = entry.transition().lock().await;
        entry.finish_fetch();
        if let Err(e) = self.persist().await {
            error!(entry_id = %id, error = %e, "failed to journal cached entry");
        }
        drop(token);
        debug!(entry_id = %id, bytes = buf.written(), "entry cached");
    }

    /// Reset an entry to `init`, clearing its blob path and buffer handle.
    pub(crate) async fn reset_entry(&self, id: &str, entry: &Entry) {
        let token = entry.transition().lock().await;
        entry.reset();
        if let Err(e) = self.persist().await {
            error!(entry_id = %id, error = %e, "failed to journal entry reset");
        }
        drop(token);
    }

    /// Rewrite the journal from the current index.
    pub(crate) async fn persist(&self) -> Result<()> {
        let index = self.index.lock().await;
        self.store.save(&index).await
    }

    /// Snapshot of the index for iteration outside the backend lock.
    pub(crate) async fn entries(&self) -> Vec<(String, Arc<Entry>)> {
        let index = self.index.lock().await;
        index
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect()
    }

    pub(crate) async fn entry(&self, id: &str) -> Result<Arc<Entry>> {
        let index = self.index.lock().await;
        index.get(id).cloned().ok_or(CacheError::EntryNotFound)
    }

    pub(crate) async fn stats(&self) -> CacheStats {
        let index = self.index.lock().await;
        let mut stats = CacheStats {
            entries: index.len(),
            ..CacheStats::default()
        };
        for entry in index.values() {
            match entry.status() {
                EntryStatus::InProgress => stats.in_progress += 1,
                EntryStatus::Cached => stats.cached += 1,
                _ => {}
            }
        }
        stats
    }

    /// Join the base URL's path with the request path; the query string is
    /// taken verbatim from the client.
    fn upstream_url(&self, path: &str, raw_query: &str) -> Url {
        let mut url = self.base_url.clone();
        let base = url.path().trim_end_matches('/').to_string();
        let request = path.trim_start_matches('/');
        let joined = if request.is_empty() {
            if base.is_empty() {
                "/".to_string()
            } else {
                base
            }
        } else {
            format!("{}/{}", base, request)
        };
        url.set_path(&joined);
        url.set_query(if raw_query.is_empty() {
            None
        } else {
            Some(raw_query)
        });
        url
    }

    #[cfg(test)]
    pub(crate) async fn insert_entry(&self, id: &str, entry: Entry) {
        let mut index = self.index.lock().await;
        index.insert(id.to_string(), Arc::new(entry));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_for_status, RecordingSink, ScriptedUpstream, Step};
    use tempfile::tempdir;

    async fn test_backend(
        dir: &std::path::Path,
        fetcher: ScriptedUpstream,
    ) -> Arc<Backend<ScriptedUpstream>> {
        let cache_dir = dir.join("blobs");
        fs::create_dir_all(&cache_dir).await.unwrap();
        Arc::new(Backend::new(
            fetcher,
            Url::parse("http://origin.test").unwrap(),
            cache_dir,
            MetaStore::new(dir.join("journal.json")),
            Duration::from_secs(600),
            HashMap::new(),
        ))
    }

    fn request(path: &str, query: &str) -> CacheRequest {
        CacheRequest::new(path, query, HeaderMap::new())
    }

    #[tokio::test]
    async fn test_cold_fetch_streams_and_caches() {
        let dir = tempdir().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, "text/plain".parse().unwrap());
        let fetcher = ScriptedUpstream::new(
            StatusCode::OK,
            headers,
            vec![Step::Data(Bytes::from_static(b"hello"))],
        );
        let backend = test_backend(dir.path(), fetcher.clone()).await;

        let mut sink = RecordingSink::default();
        backend
            .clone()
            .serve(&mut sink, &request("/foo", "x=1"))
            .await
            .unwrap();

        assert_eq!(sink.status, Some(StatusCode::OK));
        assert_eq!(
            sink.headers.unwrap()[http::header::CONTENT_TYPE],
            "text/plain"
        );
        assert_eq!(sink.body, b"hello");
        assert_eq!(fetcher.fetch_count(), 1);

        let (id, entry) = {
            let entries = backend.entries().await;
            entries.into_iter().next().unwrap()
        };
        wait_for_status(&entry, EntryStatus::Cached).await;

        let blob = fs::read(entry.blob_path()).await.unwrap();
        assert_eq!(blob, b"hello");
        assert!(entry.blob_path().contains(&format!("{}_", id)));
        assert!(entry.response().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_serves_share_one_fetch() {
        let dir = tempdir().unwrap();
        let fetcher = ScriptedUpstream::new(
            StatusCode::OK,
            HeaderMap::new(),
            vec![
                Step::Data(Bytes::from_static(b"abc")),
                Step::Wait(Duration::from_millis(200)),
                Step::Data(Bytes::from_static(b"def")),
            ],
        );
        let backend = test_backend(dir.path(), fetcher.clone()).await;

        let a = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move {
                let mut sink = RecordingSink::default();
                let res = backend.clone().serve(&mut sink, &request("/foo", "x=1")).await;
                (res, sink)
            })
        };
        let b = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move {
                let mut sink = RecordingSink::default();
                let res = backend.clone().serve(&mut sink, &request("/foo", "x=1")).await;
                (res, sink)
            })
        };

        let (ra, rb) = tokio::join!(a, b);
        let (res_a, sink_a) = ra.unwrap();
        let (res_b, sink_b) = rb.unwrap();
        res_a.unwrap();
        res_b.unwrap();

        assert_eq!(sink_a.body, b"abcdef");
        assert_eq!(sink_b.body, b"abcdef");
        assert_eq!(fetcher.fetch_count(), 1);

        let entries = backend.entries().await;
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_failure_resets_entry_and_retries() {
        let dir = tempdir().unwrap();
        let fetcher = ScriptedUpstream::new(
            StatusCode::OK,
            HeaderMap::new(),
            vec![
                Step::Data(Bytes::from_static(b"abc")),
                Step::Fail("connection reset"),
            ],
        );
        let backend = test_backend(dir.path(), fetcher.clone()).await;

        let mut sink = RecordingSink::default();
        let err = backend
            .clone()
            .serve(&mut sink, &request("/foo", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::UpstreamRead(_)));
        assert_eq!(sink.body, b"abc");

        let (_, entry) = backend.entries().await.into_iter().next().unwrap();
        wait_for_status(&entry, EntryStatus::Init).await;
        assert!(entry.blob_path().is_empty());

        // The next request issues a fresh upstream fetch.
        let mut sink = RecordingSink::default();
        let _ = backend.clone().serve(&mut sink, &request("/foo", "")).await;
        assert_eq!(fetcher.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_cached_reread_does_not_touch_upstream() {
        let dir = tempdir().unwrap();
        let fetcher = ScriptedUpstream::ok(vec![Step::Data(Bytes::from_static(b"hello"))]);
        let backend = test_backend(dir.path(), fetcher.clone()).await;

        let mut sink = RecordingSink::default();
        backend.clone().serve(&mut sink, &request("/foo", "x=1")).await.unwrap();

        let (_, entry) = backend.entries().await.into_iter().next().unwrap();
        wait_for_status(&entry, EntryStatus::Cached).await;

        let mut sink = RecordingSink::default();
        backend.clone().serve(&mut sink, &request("/foo", "x=1")).await.unwrap();
        assert_eq!(sink.status, Some(StatusCode::OK));
        assert_eq!(sink.body, b"hello");
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_fetch_separately() {
        let dir = tempdir().unwrap();
        let fetcher = ScriptedUpstream::ok(vec![Step::Data(Bytes::from_static(b"data"))]);
        let backend = test_backend(dir.path(), fetcher.clone()).await;

        let mut sink = RecordingSink::default();
        backend.clone().serve(&mut sink, &request("/foo", "x=1")).await.unwrap();
        let mut sink = RecordingSink::default();
        backend.clone().serve(&mut sink, &request("/foo", "x=2")).await.unwrap();

        assert_eq!(fetcher.fetch_count(), 2);
        assert_eq!(backend.entries().await.len(), 2);
    }

    #[tokio::test]
    async fn test_non_success_status_is_proxied() {
        let dir = tempdir().unwrap();
        let fetcher = ScriptedUpstream::new(
            StatusCode::NOT_FOUND,
            HeaderMap::new(),
            vec![Step::Data(Bytes::from_static(b"missing"))],
        );
        let backend = test_backend(dir.path(), fetcher).await;

        let mut sink = RecordingSink::default();
        backend.clone().serve(&mut sink, &request("/gone", "")).await.unwrap();
        assert_eq!(sink.status, Some(StatusCode::NOT_FOUND));
        assert_eq!(sink.body, b"missing");
    }

    #[tokio::test]
    async fn test_empty_upstream_body() {
        let dir = tempdir().unwrap();
        let fetcher = ScriptedUpstream::ok(vec![]);
        let backend = test_backend(dir.path(), fetcher).await;

        let mut sink = RecordingSink::default();
        backend.clone().serve(&mut sink, &request("/empty", "")).await.unwrap();
        assert!(sink.body.is_empty());

        let (_, entry) = backend.entries().await.into_iter().next().unwrap();
        wait_for_status(&entry, EntryStatus::Cached).await;
        let blob = fs::read(entry.blob_path()).await.unwrap();
        assert!(blob.is_empty());
    }

    #[tokio::test]
    async fn test_no_cache_entry_signals_passthrough() {
        let dir = tempdir().unwrap();
        let fetcher = ScriptedUpstream::ok(vec![]);
        let backend = test_backend(dir.path(), fetcher.clone()).await;

        let entry = Entry::new("/skip".to_string(), crate::types::Params::new());
        let record = {
            let mut record = entry.record();
            record.status = EntryStatus::NoCache;
            record
        };
        backend.insert_entry("nocache-entry", Entry::from_record(record)).await;

        let mut sink = RecordingSink::default();
        let err = backend
            .clone()
            .serve(&mut sink, &request("/skip", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NoCache));
        assert_eq!(fetcher.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_upstream_url_composition() {
        let dir = tempdir().unwrap();
        let fetcher = ScriptedUpstream::ok(vec![Step::Data(Bytes::from_static(b"x"))]);
        let cache_dir = dir.path().join("blobs");
        fs::create_dir_all(&cache_dir).await.unwrap();
        let backend = Arc::new(Backend::new(
            fetcher.clone(),
            Url::parse("http://origin.test/base/").unwrap(),
            cache_dir,
            MetaStore::disabled(),
            Duration::ZERO,
            HashMap::new(),
        ));

        let mut sink = RecordingSink::default();
        backend
            .clone()
            .serve(&mut sink, &request("/foo/bar", "x=1&y=2"))
            .await
            .unwrap();

        let url = fetcher.last_url().unwrap();
        assert_eq!(url.path(), "/base/foo/bar");
        assert_eq!(url.query(), Some("x=1&y=2"));
    }

    #[tokio::test]
    async fn test_request_headers_forwarded_upstream() {
        let dir = tempdir().unwrap();
        let fetcher = ScriptedUpstream::ok(vec![Step::Data(Bytes::from_static(b"x"))]);
        let backend = test_backend(dir.path(), fetcher.clone()).await;

        let mut headers = HeaderMap::new();
        headers.insert(http::header::ACCEPT, "application/json".parse().unwrap());
        let req = CacheRequest::new("/foo", "", headers);
        let mut sink = RecordingSink::default();
        backend.clone().serve(&mut sink, &req).await.unwrap();

        let forwarded = fetcher.last_headers().unwrap();
        assert_eq!(forwarded[http::header::ACCEPT], "application/json");
    }

    #[tokio::test]
    async fn test_stats_counts_states() {
        let dir = tempdir().unwrap();
        let fetcher = ScriptedUpstream::ok(vec![Step::Data(Bytes::from_static(b"hello"))]);
        let backend = test_backend(dir.path(), fetcher).await;

        let mut sink = RecordingSink::default();
        backend.clone().serve(&mut sink, &request("/foo", "")).await.unwrap();
        let (_, entry) = backend.entries().await.into_iter().next().unwrap();
        wait_for_status(&entry, EntryStatus::Cached).await;

        let stats = backend.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.cached, 1);
        assert_eq!(stats.in_progress, 0);
    }

    #[tokio::test]
    async fn test_entry_lookup_miss() {
        let dir = tempdir().unwrap();
        let fetcher = ScriptedUpstream::ok(vec![]);
        let backend = test_backend(dir.path(), fetcher).await;
        assert!(matches!(
            backend.entry("missing").await.unwrap_err(),
            CacheError::EntryNotFound
        ));
    }
}
