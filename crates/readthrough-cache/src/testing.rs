//! Scripted upstream and recording sink shared by the crate's tests

use crate::entry::{Entry, EntryStatus};
use crate::error::Result;
use crate::types::ResponseSink;
use crate::upstream::{Upstream, UpstreamResponse};
use bytes::Bytes;
use futures_util::stream;
use futures_util::StreamExt;
use http::{HeaderMap, StatusCode};
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// One step of a scripted upstream body.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Data(Bytes),
    Wait(Duration),
    Fail(&'static str),
}

/// An upstream whose responses replay a fixed script, counting fetches and
/// recording the last composed URL and forwarded headers.
#[derive(Clone)]
pub(crate) struct ScriptedUpstream {
    status: StatusCode,
    headers: HeaderMap,
    script: Vec<Step>,
    calls: Arc<AtomicUsize>,
    last_url: Arc<Mutex<Option<Url>>>,
    last_headers: Arc<Mutex<Option<HeaderMap>>>,
}

impl ScriptedUpstream {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, script: Vec<Step>) -> Self {
        Self {
            status,
            headers,
            script,
            calls: Arc::new(AtomicUsize::new(0)),
            last_url: Arc::new(Mutex::new(None)),
            last_headers: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn ok(script: Vec<Step>) -> Self {
        Self::new(StatusCode::OK, HeaderMap::new(), script)
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_url(&self) -> Option<Url> {
        self.last_url.lock().unwrap().clone()
    }

    pub(crate) fn last_headers(&self) -> Option<HeaderMap> {
        self.last_headers.lock().unwrap().clone()
    }
}

impl Upstream for ScriptedUpstream {
    fn fetch(
        &self,
        url: Url,
        headers: HeaderMap,
    ) -> impl Future<Output = Result<UpstreamResponse>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_url.lock().unwrap() = Some(url);
        *self.last_headers.lock().unwrap() = Some(headers);

        let status = self.status;
        let response_headers = self.headers.clone();
        let script: VecDeque<Step> = self.script.clone().into();
        async move {
            let body = stream::unfold(script, |mut script| async move {
                loop {
                    match script.pop_front()? {
                        Step::Wait(d) => tokio::time::sleep(d).await,
                        Step::Data(bytes) => return Some((Ok(bytes), script)),
                        Step::Fail(msg) => {
                            return Some((Err(io::Error::other(msg)), script));
                        }
                    }
                }
            })
            .boxed();
            Ok(UpstreamResponse {
                status,
                headers: response_headers,
                body,
            })
        }
    }
}

/// A sink that records everything it is given.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub(crate) status: Option<StatusCode>,
    pub(crate) headers: Option<HeaderMap>,
    pub(crate) body: Vec<u8>,
}

impl ResponseSink for RecordingSink {
    async fn begin(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
        self.status = Some(status);
        self.headers = Some(headers.clone());
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.body.extend_from_slice(&chunk);
        Ok(())
    }
}

/// Poll an entry until it reaches `status`, failing the test after 5s.
pub(crate) async fn wait_for_status(entry: &Entry, status: EntryStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if entry.status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for entry status {}", status));
}
