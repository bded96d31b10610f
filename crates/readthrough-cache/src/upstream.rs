//! The upstream fetcher seam and its HTTP implementation

use crate::error::{CacheError, Result};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use http::{header, HeaderMap, StatusCode};
use std::future::Future;
use std::io;
use tracing::debug;
use url::Url;

/// Status, headers, and body stream produced by an upstream fetch.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &"<body stream>")
            .finish()
    }
}

/// Fetches a composed URL from the origin, forwarding the client's request
/// headers. The engine only sees this capability set, so tests substitute
/// scripted responses.
pub trait Upstream: Send + Sync + 'static {
    fn fetch(
        &self,
        url: Url,
        headers: HeaderMap,
    ) -> impl Future<Output = Result<UpstreamResponse>> + Send;
}

/// Production fetcher over a shared HTTP client.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl Upstream for HttpUpstream {
    fn fetch(
        &self,
        url: Url,
        headers: HeaderMap,
    ) -> impl Future<Output = Result<UpstreamResponse>> + Send {
        let client = self.client.clone();
        async move {
            debug!(url = %url, "fetching from upstream");

            // Host is derived from the target URL, as with any forward proxy.
            let mut forwarded = headers;
            forwarded.remove(header::HOST);

            let resp = client
                .get(url)
                .headers(forwarded)
                .send()
                .await
                .map_err(|e| CacheError::Upstream(e.to_string()))?;

            let status = resp.status();
            let headers = resp.headers().clone();
            let body = resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(io::Error::other))
                .boxed();

            Ok(UpstreamResponse {
                status,
                headers,
                body,
            })
        }
    }
}
