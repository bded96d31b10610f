//! Request fingerprint types and the response sink seam

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::io;

/// Query parameters: name to ordered list of values.
///
/// Equality is deep equality including per-key value order, so two requests
/// with the same parameter repeated in a different order are distinct
/// fingerprints.
pub type Params = BTreeMap<String, Vec<String>>;

/// Parse a raw query string into [`Params`], preserving per-key value order.
pub fn parse_query(raw_query: &str) -> Params {
    let mut params = Params::new();
    if raw_query.is_empty() {
        return params;
    }
    for (name, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
        params
            .entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    params
}

/// A cacheable request as seen by the engine: the fingerprint plus the
/// headers to forward upstream and the verbatim query string.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub path: String,
    pub params: Params,
    pub raw_query: String,
    pub headers: HeaderMap,
}

impl CacheRequest {
    pub fn new(path: impl Into<String>, raw_query: impl Into<String>, headers: HeaderMap) -> Self {
        let raw_query = raw_query.into();
        let params = parse_query(&raw_query);
        Self {
            path: path.into(),
            params,
            raw_query,
            headers,
        }
    }

    /// Whether this request names the same fingerprint as `(path, params)`.
    pub fn matches(&self, path: &str, params: &Params) -> bool {
        self.path == path && &self.params == params
    }
}

/// Receiver of a proxied response: status and headers first, then body bytes.
///
/// The host decides what backs this (an HTTP response writer, a channel into
/// a streamed body, a test buffer).
pub trait ResponseSink: Send {
    /// Deliver the response status and headers. Called at most once, before
    /// any body chunk.
    fn begin(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Deliver one chunk of body bytes.
    fn write_chunk(&mut self, chunk: Bytes) -> impl Future<Output = io::Result<()>> + Send;
}

/// Point-in-time counts over the entry index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub in_progress: usize,
    pub cached: usize,
}
