//! HTTP server: cached GET path, pass-through proxying, and health
//!
//! GET requests go through the cache engine; a `NoCache` signal and every
//! other method fall through to the pass-through proxy.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream;
use readthrough_cache::{Cache, CacheError, CacheRequest, CacheStats, HttpUpstream, ResponseSink};
use serde::Serialize;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: Cache<HttpUpstream>,
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(cache: Cache<HttpUpstream>, client: reqwest::Client, upstream_url: String) -> Self {
        Self {
            cache,
            client,
            upstream_url,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    cache: CacheStats,
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(handle)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let cache = state.cache.stats().await;
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok",
        uptime_secs,
        cache,
    })
}

/// GET requests are cacheable; everything else passes straight through.
async fn handle(State(state): State<SharedState>, req: Request) -> Response {
    if req.method() == Method::GET {
        serve_from_cache(state, req).await
    } else {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();
        let raw_query = parts.uri.query().unwrap_or("").to_string();
        debug!(method = %parts.method, path = %path, "pass-through request");
        passthrough(
            &state,
            parts.method,
            &path,
            &raw_query,
            parts.headers,
            Some(body),
        )
        .await
    }
}

/// Drive `Cache::serve` in a task and stream its output as the response.
async fn serve_from_cache(state: SharedState, req: Request) -> Response {
    let path = req.uri().path().to_string();
    let raw_query = req.uri().query().unwrap_or("").to_string();
    let headers = req.headers().clone();
    let cache_req = CacheRequest::new(path.clone(), raw_query.clone(), headers.clone());

    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel::<io::Result<Bytes>>(16);
    let mut sink = ChannelSink {
        head: Some(head_tx),
        body: body_tx,
    };

    let serve_state = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = serve_state.cache.serve(&mut sink, &cache_req).await {
            match sink.head.take() {
                Some(tx) => {
                    let _ = tx.send(Err(e));
                }
                None => {
                    // Headers are already on the wire; abort the stream.
                    warn!(error = %e, "cache stream aborted mid-response");
                    let _ = sink.body.send(Err(io::Error::other(e.to_string()))).await;
                }
            }
        }
    });

    match head_rx.await {
        Ok(Ok((status, headers))) => {
            let body = stream::unfold(body_rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            let mut builder = Response::builder().status(status);
            if let Some(h) = builder.headers_mut() {
                h.extend(headers);
            }
            builder
                .body(Body::from_stream(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Ok(Err(CacheError::NoCache)) => {
            debug!(path = %path, "entry marked no cache, proxying");
            passthrough(&state, Method::GET, &path, &raw_query, headers, None).await
        }
        Ok(Err(e @ CacheError::Upstream(_))) => {
            warn!(path = %path, error = %e, "upstream request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
        Ok(Err(e)) => {
            error!(path = %path, error = %e, "cache request failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Forward a request to the upstream verbatim and stream the response back.
async fn passthrough(
    state: &ServerState,
    method: Method,
    path: &str,
    raw_query: &str,
    headers: HeaderMap,
    body: Option<Body>,
) -> Response {
    let mut url = format!("{}{}", state.upstream_url.trim_end_matches('/'), path);
    if !raw_query.is_empty() {
        url = format!("{}?{}", url, raw_query);
    }

    let mut forwarded = headers;
    forwarded.remove(header::HOST);

    let mut request = state.client.request(method, &url).headers(forwarded);
    if let Some(body) = body {
        request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    match request.send().await {
        Ok(resp) => {
            let status =
                StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut builder = Response::builder().status(status);
            if let Some(h) = builder.headers_mut() {
                for (name, value) in resp.headers() {
                    if name == header::CONNECTION || name == header::TRANSFER_ENCODING {
                        continue;
                    }
                    h.append(name.clone(), value.clone());
                }
            }
            builder
                .body(Body::from_stream(resp.bytes_stream()))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => {
            error!(url = %url, error = %e, "pass-through request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Bridges `Cache::serve` to a streamed axum response: the first `begin`
/// resolves the handler's status and headers, chunks flow over a channel.
struct ChannelSink {
    head: Option<oneshot::Sender<std::result::Result<(StatusCode, HeaderMap), CacheError>>>,
    body: mpsc::Sender<io::Result<Bytes>>,
}

impl ResponseSink for ChannelSink {
    async fn begin(&mut self, status: StatusCode, headers: &HeaderMap) -> io::Result<()> {
        let tx = self
            .head
            .take()
            .ok_or_else(|| io::Error::other("response already begun"))?;
        tx.send(Ok((status, headers.clone())))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.body
            .send(Ok(chunk))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}
