//! Main axum router and HTTP request handlers for the caching proxy.
//!
//! Request classification, in order:
//! - `/-/health`                    - liveness probe, never touches upstream
//! - non-GET                        - passthrough to upstream
//! - any path containing `/-/`      - passthrough (tarballs, search, login, ...)
//! - `GET /<pkg>`, `GET /@scope/<pkg>` - metadata lookup: cache hit or
//!   tee'd upstream miss feeding the async strip pipeline

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use bytes::Bytes;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::strip;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`].  Everything except the health probe goes
/// through the fallback classifier, because package names are arbitrary
/// single- or two-segment paths.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/-/health", any(handle_health))
        .fallback(handle_request)
        .with_state(state)
}

/// `/-/health` — answered locally, before any classification.
async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

async fn handle_request(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let started = Instant::now();

    let result = if req.method() != Method::GET || is_special_path(req.uri().path()) {
        passthrough(&state, req, started).await
    } else {
        metadata_get(&state, req, started).await
    };

    result.unwrap_or_else(IntoResponse::into_response)
}

/// Paths containing the `/-/` sentinel segment (tarball downloads,
/// search, dist-tag management, login, ...) are never cached.
fn is_special_path(path: &str) -> bool {
    path.contains("/-/")
}

// ---------------------------------------------------------------------------
// Passthrough
// ---------------------------------------------------------------------------

/// Forward a request verbatim, streaming the body in both directions and
/// replaying upstream status and headers.
async fn passthrough(
    state: &Arc<AppState>,
    req: Request,
    started: Instant,
) -> Result<Response, AppError> {
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!(
        "{}{}",
        state.config.upstream.registry_url.trim_end_matches('/'),
        path_and_query
    );

    debug!(%method, %url, "passthrough to upstream");

    let mut headers = req.headers().clone();
    scrub_forwarded_headers(&mut headers);
    // The body is re-framed as a stream, so any client-declared framing
    // headers no longer apply.
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);

    let body_stream = req.into_body().into_data_stream();
    let upstream_resp = state
        .http_client
        .request(method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body_stream))
        .timeout(std::time::Duration::from_secs(
            state.config.upstream.passthrough_timeout_secs,
        ))
        .send()
        .await
        .map_err(|e| AppError::BadGateway(anyhow!(e)))?;

    state
        .stats
        .record_passthrough(&path_and_query, started.elapsed().as_millis() as u64)
        .await;

    let status = upstream_resp.status();
    let mut resp_headers = upstream_resp.headers().clone();
    resp_headers.remove(header::TRANSFER_ENCODING);

    let mut response = Response::new(Body::from_stream(upstream_resp.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = resp_headers;
    Ok(response)
}

// ---------------------------------------------------------------------------
// Metadata GET
// ---------------------------------------------------------------------------

async fn metadata_get(
    state: &Arc<AppState>,
    req: Request,
    started: Instant,
) -> Result<Response, AppError> {
    let name = package_name_from_path(req.uri().path())
        .ok_or_else(|| AppError::BadRequest("invalid package name".to_string()))?;

    match state.store.get(&name).await {
        Ok(Some(bytes)) => {
            debug!(package = %name, bytes = bytes.len(), "metadata cache hit");
            state.stats.record_hit(&name, bytes.len() as u64).await;
            serve_cached(bytes)
        }
        Ok(None) => miss(state, req, name, started).await,
        Err(e) => Err(AppError::Internal(e)),
    }
}

/// Derive the cache key from a request path: strip the leading `/` and
/// percent-decode.  Returns `None` for names the store would reject.
fn package_name_from_path(path: &str) -> Option<String> {
    let name = percent_decode(path.trim_start_matches('/'))?;
    crate::store::is_valid_name(&name).then_some(name)
}

fn serve_cached(bytes: Vec<u8>) -> Result<Response, AppError> {
    let len = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, header::HeaderValue::from(len));
    Ok(response)
}

/// Cache miss: stream the upstream response to the client while buffering
/// a copy for the strip pipeline.  The upstream read runs to completion
/// even if the client disconnects, so the cache still gets populated.
async fn miss(
    state: &Arc<AppState>,
    req: Request,
    name: String,
    started: Instant,
) -> Result<Response, AppError> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!(
        "{}{}",
        state.config.upstream.registry_url.trim_end_matches('/'),
        path_and_query
    );

    let mut headers = req.headers().clone();
    scrub_forwarded_headers(&mut headers);
    // Conditional requests would let upstream answer 304 with no body;
    // the strip pipeline always needs the full document.
    headers.remove(header::IF_NONE_MATCH);
    headers.remove(header::IF_MODIFIED_SINCE);

    info!(package = %name, %url, "metadata cache miss");

    let upstream_resp = state
        .http_client
        .get(&url)
        .headers(headers)
        .timeout(std::time::Duration::from_secs(
            state.config.upstream.metadata_timeout_secs,
        ))
        .send()
        .await
        .map_err(|e| AppError::BadGateway(anyhow!(e)))?;

    let status = upstream_resp.status();
    let cache_eligible = status.is_success();
    let content_encoding = upstream_resp
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let mut resp_headers = upstream_resp.headers().clone();
    resp_headers.remove(header::TRANSFER_ENCODING);

    if let Some(expected_len) = upstream_resp.content_length() {
        // Upstream declared the length: replay it and tee the body to the
        // client as it arrives.
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);
        let task_state = Arc::clone(state);
        state.tasks.spawn(async move {
            use futures::StreamExt;

            let mut stream = upstream_resp.bytes_stream();
            let mut buffered: Vec<u8> = Vec::with_capacity(expected_len as usize);
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        buffered.extend_from_slice(&chunk);
                        // A failed send means the client went away; keep
                        // reading so the strip pipeline still runs.
                        let _ = tx.send(Ok(chunk)).await;
                    }
                    Err(e) => {
                        warn!(package = %name, error = %e, "upstream body failed mid-stream");
                        let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                        return;
                    }
                }
            }
            drop(tx);
            finish_miss(
                task_state,
                name,
                Bytes::from(buffered),
                content_encoding,
                cache_eligible,
                started,
            )
            .await;
        });

        resp_headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(expected_len));
        let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
        *response.status_mut() = status;
        *response.headers_mut() = resp_headers;
        Ok(response)
    } else {
        // Length unknown (chunked upstream): buffer in full, then answer
        // with an exact content-length.
        let body = upstream_resp
            .bytes()
            .await
            .map_err(|e| AppError::BadGateway(anyhow!(e)))?;

        let task_state = Arc::clone(state);
        let task_body = body.clone();
        state.tasks.spawn(async move {
            finish_miss(
                task_state,
                name,
                task_body,
                content_encoding,
                cache_eligible,
                started,
            )
            .await;
        });

        resp_headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(body.len()));
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = resp_headers;
        Ok(response)
    }
}

/// Runs after the upstream body has been fully received: record the miss
/// and drive the strip pipeline, then hand the document to the
/// prefetcher.
async fn finish_miss(
    state: Arc<AppState>,
    name: String,
    body: Bytes,
    content_encoding: Option<String>,
    cache_eligible: bool,
    started: Instant,
) {
    state
        .stats
        .record_miss(&name, body.len() as u64, started.elapsed().as_millis() as u64)
        .await;

    if !cache_eligible {
        debug!(package = %name, "upstream answered non-2xx; not caching");
        return;
    }

    match strip::strip_and_cache(
        &state.store,
        &state.stats,
        &name,
        body,
        content_encoding.as_deref(),
    )
    .await
    {
        Ok(doc) => {
            if state.config.prefetch.enabled {
                state.prefetcher.spawn_walk(doc);
            }
        }
        Err(e) => warn!(package = %name, error = %e, "strip pipeline failed"),
    }
}

// ---------------------------------------------------------------------------
// Header and path helpers
// ---------------------------------------------------------------------------

/// Drop headers that must not be forwarded as-is: the client's `host`
/// (reqwest derives the upstream one from the URL) and the framing
/// headers hyper manages itself.
fn scrub_forwarded_headers(headers: &mut HeaderMap) {
    headers.remove(header::HOST);
    headers.remove(header::CONNECTION);
}

/// Minimal percent-decoding for URL path segments.  Returns `None` on
/// malformed escapes or non-UTF-8 results.
fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Handler-boundary error type that maps onto HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The request itself is unusable (malformed or traversal name).
    BadRequest(String),
    /// Upstream could not be reached before any response bytes were sent.
    BadGateway(anyhow::Error),
    /// An unexpected internal failure (cache corruption, I/O).
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::BadGateway(err) => {
                warn!(error = %err, "upstream unreachable");
                (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
