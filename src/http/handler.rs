//! Main axum router and HTTP request handlers for the caching proxy.
//!
//! Routes:
//! - `GET /proxy/<repo>/<path…>` - read-through cache lookup
//! - `GET /metrics`              - Prometheus metrics
//!
//! The proxy path implements a hit/miss state machine. Hits stream the
//! cached file. Misses stream the upstream body to the client while teeing
//! it into a temp file that is atomically materialised once the transfer
//! completes; cache-side failures never interrupt the client response.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use prometheus_client::metrics::counter::Counter;
use tokio::io::AsyncWriteExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::cache::is_unsafe_filename;
use crate::cache::tempfile::TempFile;
use crate::config::Repo;
use crate::disk::update_free_disk_space;
use crate::metrics::{InFlight, Metrics};
use crate::AppState;

/// Chunk bound for the miss-path tee loop.
const TEE_CHUNK_SIZE: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/proxy/", any(handle_proxy_bare))
        .route("/proxy/{*rest}", any(handle_proxy))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Proxy handler
// ---------------------------------------------------------------------------

/// `GET /proxy/` with nothing after the prefix.
async fn handle_proxy_bare(State(state): State<Arc<AppState>>, method: Method) -> Response {
    let metrics = &state.metrics.metrics;
    let _in_flight = InFlight::new(&metrics.requests_in_progress);
    metrics.error_count.inc();
    if method != Method::GET {
        return method_not_allowed();
    }
    need_repo_response()
}

/// `GET /proxy/<repo>/<path…>`
async fn handle_proxy(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(rest): Path<String>,
) -> Response {
    let metrics = &state.metrics.metrics;
    let in_flight = InFlight::new(&metrics.requests_in_progress);
    debug!(path = %rest, "request handler started");

    if method != Method::GET {
        metrics.error_count.inc();
        info!(%method, path = %rest, "method not allowed");
        return method_not_allowed();
    }

    let Some((reponame, filename)) = rest.split_once('/') else {
        metrics.error_count.inc();
        info!(path = %rest, "request path carries no repo name");
        return need_repo_response();
    };

    let Some(repo) = state.repos.get(reponame) else {
        metrics.error_count.inc();
        info!(repo = %reponame, "requested repo not configured");
        return (
            StatusCode::NOT_FOUND,
            format!("Repo {reponame} not configured\n"),
        )
            .into_response();
    };

    if is_unsafe_filename(filename) {
        metrics.error_count.inc();
        warn!(repo = %reponame, file = %filename, "prohibited byte sequence in filename");
        return (
            StatusCode::BAD_REQUEST,
            "Prohibited byte sequence in filename\n",
        )
            .into_response();
    }

    // Any open failure, not just not-found, is treated as a miss.
    let final_path = state.cache.final_path(reponame, filename);
    match tokio::fs::File::open(&final_path).await {
        Ok(file) => handle_hit(&state, filename, file, in_flight).await,
        Err(_) => handle_miss(&state, reponame, repo, filename, in_flight).await,
    }
}

// ---------------------------------------------------------------------------
// Hit path
// ---------------------------------------------------------------------------

/// Stream an already-cached file. The bytes delivered are exactly the bytes
/// of the file at the moment it was opened; a concurrent GC unlink does not
/// disturb the open descriptor.
async fn handle_hit(
    state: &AppState,
    filename: &str,
    file: tokio::fs::File,
    in_flight: InFlight,
) -> Response {
    let metrics = &state.metrics.metrics;
    let hit_flight = InFlight::new(&metrics.hit_requests_in_progress);

    let size = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(err) => {
            metrics.error_count.inc();
            warn!(file = %filename, error = %err, "failed to stat cached file");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Could not stat cached file\n",
            )
                .into_response();
        }
    };

    info!(file = %filename, size, "cache hit, serving");
    metrics.hit_count.inc();
    metrics.hit_bytes.inc_by(size);

    let stream = HitStream {
        inner: ReaderStream::new(file),
        filename: filename.to_string(),
        size,
        transferred: 0,
        started: Instant::now(),
        finished: false,
        error_count: metrics.error_count.clone(),
        _guards: vec![in_flight, hit_flight],
    };
    let mut response = Response::new(Body::from_stream(stream));
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    response
}

/// Streams a cached file while holding the in-progress gauges for the whole
/// transfer. A mid-transfer read failure aborts the response and is counted
/// as an error; completion is logged with the byte count and elapsed time.
struct HitStream {
    inner: ReaderStream<tokio::fs::File>,
    filename: String,
    size: u64,
    transferred: u64,
    started: Instant,
    finished: bool,
    error_count: Counter,
    _guards: Vec<InFlight>,
}

impl Stream for HitStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.transferred += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finished = true;
                this.error_count.inc();
                warn!(
                    file = %this.filename,
                    bytes = this.transferred,
                    size = this.size,
                    error = %err,
                    "cache hit read failed mid-transfer, aborting response"
                );
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if !this.finished {
                    this.finished = true;
                    info!(
                        file = %this.filename,
                        bytes = this.transferred,
                        elapsed = ?this.started.elapsed(),
                        "cache hit served"
                    );
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// ---------------------------------------------------------------------------
// Miss path
// ---------------------------------------------------------------------------

/// Fetch from upstream, streaming to the client and teeing into the cache.
async fn handle_miss(
    state: &Arc<AppState>,
    reponame: &str,
    repo: &Repo,
    filename: &str,
    in_flight: InFlight,
) -> Response {
    let metrics = &state.metrics.metrics;
    let miss_flight = InFlight::new(&metrics.miss_requests_in_progress);
    metrics.miss_count.inc();

    let url = format!("{}{}", repo.upstream_base, filename);
    let upstream_resp = match state.http_client.get(&url).send().await {
        Ok(resp) => resp,
        Err(err) => {
            metrics.upstream_error_count.inc();
            warn!(%url, error = %err, "upstream request failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Proxy request {filename} failed\n"),
            )
                .into_response();
        }
    };

    let status = upstream_resp.status();
    if status != reqwest::StatusCode::OK {
        metrics.upstream_error_count.inc();
        info!(%url, %status, "upstream returned error status");
        // Relay the upstream status with no body.
        return StatusCode::from_u16(status.as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY)
            .into_response();
    }

    let content_length = upstream_resp.headers().get(header::CONTENT_LENGTH).cloned();

    // A temp-file failure downgrades to stream-only: the client is still
    // served, nothing is cached.
    let temp = match TempFile::create(
        &state.cache.temp_dir(reponame),
        filename,
        state.cache.final_path(reponame, filename),
    ) {
        Ok(temp) => Some(temp),
        Err(err) => {
            metrics.error_count.inc();
            warn!(
                repo = %reponame,
                file = %filename,
                error = %err,
                "temp file creation failed, streaming without caching"
            );
            None
        }
    };

    info!(
        repo = %reponame,
        file = %filename,
        expected = ?content_length,
        "cache miss, serving from upstream"
    );

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let tee = TeeTask {
        state: Arc::clone(state),
        repo: reponame.to_string(),
        filename: filename.to_string(),
        temp,
        tx,
        _guards: vec![in_flight, miss_flight],
    };
    tokio::spawn(tee.run(upstream_resp));

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    if let Some(value) = content_length {
        response.headers_mut().insert(header::CONTENT_LENGTH, value);
    }
    response
}

/// The miss-path streaming task: owns the upstream response, the temp file,
/// the client body sender, and the in-progress guards, so accounting and
/// materialisation happen when the transfer actually ends.
struct TeeTask {
    state: Arc<AppState>,
    repo: String,
    filename: String,
    temp: Option<TempFile>,
    tx: tokio::sync::mpsc::Sender<Result<Bytes, std::io::Error>>,
    _guards: Vec<InFlight>,
}

impl TeeTask {
    async fn run(mut self, upstream_resp: reqwest::Response) {
        let metrics = Arc::clone(&self.state.metrics.metrics);
        let had_temp = self.temp.is_some();

        if self.tee(&metrics, upstream_resp).await {
            if let Some(temp) = self.temp.take() {
                self.materialise(&metrics, temp).await;
            }
        }
        // An aborted or abandoned temp file cleans itself up when dropped.

        if had_temp {
            update_free_disk_space(&metrics, &self.state.cache.root);
        }
    }

    /// Pump upstream chunks to the client and the temp file. Returns true
    /// when the upstream body completed and the client received every byte.
    async fn tee(&mut self, metrics: &Metrics, upstream_resp: reqwest::Response) -> bool {
        let mut stream = upstream_resp.bytes_stream();
        let mut total: u64 = 0;

        while let Some(next) = stream.next().await {
            let chunk = match next {
                Ok(chunk) => chunk,
                Err(err) => {
                    metrics.upstream_error_count.inc();
                    warn!(
                        file = %self.filename,
                        bytes = total,
                        error = %err,
                        "upstream read failed mid-stream, aborting response"
                    );
                    let _ = self.tx.send(Err(std::io::Error::other(err))).await;
                    return false;
                }
            };

            let mut offset = 0;
            while offset < chunk.len() {
                let end = usize::min(offset + TEE_CHUNK_SIZE, chunk.len());
                let part = chunk.slice(offset..end);
                offset = end;

                // Client first; a client failure abandons the response and
                // the cache file together.
                if self.tx.send(Ok(part.clone())).await.is_err() {
                    metrics.error_count.inc();
                    warn!(
                        file = %self.filename,
                        bytes = total,
                        "client write failed, aborting response and cache write"
                    );
                    return false;
                }

                if let Some(temp) = self.temp.as_mut() {
                    if let Err(err) = temp.file_mut().write_all(&part).await {
                        metrics.error_count.inc();
                        warn!(
                            file = %self.filename,
                            bytes = total,
                            error = %err,
                            "cache file write failed, continuing without caching"
                        );
                        self.temp = None;
                    }
                }

                total += part.len() as u64;
            }
        }

        metrics.miss_bytes.inc_by(total);
        debug!(file = %self.filename, bytes = total, "finished streaming from upstream");
        true
    }

    /// Create the final parent directory and link/rename the temp file into
    /// place. The response has already been served; failures only log.
    async fn materialise(&self, metrics: &Metrics, temp: TempFile) {
        if let Err(err) = self
            .state
            .cache
            .ensure_final_parent(&self.repo, &self.filename)
            .await
        {
            metrics.error_count.inc();
            warn!(
                repo = %self.repo,
                file = %self.filename,
                error = %err,
                "failed to create final subdirectory for cache file"
            );
            return;
        }
        match temp.finalize().await {
            Ok(()) => debug!(repo = %self.repo, file = %self.filename, "cache file materialised"),
            Err(err) => {
                metrics.error_count.inc();
                warn!(
                    repo = %self.repo,
                    file = %self.filename,
                    error = %err,
                    "failed to materialise cache file"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics endpoint
// ---------------------------------------------------------------------------

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry) {
        Ok(()) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "GET")],
        "",
    )
        .into_response()
}

fn need_repo_response() -> Response {
    (
        StatusCode::NOT_FOUND,
        "Need to provide repo name i.e. /proxy/myrepo/...\n",
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
