//! Per-request orchestration: validate, plan a read over cached and missing
//! spans, then splice disk and origin bytes to the client while teeing the
//! origin stream into the store.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use futures_util::StreamExt;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use tokio::sync::mpsc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tokio_stream::wrappers::ReceiverStream;

use crate::constants;
use crate::http_range::{self, RangeSpec};
use crate::manager::{CacheManager, StoreHandle};
use crate::metrics;
use crate::store::{ChunkStore, RangeReader};
use crate::upstream::{OriginClient, OriginResponse};

use super::{full_body, CacheStatus, ProxyBody};

pub struct ProxyState {
    pub manager: Arc<CacheManager>,
    pub origin: OriginClient,
    pub fill_deadline: Duration,
}

enum ServeError {
    /// Origin unreachable or answered outside 200/206 before any byte was
    /// sent to the client.
    Origin(anyhow::Error),
    /// Local cache I/O failure before streaming started.
    Cache(anyhow::Error),
}

pub async fn handle(req: Request<Incoming>, state: Arc<ProxyState>) -> Response<ProxyBody> {
    if req.method() != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    let Some(url) = origin_url(req.uri().query()) else {
        return text_response(StatusCode::BAD_REQUEST, "missing url parameter");
    };
    let range_header = req
        .headers()
        .get(http::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match serve(state, &url, range_header.as_deref()).await {
        Ok(resp) => resp,
        Err(ServeError::Origin(err)) => {
            log::warn!("origin failure for {url}: {err:#}");
            text_response(StatusCode::BAD_GATEWAY, "origin fetch failed")
        }
        Err(ServeError::Cache(err)) => {
            log::error!("cache failure for {url}: {err:#}");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "cache error")
        }
    }
}

async fn serve(
    state: Arc<ProxyState>,
    url: &str,
    range_header: Option<&str>,
) -> Result<Response<ProxyBody>, ServeError> {
    let handle = state.manager.acquire(url).await.map_err(ServeError::Cache)?;

    let (total_size, content_type) = resolve_identity(&state, &handle, url).await?;

    let (spec, status) = match range_header {
        None => (
            RangeSpec {
                start: 0,
                end: total_size,
            },
            StatusCode::OK,
        ),
        Some(header) => match http_range::parse_range(header, total_size) {
            Ok(spec) => (spec, StatusCode::PARTIAL_CONTENT),
            Err(_) => return Ok(not_satisfiable(total_size)),
        },
    };
    if spec.is_empty() {
        return Ok(build_response(status, &content_type, spec, total_size, CacheStatus::Hit, super::empty_body()));
    }

    // fast path: a fully cached range streams under a read guard, so
    // concurrent readers of the same store never wait on each other
    let read_guard = Arc::clone(&handle.store).read_owned().await;
    let cached = read_guard.cached_range_size(spec.start, spec.end);
    if cached == spec.len() {
        let reader = read_guard.read(spec.start, spec.end).map_err(ServeError::Cache)?;
        let body = spawn_cached(state, handle, read_guard, reader);
        return Ok(build_response(status, &content_type, spec, total_size, CacheStatus::Hit, body));
    }
    drop(read_guard);

    // a fill is needed; take the writer and re-plan, since the range may
    // have been filled while we waited
    let write_guard = Arc::clone(&handle.store).write_owned().await;
    let cached = write_guard.cached_range_size(spec.start, spec.end);
    if cached == spec.len() {
        let reader = write_guard.read(spec.start, spec.end).map_err(ServeError::Cache)?;
        let body = spawn_cached(state, handle, write_guard.downgrade(), reader);
        return Ok(build_response(status, &content_type, spec, total_size, CacheStatus::Hit, body));
    }

    let fill_start = spec.start + cached;
    let fill_spec = RangeSpec {
        start: fill_start,
        end: spec.end,
    };
    let origin_resp = state
        .origin
        .fetch(url, Some(&http_range::build_range_header(fill_spec)))
        .await
        .map_err(ServeError::Origin)?;
    if origin_resp.status == StatusCode::OK && fill_start > 0 {
        return Err(ServeError::Origin(anyhow::anyhow!(
            "origin ignored range request at offset {fill_start}"
        )));
    }

    let prefix = if cached > 0 {
        Some(
            write_guard
                .read(spec.start, fill_start)
                .map_err(ServeError::Cache)?,
        )
    } else {
        None
    };
    let cache_status = if cached > 0 { CacheStatus::PartHit } else { CacheStatus::Miss };
    let body = spawn_fill(state, handle, write_guard, prefix, fill_spec, origin_resp);
    Ok(build_response(status, &content_type, spec, total_size, cache_status, body))
}

/// Probes the origin for `totalSize`/`contentType` when the store is fresh.
/// Simultaneous requests for the same URL serialize behind the writer lock
/// until the probe lands.
async fn resolve_identity(
    state: &ProxyState,
    handle: &StoreHandle,
    url: &str,
) -> Result<(u64, String), ServeError> {
    {
        let store = handle.store.read().await;
        if store.total_size() > 0 {
            return Ok((store.total_size(), store.content_type().to_string()));
        }
    }
    let mut store = handle.store.write().await;
    if store.total_size() == 0 {
        let info = state.origin.probe(url).await.map_err(ServeError::Origin)?;
        store
            .set_identity(info.total_size, &info.content_type)
            .await
            .map_err(ServeError::Cache)?;
        log::debug!("probed {url}: {} bytes, {}", info.total_size, info.content_type);
    }
    Ok((store.total_size(), store.content_type().to_string()))
}

/// Streams a fully cached range from disk.
fn spawn_cached(
    state: Arc<ProxyState>,
    handle: Arc<StoreHandle>,
    guard: OwnedRwLockReadGuard<ChunkStore>,
    mut reader: RangeReader,
) -> ProxyBody {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(constants::READ_BUFFER_FRAMES);
    tokio::spawn(async move {
        let guard = guard;
        while let Some(item) = reader.next().await {
            match item {
                Ok(data) => {
                    metrics::add_bytes_served(data.len());
                    if tx.send(Ok(data)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    log::warn!("cache read failed: {err}");
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            }
        }
        drop(guard);
        state.manager.touch(&handle);
        state.manager.evict_if_needed().await;
    });
    channel_body(rx)
}

/// Streams the cached prefix, then tees the origin remainder into the client
/// and the store. Either consumer falling behind by more than its channel's
/// slack applies backpressure to the shared origin read; a vanished client
/// only cancels the client side, the fill keeps going until the origin ends
/// or the fill deadline passes.
fn spawn_fill(
    state: Arc<ProxyState>,
    handle: Arc<StoreHandle>,
    guard: OwnedRwLockWriteGuard<ChunkStore>,
    prefix: Option<RangeReader>,
    fill_spec: RangeSpec,
    mut origin: OriginResponse,
) -> ProxyBody {
    let (client_tx, client_rx) = mpsc::channel::<io::Result<Bytes>>(constants::TEE_BUFFER_FRAMES);
    tokio::spawn(async move {
        let mut client_tx = Some(client_tx);

        if let Some(mut reader) = prefix {
            while let Some(item) = reader.next().await {
                let Some(tx) = client_tx.take() else { break };
                match item {
                    Ok(data) => {
                        metrics::add_bytes_served(data.len());
                        if tx.send(Ok(data)).await.is_ok() {
                            client_tx = Some(tx);
                        }
                    }
                    Err(err) => {
                        log::warn!("cache read failed mid-splice: {err}");
                        let _ = tx.send(Err(err)).await;
                    }
                }
            }
        }

        let (store_tx, store_rx) = mpsc::channel::<io::Result<Bytes>>(constants::TEE_BUFFER_FRAMES);
        let fill_start = fill_spec.start;
        let writer = tokio::spawn(async move {
            let mut store = guard;
            if let Err(err) = store.write_stream(ReceiverStream::new(store_rx), fill_start).await {
                log::warn!("cache fill at offset {fill_start} failed: {err:#}");
            }
        });

        let mut store_tx = Some(store_tx);
        let mut client_remaining = fill_spec.len();
        let mut client_gone_at = client_tx.is_none().then(Instant::now);
        loop {
            let frame = match origin.frame().await {
                None => break,
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    log::warn!("origin stream failed mid-response: {err}");
                    if let Some(tx) = client_tx.take() {
                        let _ = tx.send(Err(err)).await;
                    }
                    break;
                }
            };

            if let Some(tx) = client_tx.take() {
                let take = (frame.len() as u64).min(client_remaining) as usize;
                let slice = frame.slice(0..take);
                if tx.send(Ok(slice)).await.is_err() {
                    // client disconnected; keep filling the cache
                    client_gone_at = Some(Instant::now());
                } else {
                    metrics::add_bytes_served(take);
                    client_remaining -= take as u64;
                    if client_remaining > 0 {
                        client_tx = Some(tx);
                    } else {
                        // response complete; anything further only feeds the store
                        client_gone_at = Some(Instant::now());
                    }
                }
            }

            if let Some(tx) = store_tx.take() {
                if tx.send(Ok(frame)).await.is_ok() {
                    store_tx = Some(tx);
                }
            }

            if client_tx.is_none() && store_tx.is_none() {
                break;
            }
            if let Some(gone) = client_gone_at {
                if gone.elapsed() > state.fill_deadline {
                    log::debug!("abandoning background fill after deadline");
                    break;
                }
            }
        }
        drop(client_tx);
        drop(store_tx);
        let _ = writer.await;

        state.manager.touch(&handle);
        state.manager.evict_if_needed().await;
    });
    channel_body(client_rx)
}

fn channel_body(rx: mpsc::Receiver<io::Result<Bytes>>) -> ProxyBody {
    let stream = ReceiverStream::new(rx).map(|item| item.map(Frame::data));
    BodyExt::boxed(StreamBody::new(stream))
}

fn build_response(
    status: StatusCode,
    content_type: &str,
    spec: RangeSpec,
    total: u64,
    cache_status: CacheStatus,
    body: ProxyBody,
) -> Response<ProxyBody> {
    metrics::record_status(status);
    metrics::record_cache_status(cache_status.as_str());
    let mut builder = Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, content_type)
        .header(http::header::CONTENT_LENGTH, spec.len().to_string())
        .header(http::header::ACCEPT_RANGES, "bytes")
        .header(constants::CACHE_STATUS_KEY, cache_status.as_str());
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            http::header::CONTENT_RANGE,
            http_range::build_content_range(spec.start, spec.end - 1, total),
        );
    }
    builder.body(body).unwrap()
}

fn not_satisfiable(total: u64) -> Response<ProxyBody> {
    metrics::record_status(StatusCode::RANGE_NOT_SATISFIABLE);
    Response::builder()
        .status(StatusCode::RANGE_NOT_SATISFIABLE)
        .header(http::header::CONTENT_RANGE, http_range::build_unsatisfied_range(total))
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body("requested range not satisfiable"))
        .unwrap()
}

fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    metrics::record_status(status);
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body.to_string()))
        .unwrap()
}

fn origin_url(query: Option<&str>) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key != "url" {
            continue;
        }
        let decoded = urlencoding::decode(value).ok()?;
        let decoded = decoded.trim();
        if decoded.is_empty() {
            return None;
        }
        return Some(decoded.to_string());
    }
    None
}
