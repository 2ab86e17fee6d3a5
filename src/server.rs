use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::access_log::AccessLogger;
use crate::config::Bootstrap;
use crate::constants;
use crate::manager::CacheManager;
use crate::metrics;
use crate::proxy::handler;
use crate::proxy::{full_body, ProxyBody, ProxyState};
use crate::upstream::OriginClient;

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let manager = CacheManager::open(&cfg.cache.root, cfg.cache.max_total_bytes).await?;
    let origin = OriginClient::new(cfg.origin.read_timeout);
    let proxy = Arc::new(ProxyState {
        manager,
        origin,
        fill_deadline: cfg.origin.fill_deadline,
    });
    let access_logger = build_access_logger(&cfg);

    let state = Arc::new(AppState {
        proxy,
        access_logger,
    });

    let listener = bind_listener(&cfg.server.addr)?;
    log::info!("listening on {}", cfg.server.addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);

    serve(listener, shutdown_rx, state).await
}

struct AppState {
    proxy: Arc<ProxyState>,
    access_logger: Option<Arc<AccessLogger>>,
}

fn bind_listener(addr: &str) -> Result<TcpListener> {
    let bind_addr = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    let socket_addr: SocketAddr = bind_addr.parse().context("parse server.addr")?;
    let listener = std::net::TcpListener::bind(socket_addr).context("bind tcp")?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener).context("register listener")
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(_) => std::future::pending().await,
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate => {}
        }
        log::info!("shutdown signal received");
        let _ = shutdown.send(true);
    });
}

async fn serve(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<AppState>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, peer) = res.context("accept tcp")?;
                let peer = peer.to_string();
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        let peer = peer.clone();
                        async move { Ok::<_, hyper::Error>(handle(req, &peer, state).await) }
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("connection closed: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle(req: Request<Incoming>, peer: &str, state: Arc<AppState>) -> Response<ProxyBody> {
    let info = RequestInfo::from_request(&req, peer);
    let resp = match req.uri().path() {
        "/" => handler::handle(req, Arc::clone(&state.proxy)).await,
        "/healthz" => text_response(StatusCode::OK, "ok"),
        "/metrics" => text_response(StatusCode::OK, &metrics::render()),
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    log_access(&state, &info, &resp);
    resp
}

fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(body.to_string()))
        .unwrap()
}

struct RequestInfo {
    method: String,
    uri: String,
    client_ip: String,
    range: String,
    user_agent: String,
    protocol: String,
    start_at: std::time::Instant,
}

impl RequestInfo {
    fn from_request(req: &Request<Incoming>, peer: &str) -> Self {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string()
        };
        let client_ip = req
            .headers()
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(peer)
            .to_string();
        Self {
            method: req.method().to_string(),
            uri: req.uri().to_string(),
            client_ip,
            range: header("Range"),
            user_agent: header("User-Agent"),
            protocol: format!("{:?}", req.version()),
            start_at: std::time::Instant::now(),
        }
    }
}

fn log_access(state: &AppState, req: &RequestInfo, resp: &Response<ProxyBody>) {
    let logger = match &state.access_logger {
        Some(logger) => logger,
        None => return,
    };
    let resp_header = |name: &str| {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    };
    let duration_ms = req.start_at.elapsed().as_millis();
    let line = format!(
        "{} [{}] \"{} {} {}\" {} {} {}ms range={} cache={} ua={}\n",
        req.client_ip,
        chrono::Local::now().format("%d/%b/%Y:%H:%M:%S %z"),
        req.method,
        req.uri,
        req.protocol,
        resp.status().as_u16(),
        resp_header("Content-Length"),
        duration_ms,
        normalize_field(&req.range),
        resp_header(constants::CACHE_STATUS_KEY),
        normalize_field(&req.user_agent),
    );
    logger.log_line(&line);
}

fn normalize_field(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.replace(' ', "+")
    }
}

fn build_access_logger(cfg: &Bootstrap) -> Option<Arc<AccessLogger>> {
    let access = cfg.server.access_log.as_ref()?;
    if !access.enabled {
        return None;
    }
    match AccessLogger::new(Some(&access.path)) {
        Ok(logger) => Some(Arc::new(logger)),
        Err(err) => {
            log::warn!("failed to init access log: {err}");
            None
        }
    }
}
