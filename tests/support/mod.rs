#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::OnceCell;

use larder::config::{Bootstrap, Cache, Logger, Origin, Server};

static START: OnceCell<PathBuf> = OnceCell::const_new();

/// Starts one proxy instance per test binary and returns its cache root.
pub async fn ensure_proxy(port: u16, max_total_bytes: u64) -> PathBuf {
    START
        .get_or_init(|| async move {
            let root = tempfile::tempdir().expect("tempdir").into_path();
            let cfg = Bootstrap {
                strict: false,
                pidfile: None,
                logger: Logger::default(),
                server: Server {
                    addr: format!("127.0.0.1:{port}"),
                    access_log: None,
                },
                cache: Cache {
                    root: root.to_string_lossy().into_owned(),
                    max_total_bytes,
                },
                origin: Origin::default(),
            };
            std::thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");
                runtime.block_on(async move {
                    let _ = larder::server::run(Arc::new(cfg)).await;
                });
            });
            tokio::time::sleep(Duration::from_millis(200)).await;
            root
        })
        .await
        .clone()
}

pub fn gen_bytes(size: usize) -> Bytes {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Polls `cond` until it holds or the deadline passes.
pub async fn wait_until<F>(what: &str, mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }
}

/// Sends one request to the proxy and collects the streamed body.
pub async fn proxy_request(
    port: u16,
    origin_url: &str,
    range: Option<&str>,
    method: Method,
) -> TestResponse {
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().expect("proxy addr");
    let stream = tokio::net::TcpStream::connect(addr).await.expect("connect proxy");
    let io = TokioIo::new(stream);
    let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let path = format!("/?url={}", urlencoding::encode(origin_url));
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(http::header::HOST, format!("127.0.0.1:{port}"));
    if let Some(range) = range {
        builder = builder.header(http::header::RANGE, range);
    }
    let req = builder.body(Full::new(Bytes::new())).expect("request");

    let resp = sender.send_request(req).await.expect("send request");
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.expect("body").to_bytes();

    TestResponse { status, headers, body }
}

pub async fn proxy_get(port: u16, origin_url: &str, range: Option<&str>) -> TestResponse {
    proxy_request(port, origin_url, range, Method::GET).await
}

/// Range-aware mock origin serving one payload, recording every request.
pub struct OriginServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl OriginServer {
    pub async fn start(payload: Bytes, content_type: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let hits = Arc::new(AtomicUsize::new(0));
        let ranges = Arc::new(Mutex::new(Vec::new()));

        let content_type = content_type.to_string();
        let hits_srv = Arc::clone(&hits);
        let ranges_srv = Arc::clone(&ranges);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let payload = payload.clone();
                        let content_type = content_type.clone();
                        let hits = Arc::clone(&hits_srv);
                        let ranges = Arc::clone(&ranges_srv);
                        tokio::spawn(async move {
                            let service = service_fn(move |req: Request<Incoming>| {
                                hits.fetch_add(1, Ordering::SeqCst);
                                let range = req
                                    .headers()
                                    .get(http::header::RANGE)
                                    .and_then(|v| v.to_str().ok())
                                    .map(str::to_string);
                                ranges.lock().expect("ranges").push(range.clone());
                                let resp = serve_payload(&payload, &content_type, range.as_deref());
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            hits,
            ranges,
            shutdown: Some(shutdown),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn last_range(&self) -> Option<String> {
        self.ranges.lock().expect("ranges").last().cloned().flatten()
    }
}

impl Drop for OriginServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn serve_payload(payload: &Bytes, content_type: &str, range: Option<&str>) -> Response<Full<Bytes>> {
    let total = payload.len() as u64;
    let parsed = range.and_then(|header| {
        let rest = header.strip_prefix("bytes=")?;
        let (start_str, end_str) = rest.split_once('-')?;
        let start: u64 = start_str.parse().ok()?;
        let end = if end_str.is_empty() {
            total - 1
        } else {
            end_str.parse::<u64>().ok()?.min(total - 1)
        };
        if start > end || start >= total {
            return None;
        }
        Some((start, end))
    });

    match parsed {
        Some((start, end)) => {
            let body = payload.slice(start as usize..=end as usize);
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(http::header::CONTENT_TYPE, content_type)
                .header(http::header::CONTENT_LENGTH, body.len().to_string())
                .header(
                    http::header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, total),
                )
                .body(Full::new(body))
                .unwrap()
        }
        None => Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, content_type)
            .header(http::header::CONTENT_LENGTH, payload.len().to_string())
            .body(Full::new(payload.clone()))
            .unwrap(),
    }
}

/// Sum of chunk bytes across every store directory under `root`.
pub fn disk_usage(root: &PathBuf) -> u64 {
    let mut total = 0;
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };
    for entry in entries.flatten() {
        let data = entry.path().join("data");
        let Ok(files) = std::fs::read_dir(&data) else {
            continue;
        };
        for file in files.flatten() {
            if let Ok(meta) = file.metadata() {
                total += meta.len();
            }
        }
    }
    total
}

/// Number of store directories under `root`.
pub fn store_count(root: &PathBuf) -> usize {
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| e.path().join("metadata.json").exists())
        .count()
}
