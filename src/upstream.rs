//! Streaming client for the remote origin.

use std::io;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;

use crate::constants;
use crate::http_range::parse_content_range;
use crate::metrics;

#[derive(Clone)]
pub struct OriginClient {
    client: Client<HttpConnector, Empty<Bytes>>,
    read_timeout: Duration,
}

/// What the probe learns about a resource.
pub struct ProbeInfo {
    pub total_size: u64,
    pub content_type: String,
}

pub struct OriginResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub content_length: Option<u64>,
    /// Authoritative resource length: the `/total` suffix of `Content-Range`
    /// on `206`, `Content-Length` on `200`.
    pub total_size: Option<u64>,
    body: Incoming,
    read_timeout: Duration,
}

impl OriginClient {
    pub fn new(read_timeout: Duration) -> Self {
        let connector = HttpConnector::new();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client, read_timeout }
    }

    /// Issues a `GET` with the given `Range` header, if any. Statuses other
    /// than `200`/`206` are fetch failures; the handler maps every fetch
    /// failure to `502`.
    pub async fn fetch(&self, url: &str, range: Option<&str>) -> Result<OriginResponse> {
        let uri: Uri = url.parse().with_context(|| format!("parse origin url {url}"))?;
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if let Some(range) = range {
            builder = builder.header(http::header::RANGE, range);
        }
        let req = builder.body(Empty::new()).context("build origin request")?;

        let resp = match timeout(self.read_timeout, self.client.request(req)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                metrics::record_origin("error");
                return Err(err).with_context(|| format!("fetch {url}"));
            }
            Err(_) => {
                metrics::record_origin("timeout");
                return Err(anyhow!("origin request to {url} timed out"));
            }
        };

        let status = resp.status();
        metrics::record_origin(status.as_str());
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(anyhow!("origin {url} returned {status}"));
        }

        let headers = resp.headers();
        let content_type = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(constants::DEFAULT_CONTENT_TYPE)
            .to_string();
        let content_length = headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let total_size = if status == StatusCode::PARTIAL_CONTENT {
            headers
                .get(http::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
                .map(|cr| cr.size)
        } else {
            content_length
        };

        Ok(OriginResponse {
            status,
            content_type,
            content_length,
            total_size,
            body: resp.into_body(),
            read_timeout: self.read_timeout,
        })
    }

    /// Discovers `totalSize` and `contentType` for a fresh URL with a
    /// `bytes=0-` request. The response body is dropped unread.
    pub async fn probe(&self, url: &str) -> Result<ProbeInfo> {
        let resp = self.fetch(url, Some("bytes=0-")).await?;
        let total_size = resp
            .total_size
            .ok_or_else(|| anyhow!("origin {url} reported no length"))?;
        Ok(ProbeInfo {
            total_size,
            content_type: resp.content_type,
        })
    }
}

impl OriginResponse {
    /// Next data frame, or `None` at end of stream. Read inactivity beyond
    /// the configured timeout aborts the fetch.
    pub async fn frame(&mut self) -> Option<io::Result<Bytes>> {
        loop {
            match timeout(self.read_timeout, self.body.frame()).await {
                Err(_) => {
                    return Some(Err(io::Error::new(io::ErrorKind::TimedOut, "origin read timed out")))
                }
                Ok(None) => return None,
                Ok(Some(Err(err))) => return Some(Err(io::Error::other(err))),
                Ok(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data() {
                        if !data.is_empty() {
                            return Some(Ok(data));
                        }
                    }
                    // trailers and empty frames are skipped
                }
            }
        }
    }
}
