use std::sync::OnceLock;

use http::StatusCode;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn requests_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new("larder_requests_total", "Total requests").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn requests_status_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("larder_requests_status_total", "Requests by status"),
            &["code"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_status_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("larder_cache_status_total", "Responses by cache status"),
            &["status"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn origin_requests_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("larder_origin_requests_total", "Origin fetches by outcome"),
            &["code"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn bytes_served_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new("larder_bytes_served_total", "Body bytes sent to clients").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn evictions_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new("larder_evictions_total", "Stores cleared by eviction").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn store_bytes() -> &'static IntGauge {
    static METRIC: OnceLock<IntGauge> = OnceLock::new();
    METRIC.get_or_init(|| {
        let gauge = IntGauge::new("larder_store_bytes", "Bytes held across all stores").unwrap();
        registry().register(Box::new(gauge.clone())).unwrap();
        gauge
    })
}

pub fn record_status(status: StatusCode) {
    requests_total().inc();
    requests_status_total().with_label_values(&[status.as_str()]).inc();
}

pub fn record_cache_status(status: &str) {
    cache_status_total().with_label_values(&[status]).inc();
}

pub fn record_origin(code: &str) {
    origin_requests_total().with_label_values(&[code]).inc();
}

pub fn add_bytes_served(n: usize) {
    bytes_served_total().inc_by(n as u64);
}

pub fn record_eviction() {
    evictions_total().inc();
}

pub fn set_store_bytes(n: u64) {
    store_bytes().set(n as i64);
}

pub fn render() -> String {
    let families = registry().gather();
    let mut out = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&families, &mut out).is_err() {
        return String::new();
    }
    String::from_utf8(out).unwrap_or_default()
}
