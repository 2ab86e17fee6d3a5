pub mod access_log;
pub mod config;
pub mod constants;
pub mod http_range;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod store;
pub mod upstream;
