use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::constants;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub pidfile: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub origin: Origin,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.cache.root.trim().is_empty() {
            return Err(anyhow!("cache.root is required"));
        }
        if self.cache.max_total_bytes == 0 {
            return Err(anyhow!("cache.max_total_bytes must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    /// Rotation threshold in MiB; 0 disables rotation.
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default)]
    pub access_log: Option<AccessLog>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            access_log: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct AccessLog {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct Cache {
    #[serde(default = "default_cache_root")]
    pub root: String,
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            max_total_bytes: default_max_total_bytes(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Origin {
    /// Abort the fetch when the origin sends nothing for this long.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Cap on how long a cache fill may keep running once the client is gone.
    #[serde(default = "default_fill_deadline", with = "humantime_serde")]
    pub fill_deadline: Duration,
}

impl Default for Origin {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
            fill_deadline: default_fill_deadline(),
        }
    }
}

fn default_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_cache_root() -> String {
    "cache".to_string()
}

fn default_max_total_bytes() -> u64 {
    constants::DEFAULT_MAX_TOTAL_BYTES
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_fill_deadline() -> Duration {
    Duration::from_secs(60)
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(&raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })
    .with_context(|| format!("parse config {}", path.display()))?;

    Ok((cfg, ignored))
}
