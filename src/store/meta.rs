use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const METADATA_FILE: &str = "metadata.json";
pub const DATA_DIR: &str = "data";
pub const TEMP_SUFFIX: &str = ".temp";

/// 32-char lowercase hex MD5 of the origin URL. Purely a filesystem-safe
/// identifier; collisions are not defended against.
pub fn fingerprint(url: &str) -> String {
    format!("{:x}", md5::compute(url.as_bytes()))
}

pub fn is_fingerprint(name: &str) -> bool {
    name.len() == 32 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

pub fn chunk_path(root: &Path, index: u64) -> PathBuf {
    root.join(DATA_DIR).join(format!("chunk_{index}"))
}

pub fn chunk_temp_path(root: &Path, index: u64) -> PathBuf {
    root.join(DATA_DIR).join(format!("chunk_{index}{TEMP_SUFFIX}"))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRecord {
    pub index: u64,
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub complete: bool,
}

/// On-disk shape of `metadata.json`. Rewritten whole on every chunk flush,
/// always through a temp file and rename.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StoreMeta {
    pub total_size: u64,
    pub content_type: String,
    pub chunk_size: u64,
    pub url: String,
    pub chunks: Vec<ChunkRecord>,
}
