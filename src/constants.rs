pub const CACHE_STATUS_KEY: &str = "X-Cache";

/// Fixed chunk size for every store: 5 MiB.
pub const CHUNK_SIZE: u64 = 5 * 1024 * 1024;

pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 1024 * 1024 * 1024;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Slack frames per tee channel. Origin frames are small (tens of KiB), so
/// this bounds each in-flight side to roughly four chunks.
pub const TEE_BUFFER_FRAMES: usize = 256;

/// Slack frames when streaming cached chunks to the client; each frame is up
/// to one full chunk.
pub const READ_BUFFER_FRAMES: usize = 4;
