//! Chunked on-disk store for one cached resource.
//!
//! A store is a directory holding fixed-size chunk files under `data/` plus a
//! `metadata.json` sidecar. Chunk files are published by renaming a `.temp`
//! file into place, so readers only ever observe fully written chunks.

use std::collections::BTreeMap;
use std::io::{self, ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::constants;

pub mod meta;

use meta::{chunk_path, chunk_temp_path, ChunkRecord, StoreMeta, DATA_DIR, METADATA_FILE, TEMP_SUFFIX};

pub struct ChunkStore {
    root: PathBuf,
    chunk_size: u64,
    total_size: u64,
    content_type: String,
    url: String,
    chunks: BTreeMap<u64, ChunkRecord>,
}

impl ChunkStore {
    /// Opens (or creates) the store rooted at `root`. An existing
    /// `metadata.json` is parsed and revalidated against the chunk files on
    /// disk; stale `.temp` files are scrubbed. Only I/O errors that prevent
    /// directory creation are fatal.
    pub async fn open(root: impl Into<PathBuf>, url: &str) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(DATA_DIR))
            .await
            .with_context(|| format!("create store dir {}", root.display()))?;

        let mut store = Self {
            root,
            chunk_size: constants::CHUNK_SIZE,
            total_size: 0,
            content_type: String::new(),
            url: url.to_string(),
            chunks: BTreeMap::new(),
        };
        store.load_meta().await;
        store.scrub_temp().await;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Records the identity discovered by the probe and persists it.
    pub async fn set_identity(&mut self, total_size: u64, content_type: &str) -> Result<()> {
        self.total_size = total_size;
        self.content_type = content_type.to_string();
        self.persist_meta().await
    }

    async fn load_meta(&mut self) {
        let path = self.root.join(METADATA_FILE);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                log::warn!("read {} failed: {err}", path.display());
                return;
            }
        };
        let meta: StoreMeta = match serde_json::from_slice(&raw) {
            Ok(meta) => meta,
            Err(err) => {
                log::warn!("discarding corrupt {}: {err}", path.display());
                return;
            }
        };

        self.total_size = meta.total_size;
        self.content_type = meta.content_type;
        if meta.chunk_size > 0 {
            self.chunk_size = meta.chunk_size;
        }
        if !meta.url.is_empty() {
            self.url = meta.url;
        }
        for record in meta.chunks {
            // missing or resized chunk files are dropped from the map
            match fs::metadata(chunk_path(&self.root, record.index)).await {
                Ok(stat) if stat.len() == record.size => {
                    self.chunks.insert(record.index, record);
                }
                Ok(_) | Err(_) => {}
            }
        }
    }

    async fn scrub_temp(&self) {
        for dir in [self.root.clone(), self.root.join(DATA_DIR)] {
            let Ok(mut entries) = fs::read_dir(&dir).await else { continue };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                if name.to_string_lossy().ends_with(TEMP_SUFFIX) {
                    let _ = fs::remove_file(entry.path()).await;
                }
            }
        }
    }

    /// True iff every chunk touched by `[start, end)` is complete and
    /// gap-free, with a known total size and content type.
    pub fn range_cached(&self, start: u64, end: u64) -> bool {
        if self.total_size == 0 || self.content_type.is_empty() {
            return false;
        }
        if start >= end || end > self.total_size {
            return false;
        }
        let first = start / self.chunk_size;
        let last = (end - 1) / self.chunk_size;
        let mut prev_end = None;
        for index in first..=last {
            let Some(chunk) = self.chunks.get(&index) else {
                return false;
            };
            if !chunk.complete {
                return false;
            }
            if index == first && chunk.start > start {
                return false;
            }
            if index == last && chunk.end < end {
                return false;
            }
            if let Some(prev) = prev_end {
                if chunk.start != prev {
                    return false;
                }
            }
            prev_end = Some(chunk.end);
        }
        true
    }

    /// Length of the contiguous locally-present prefix of `[start, end)`,
    /// counting from `start`. The splicer uses this to pick the hand-off
    /// point between cache and origin.
    pub fn cached_range_size(&self, start: u64, end: u64) -> u64 {
        if self.total_size == 0 || start >= end {
            return 0;
        }
        let end = end.min(self.total_size);
        let mut pos = start;
        while pos < end {
            let index = pos / self.chunk_size;
            match self.chunks.get(&index) {
                Some(chunk) if chunk.complete && chunk.start <= pos && chunk.end > pos => {
                    pos = chunk.end.min(end);
                }
                _ => break,
            }
        }
        pos - start
    }

    /// Total bytes held by complete chunks.
    pub fn size(&self) -> u64 {
        self.chunks.values().filter(|c| c.complete).map(|c| c.size).sum()
    }

    /// Plans a read over `[start, end)`. Fails if any chunk in the span is
    /// missing; callers are expected to have checked `range_cached` first.
    pub fn read(&self, start: u64, end: u64) -> Result<RangeReader> {
        if start >= end {
            return Err(anyhow!("empty read range {start}..{end}"));
        }
        let first = start / self.chunk_size;
        let last = (end - 1) / self.chunk_size;
        for index in first..=last {
            let complete = self.chunks.get(&index).map(|c| c.complete).unwrap_or(false);
            if !complete {
                return Err(anyhow!("chunk {index} missing in {}", self.root.display()));
            }
        }
        Ok(RangeReader {
            root: self.root.clone(),
            chunk_size: self.chunk_size,
            pos: start,
            end,
        })
    }

    /// Consumes a byte stream and writes it at absolute offset `start`.
    ///
    /// Full chunk-aligned windows are flushed as they fill; a residual tail
    /// shorter than the chunk size is flushed at its true length. When
    /// `start` falls mid-chunk the existing chunk prefix is loaded first, or
    /// zero-filled (and the chunk left incomplete) if absent. Returns the
    /// number of stream bytes consumed.
    pub async fn write_stream<S>(&mut self, mut src: S, start: u64) -> Result<u64>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let chunk_size = self.chunk_size;
        let first_index = start / chunk_size;
        let mut index = first_index;
        let mut buf = BytesMut::new();
        let mut head_padded = false;

        let lead = start - first_index * chunk_size;
        if lead > 0 {
            let (prefix, padded) = self.chunk_prefix(first_index, lead).await?;
            head_padded = padded;
            buf.extend_from_slice(&prefix);
        }

        let mut received = 0u64;
        loop {
            let frame = match src.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(err).context("read fill stream"),
                None => break,
            };
            if frame.is_empty() {
                continue;
            }
            received += frame.len() as u64;
            buf.extend_from_slice(&frame);
            while buf.len() as u64 >= chunk_size {
                let data = buf.split_to(chunk_size as usize).freeze();
                let complete = !(head_padded && index == first_index);
                self.flush_chunk(index, data, complete).await?;
                index += 1;
            }
        }

        if !buf.is_empty() {
            let data = buf.freeze();
            let chunk_start = index * chunk_size;
            let complete = !(head_padded && index == first_index)
                && self.total_size > 0
                && chunk_start + data.len() as u64 == self.total_size;
            self.flush_chunk(index, data, complete).await?;
        }

        Ok(received)
    }

    async fn chunk_prefix(&self, index: u64, lead: u64) -> Result<(Bytes, bool)> {
        let path = chunk_path(&self.root, index);
        let mut buf = vec![0u8; lead as usize];
        match File::open(&path).await {
            Ok(mut file) => {
                let len = file.metadata().await.map(|m| m.len()).unwrap_or(0);
                let have = len.min(lead) as usize;
                file.read_exact(&mut buf[..have])
                    .await
                    .with_context(|| format!("read prefix of {}", path.display()))?;
                let incomplete = (len as usize) < buf.len();
                Ok((Bytes::from(buf), incomplete))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok((Bytes::from(buf), true)),
            Err(err) => Err(err).with_context(|| format!("open {}", path.display())),
        }
    }

    async fn flush_chunk(&mut self, index: u64, data: Bytes, complete: bool) -> Result<()> {
        if let Some(existing) = self.chunks.get(&index) {
            // never shrink a chunk that is already complete
            if existing.complete && existing.size >= data.len() as u64 {
                return Ok(());
            }
        }

        let final_path = chunk_path(&self.root, index);
        let temp_path = chunk_temp_path(&self.root, index);
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }

        let write = async {
            let mut file = File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            Ok::<_, io::Error>(())
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("write {}", temp_path.display()));
        }
        fs::rename(&temp_path, &final_path)
            .await
            .with_context(|| format!("publish {}", final_path.display()))?;

        let start = index * self.chunk_size;
        let size = data.len() as u64;
        self.chunks.insert(
            index,
            ChunkRecord {
                index,
                start,
                end: start + size,
                size,
                complete,
            },
        );
        self.total_size = self.total_size.max(start + size);
        self.persist_meta().await
    }

    async fn persist_meta(&self) -> Result<()> {
        let meta = StoreMeta {
            total_size: self.total_size,
            content_type: self.content_type.clone(),
            chunk_size: self.chunk_size,
            url: self.url.clone(),
            chunks: self.chunks.values().copied().collect(),
        };
        let body = serde_json::to_vec_pretty(&meta).context("encode metadata")?;
        let final_path = self.root.join(METADATA_FILE);
        let temp_path = self.root.join(format!("{METADATA_FILE}{TEMP_SUFFIX}"));
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("create {}", self.root.display()))?;
        fs::write(&temp_path, &body)
            .await
            .with_context(|| format!("write {}", temp_path.display()))?;
        fs::rename(&temp_path, &final_path)
            .await
            .with_context(|| format!("publish {}", final_path.display()))
    }

    /// Deletes the store directory and resets in-memory state.
    pub async fn clear(&mut self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("clear {}", self.root.display())),
        }
        self.chunks.clear();
        self.total_size = 0;
        self.content_type.clear();
        Ok(())
    }
}

/// Streams a planned byte range chunk file by chunk file. Owns only paths, so
/// it stays valid for as long as the caller holds the store lock.
pub struct RangeReader {
    root: PathBuf,
    chunk_size: u64,
    pos: u64,
    end: u64,
}

impl RangeReader {
    /// Next contiguous slice, at most one chunk long. `None` once the range
    /// is exhausted.
    pub async fn next(&mut self) -> Option<io::Result<Bytes>> {
        if self.pos >= self.end {
            return None;
        }
        let index = self.pos / self.chunk_size;
        let offset = self.pos - index * self.chunk_size;
        let upto = ((index + 1) * self.chunk_size).min(self.end);
        let len = (upto - self.pos) as usize;
        match read_slice(&chunk_path(&self.root, index), offset, len).await {
            Ok(data) => {
                self.pos = upto;
                Some(Ok(data))
            }
            Err(err) => {
                self.pos = self.end;
                Some(Err(err))
            }
        }
    }
}

async fn read_slice(path: &Path, offset: u64, len: usize) -> io::Result<Bytes> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
