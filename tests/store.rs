mod support;

use std::io;

use bytes::Bytes;
use futures_util::stream;
use larder::constants::CHUNK_SIZE;
use larder::store::meta::StoreMeta;
use larder::store::ChunkStore;
use support::{gen_bytes, hash_bytes};

const CHUNK: usize = CHUNK_SIZE as usize;

fn frames(payload: &Bytes, frame_size: usize) -> Vec<io::Result<Bytes>> {
    payload
        .chunks(frame_size)
        .map(|c| Ok(payload.slice_ref(c)))
        .collect()
}

async fn filled_store(dir: &std::path::Path, payload: &Bytes) -> ChunkStore {
    let mut store = ChunkStore::open(dir, "http://origin/video.mp4").await.expect("open");
    store
        .set_identity(payload.len() as u64, "video/mp4")
        .await
        .expect("identity");
    store
        .write_stream(stream::iter(frames(payload, 64 * 1024)), 0)
        .await
        .expect("write");
    store
}

async fn read_all(store: &ChunkStore, start: u64, end: u64) -> Bytes {
    let mut reader = store.read(start, end).expect("plan read");
    let mut out = Vec::new();
    while let Some(item) = reader.next().await {
        out.extend_from_slice(&item.expect("read slice"));
    }
    Bytes::from(out)
}

#[tokio::test]
async fn test_write_then_read_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let payload = gen_bytes(2 * CHUNK + 1000);
    let store = filled_store(dir.path(), &payload).await;

    assert_eq!(store.total_size(), payload.len() as u64);
    assert_eq!(store.size(), payload.len() as u64);
    assert!(store.range_cached(0, payload.len() as u64));

    // arbitrary sub-ranges come back byte-identical
    for (start, end) in [
        (0, 1),
        (0, payload.len() as u64),
        (CHUNK_SIZE - 1, CHUNK_SIZE + 1),
        (CHUNK_SIZE, 2 * CHUNK_SIZE),
        (2 * CHUNK_SIZE, payload.len() as u64),
        (123_456, 7_654_321),
    ] {
        let got = read_all(&store, start, end).await;
        assert_eq!(
            hash_bytes(&got),
            hash_bytes(&payload[start as usize..end as usize]),
            "range {start}..{end}"
        );
    }

    // the short final chunk is stored at true length
    let chunk2 = std::fs::metadata(dir.path().join("data/chunk_2")).expect("chunk_2");
    assert_eq!(chunk2.len(), 1000);
}

#[tokio::test]
async fn test_metadata_consistent_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let payload = gen_bytes(CHUNK + 500);
    let store = filled_store(dir.path(), &payload).await;
    let total = store.total_size();
    drop(store);

    let raw = std::fs::read(dir.path().join("metadata.json")).expect("metadata");
    let meta: StoreMeta = serde_json::from_slice(&raw).expect("parse metadata");
    assert_eq!(meta.total_size, total);
    assert_eq!(meta.content_type, "video/mp4");
    assert_eq!(meta.chunk_size, CHUNK_SIZE);
    assert_eq!(meta.url, "http://origin/video.mp4");
    assert_eq!(meta.chunks.len(), 2);
    for chunk in &meta.chunks {
        assert_eq!(chunk.start, chunk.index * CHUNK_SIZE);
        assert_eq!(chunk.end, chunk.start + chunk.size);
        assert!(chunk.complete);
    }

    let reopened = ChunkStore::open(dir.path(), "").await.expect("reopen");
    assert_eq!(reopened.url(), "http://origin/video.mp4");
    assert_eq!(reopened.total_size(), total);
    assert!(reopened.range_cached(0, total));
    let got = read_all(&reopened, 0, total).await;
    assert_eq!(hash_bytes(&got), hash_bytes(&payload));
}

#[tokio::test]
async fn test_reopen_drops_missing_chunks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let payload = gen_bytes(2 * CHUNK);
    let store = filled_store(dir.path(), &payload).await;
    let total = store.total_size();
    drop(store);

    std::fs::remove_file(dir.path().join("data/chunk_0")).expect("remove chunk_0");
    std::fs::write(dir.path().join("data/chunk_7.temp"), b"junk").expect("write temp");

    let reopened = ChunkStore::open(dir.path(), "").await.expect("reopen");
    assert!(!reopened.range_cached(0, CHUNK_SIZE));
    assert!(reopened.range_cached(CHUNK_SIZE, total));
    assert_eq!(reopened.size(), CHUNK_SIZE);
    assert!(!dir.path().join("data/chunk_7.temp").exists());
}

#[tokio::test]
async fn test_cached_prefix_is_monotone() {
    let dir = tempfile::tempdir().expect("tempdir");
    let payload = gen_bytes(2 * CHUNK);
    let mut store = ChunkStore::open(dir.path(), "http://origin/v").await.expect("open");
    store
        .set_identity(payload.len() as u64, "video/mp4")
        .await
        .expect("identity");
    // only the first chunk
    store
        .write_stream(
            stream::iter(frames(&payload.slice(0..CHUNK), 64 * 1024)),
            0,
        )
        .await
        .expect("write");

    assert_eq!(store.cached_range_size(0, 2 * CHUNK_SIZE), CHUNK_SIZE);
    assert_eq!(store.cached_range_size(1024, 2 * CHUNK_SIZE), CHUNK_SIZE - 1024);
    assert_eq!(store.cached_range_size(CHUNK_SIZE, 2 * CHUNK_SIZE), 0);

    // range_cached(a, b) implies range_cached(a, c) for a <= c <= b
    assert!(store.range_cached(0, CHUNK_SIZE));
    for c in [1, 1024, CHUNK_SIZE / 2, CHUNK_SIZE - 1, CHUNK_SIZE] {
        assert!(store.range_cached(0, c), "prefix {c}");
    }
    assert!(!store.range_cached(0, CHUNK_SIZE + 1));
}

#[tokio::test]
async fn test_mid_chunk_write_without_prior_data() {
    let dir = tempfile::tempdir().expect("tempdir");
    let payload = gen_bytes(2 * CHUNK);
    let total = payload.len() as u64;
    let mut store = ChunkStore::open(dir.path(), "http://origin/v").await.expect("open");
    store.set_identity(total, "video/mp4").await.expect("identity");

    // start 100 bytes into chunk 1 with nothing on disk: the gap is
    // zero-filled and the chunk stays invisible to range checks
    let start = CHUNK_SIZE + 100;
    store
        .write_stream(
            stream::iter(frames(&payload.slice(start as usize..), 64 * 1024)),
            start,
        )
        .await
        .expect("write");

    assert!(!store.range_cached(CHUNK_SIZE, 2 * CHUNK_SIZE));
    assert_eq!(store.cached_range_size(CHUNK_SIZE, 2 * CHUNK_SIZE), 0);
    let chunk1 = std::fs::metadata(dir.path().join("data/chunk_1")).expect("chunk_1");
    assert_eq!(chunk1.len(), CHUNK_SIZE);
}

#[tokio::test]
async fn test_mid_chunk_write_rebuilds_from_existing_prefix() {
    let dir = tempfile::tempdir().expect("tempdir");
    let payload = gen_bytes(CHUNK + 100_000);
    let total = payload.len() as u64;
    let mut store = ChunkStore::open(dir.path(), "http://origin/v").await.expect("open");
    store.set_identity(total, "video/mp4").await.expect("identity");

    // first pass stops mid-chunk: chunk 1 lands short and incomplete
    store
        .write_stream(
            stream::iter(frames(&payload.slice(0..CHUNK + 40_000), 64 * 1024)),
            0,
        )
        .await
        .expect("first write");
    assert!(store.range_cached(0, CHUNK_SIZE));
    assert!(!store.range_cached(0, total));

    // resuming mid-chunk folds the existing prefix back in
    let resume = CHUNK_SIZE + 40_000;
    store
        .write_stream(
            stream::iter(frames(&payload.slice(resume as usize..), 64 * 1024)),
            resume,
        )
        .await
        .expect("second write");

    assert!(store.range_cached(0, total));
    let got = read_all(&store, 0, total).await;
    assert_eq!(hash_bytes(&got), hash_bytes(&payload));
}

#[tokio::test]
async fn test_write_error_keeps_published_chunks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let payload = gen_bytes(CHUNK + 2000);
    let total = payload.len() as u64;
    let mut store = ChunkStore::open(dir.path(), "http://origin/v").await.expect("open");
    store.set_identity(total, "video/mp4").await.expect("identity");

    let mut items = frames(&payload.slice(0..CHUNK + 1000), 64 * 1024);
    items.push(Err(io::Error::new(io::ErrorKind::ConnectionReset, "origin died")));
    let err = store.write_stream(stream::iter(items), 0).await;
    assert!(err.is_err());

    // the fully flushed first chunk survives; the torn tail does not count
    assert!(store.range_cached(0, CHUNK_SIZE));
    assert!(!store.range_cached(0, total));
    let got = read_all(&store, 0, CHUNK_SIZE).await;
    assert_eq!(hash_bytes(&got), hash_bytes(&payload[..CHUNK]));
}

#[tokio::test]
async fn test_clear_removes_store_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let payload = gen_bytes(CHUNK);
    let mut store = filled_store(dir.path().join("s").as_path(), &payload).await;
    assert!(dir.path().join("s/metadata.json").exists());

    store.clear().await.expect("clear");
    assert!(!dir.path().join("s").exists());
    assert_eq!(store.size(), 0);
    assert_eq!(store.total_size(), 0);
    assert!(!store.range_cached(0, CHUNK_SIZE));
}

#[tokio::test]
async fn test_delete_and_refill_is_bitwise_identical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let payload = gen_bytes(CHUNK + 333);

    let mut store = filled_store(dir.path().join("s").as_path(), &payload).await;
    let first_chunk0 = std::fs::read(dir.path().join("s/data/chunk_0")).expect("chunk_0");
    let first_chunk1 = std::fs::read(dir.path().join("s/data/chunk_1")).expect("chunk_1");

    store.clear().await.expect("clear");
    drop(store);

    let _refilled = filled_store(dir.path().join("s").as_path(), &payload).await;
    let second_chunk0 = std::fs::read(dir.path().join("s/data/chunk_0")).expect("chunk_0 again");
    let second_chunk1 = std::fs::read(dir.path().join("s/data/chunk_1")).expect("chunk_1 again");
    assert_eq!(first_chunk0, second_chunk0);
    assert_eq!(first_chunk1, second_chunk1);
}
