//! Registry of per-URL chunk stores.
//!
//! The manager owns every `ChunkStore` in the process. Lookup and insert run
//! under a plain mutex; all per-resource coordination happens on the store's
//! own `RwLock` afterwards, so any number of readers can share a store while
//! writers are serialized.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::sync::RwLock;

use crate::metrics;
use crate::store::meta::{fingerprint, is_fingerprint, StoreMeta, METADATA_FILE};
use crate::store::ChunkStore;

pub struct StoreHandle {
    pub fingerprint: String,
    pub store: Arc<RwLock<ChunkStore>>,
    /// Millis since epoch of the last completed request.
    last_access: AtomicU64,
    /// Size tally refreshed by `touch`; lets eviction sum without locking.
    bytes: AtomicU64,
}

impl StoreHandle {
    fn new(fingerprint: String, store: ChunkStore) -> Self {
        let bytes = store.size();
        Self {
            fingerprint,
            store: Arc::new(RwLock::new(store)),
            last_access: AtomicU64::new(now_millis()),
            bytes: AtomicU64::new(bytes),
        }
    }
}

pub struct CacheManager {
    root: PathBuf,
    max_total_bytes: u64,
    stores: Mutex<HashMap<String, Arc<StoreHandle>>>,
}

impl CacheManager {
    /// Opens the manager over `root`, rehydrating every subdirectory whose
    /// name is a valid fingerprint and which holds a parseable
    /// `metadata.json`.
    pub async fn open(root: impl Into<PathBuf>, max_total_bytes: u64) -> Result<Arc<Self>> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("create cache root {}", root.display()))?;
        let manager = Arc::new(Self {
            root,
            max_total_bytes,
            stores: Mutex::new(HashMap::new()),
        });
        manager.load_existing().await?;
        Ok(manager)
    }

    async fn load_existing(&self) -> Result<()> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("scan cache root {}", self.root.display()))?;
        while let Some(entry) = dir.next_entry().await.context("scan cache root")? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_fingerprint(&name) {
                continue;
            }
            let meta_path = entry.path().join(METADATA_FILE);
            let Ok(raw) = tokio::fs::read(&meta_path).await else {
                continue;
            };
            let Ok(meta) = serde_json::from_slice::<StoreMeta>(&raw) else {
                log::warn!("skipping unparseable {}", meta_path.display());
                continue;
            };
            match ChunkStore::open(entry.path(), &meta.url).await {
                Ok(store) => {
                    log::info!("rehydrated store {name} ({} bytes)", store.size());
                    let handle = Arc::new(StoreHandle::new(name.clone(), store));
                    self.stores.lock().expect("store registry").insert(name, handle);
                }
                Err(err) => log::warn!("skipping store {name}: {err:#}"),
            }
        }
        Ok(())
    }

    /// Returns the store handle for `url`, creating it on first reference.
    pub async fn acquire(&self, url: &str) -> Result<Arc<StoreHandle>> {
        let fp = fingerprint(url);
        if let Some(handle) = self.stores.lock().expect("store registry").get(&fp) {
            return Ok(Arc::clone(handle));
        }
        // created outside the registry lock; a racing create loses and drops
        let store = ChunkStore::open(self.root.join(&fp), url).await?;
        let handle = Arc::new(StoreHandle::new(fp.clone(), store));
        let mut stores = self.stores.lock().expect("store registry");
        Ok(Arc::clone(stores.entry(fp).or_insert(handle)))
    }

    /// Bumps the access timestamp and refreshes the size tally.
    pub fn touch(&self, handle: &StoreHandle) {
        handle.last_access.store(now_millis(), Ordering::Relaxed);
        if let Ok(store) = handle.store.try_read() {
            handle.bytes.store(store.size(), Ordering::Relaxed);
        }
        let total: u64 = {
            let stores = self.stores.lock().expect("store registry");
            stores.values().map(|h| h.bytes.load(Ordering::Relaxed)).sum()
        };
        metrics::set_store_bytes(total);
    }

    /// Clears least-recently-used idle stores until the total drops under
    /// the budget. Stores currently in use are skipped; when nothing can be
    /// evicted the ceiling is left unenforced until the next pass.
    pub async fn evict_if_needed(&self) {
        loop {
            let (total, mut candidates) = {
                let stores = self.stores.lock().expect("store registry");
                let total: u64 = stores.values().map(|h| h.bytes.load(Ordering::Relaxed)).sum();
                let candidates: Vec<(u64, String)> = stores
                    .iter()
                    .map(|(fp, h)| (h.last_access.load(Ordering::Relaxed), fp.clone()))
                    .collect();
                (total, candidates)
            };
            if total <= self.max_total_bytes {
                return;
            }
            candidates.sort();

            let mut evicted = false;
            for (_, fp) in candidates {
                let handle = {
                    let stores = self.stores.lock().expect("store registry");
                    match stores.get(&fp) {
                        Some(handle) => Arc::clone(handle),
                        None => continue,
                    }
                };
                // a held read or write guard means the store is in use
                let Ok(mut store) = handle.store.try_write() else {
                    continue;
                };
                let size = store.size();
                if let Err(err) = store.clear().await {
                    log::warn!("evict {fp} failed: {err:#}");
                    continue;
                }
                log::info!("evicted store {fp} ({size} bytes)");
                handle.bytes.store(0, Ordering::Relaxed);
                self.stores.lock().expect("store registry").remove(&fp);
                metrics::record_eviction();
                evicted = true;
                break;
            }
            if !evicted {
                return;
            }
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
