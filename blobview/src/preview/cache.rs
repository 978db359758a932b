// ABOUTME: Disk-backed blob cache with size-bounded eviction and checksum verification
// ABOUTME: JSON index sidecar, LRU/size/age policies, and hourly background maintenance

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;

use crate::constants::{INDEX_FILE_NAME, MAINTENANCE_INTERVAL};
use crate::error::PreviewError;
use crate::preview::types::{CacheMetrics, CacheStats};

/// Rule used to pick which entries to remove when over budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Oldest access time first.
    #[default]
    Lru,
    /// Largest entries first; favors keeping many small entries.
    Size,
    /// Everything older than the configured creation-age threshold,
    /// regardless of size pressure.
    Age,
}

/// One cached blob. The backing file is the durable truth; entries whose
/// file has disappeared are pruned on the next index load or access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub file_path: PathBuf,
    pub size: u64,
    pub access_time: DateTime<Utc>,
    pub create_time: DateTime<Utc>,
    pub original_key: String,
    pub content_type: String,
    /// Hex-encoded SHA-256 of the file contents, computed during `put`.
    pub checksum: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedIndex {
    entries: HashMap<String, CacheEntry>,
    total_size: u64,
    last_cleanup: DateTime<Utc>,
}

struct IndexState {
    entries: HashMap<String, CacheEntry>,
    last_cleanup: DateTime<Utc>,
}

struct CacheInner {
    cache_dir: PathBuf,
    max_size: AtomicU64,
    policy: EvictionPolicy,
    age_threshold: Duration,
    index: RwLock<IndexState>,
}

/// Content-keyed local store of previously fetched blobs.
///
/// All mutating operations take the index write lock; reads take the
/// shared lock. The index sidecar is persisted after every structural
/// change, but persistence failures are logged and never abort the
/// in-memory operation: the index is a performance cache over a
/// directory scan, not the source of durability.
pub struct DiskCache {
    inner: Arc<CacheInner>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl DiskCache {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        max_size: u64,
        policy: EvictionPolicy,
        age_threshold: Duration,
    ) -> Result<Self, PreviewError> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)
            .map_err(|e| PreviewError::cache("create_dir", &cache_dir, e))?;

        let inner = Arc::new(CacheInner {
            cache_dir,
            max_size: AtomicU64::new(max_size),
            policy,
            age_threshold,
            index: RwLock::new(IndexState {
                entries: HashMap::new(),
                last_cleanup: Utc::now(),
            }),
        });

        inner.load_index();

        let cache = Self {
            inner,
            stop_tx: Mutex::new(None),
        };
        cache.start_maintenance();
        Ok(cache)
    }

    /// Returns the cached path for `key`, or `None` on a miss. A hit
    /// refreshes the entry's access time; an entry whose backing file has
    /// disappeared is pruned and reported as a miss, not an error.
    pub fn get(&self, key: &str) -> Result<Option<PathBuf>, PreviewError> {
        let mut index = self.inner.index.write().unwrap();

        let Some(entry) = index.entries.get_mut(key) else {
            return Ok(None);
        };

        if !entry.file_path.exists() {
            index.entries.remove(key);
            return Ok(None);
        }

        entry.access_time = Utc::now();
        Ok(Some(entry.file_path.clone()))
    }

    /// Copies `source_path` into the cache under a filename derived from a
    /// hash of `key`, computing the content checksum in the same pass. A
    /// partial copy is removed before the error is surfaced.
    pub fn put(&self, key: &str, source_path: &Path) -> Result<PathBuf, PreviewError> {
        let mut index = self.inner.index.write().unwrap();

        let hash = hex_string(Sha256::digest(key.as_bytes()).as_slice());
        let ext = source_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let cache_path = self.inner.cache_dir.join(format!("{hash}{ext}"));

        let checksum = match copy_with_checksum(source_path, &cache_path) {
            Ok(checksum) => checksum,
            Err(e) => {
                let _ = fs::remove_file(&cache_path);
                return Err(PreviewError::cache("put", &cache_path, e));
            }
        };

        let size = fs::metadata(&cache_path)
            .map_err(|e| PreviewError::cache("put", &cache_path, e))?
            .len();
        let content_type = sniff_content_type(source_path);

        let now = Utc::now();
        index.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                file_path: cache_path.clone(),
                size,
                access_time: now,
                create_time: now,
                original_key: key.to_string(),
                content_type,
                checksum,
            },
        );

        self.inner.persist_index(&index);
        Ok(cache_path)
    }

    /// Removes the entry and its backing file. A missing file or unknown
    /// key is not an error.
    pub fn delete(&self, key: &str) -> Result<(), PreviewError> {
        let mut index = self.inner.index.write().unwrap();

        if let Some(entry) = index.entries.remove(key) {
            let _ = fs::remove_file(&entry.file_path);
            self.inner.persist_index(&index);
        }
        Ok(())
    }

    /// Re-reads the cached file and compares its digest against the one
    /// recorded at `put` time. Used to detect silent corruption; the hot
    /// `get` path never pays this cost.
    pub fn verify_checksum(&self, key: &str) -> Result<bool, PreviewError> {
        let entry = {
            let index = self.inner.index.read().unwrap();
            index
                .entries
                .get(key)
                .cloned()
                .ok_or_else(|| PreviewError::EntryNotFound(key.to_string()))?
        };

        verify_entry(&entry).map_err(|e| PreviewError::cache("verify", &entry.file_path, e))
    }

    /// Evicts entries under the active policy until the total is within
    /// budget. A no-op when already under.
    pub fn cleanup(&self) -> Result<(), PreviewError> {
        let mut index = self.inner.index.write().unwrap();
        self.inner.cleanup_locked(&mut index)
    }

    /// Rebuilds the index keeping only entries whose file exists and
    /// passes checksum verification; corrupted files are deleted.
    pub fn compact(&self) -> Result<(), PreviewError> {
        let mut index = self.inner.index.write().unwrap();

        let mut valid = HashMap::new();
        for (key, entry) in index.entries.drain() {
            if !entry.file_path.exists() {
                continue;
            }
            match verify_entry(&entry) {
                Ok(true) => {
                    valid.insert(key, entry);
                }
                Ok(false) | Err(_) => {
                    let _ = fs::remove_file(&entry.file_path);
                }
            }
        }

        index.entries = valid;
        self.inner.persist_index(&index);
        Ok(())
    }

    /// Evicts oldest-first until `current + required <= max`, for callers
    /// about to write a blob of known size.
    pub fn preallocate_space(&self, required: u64) -> Result<(), PreviewError> {
        let mut index = self.inner.index.write().unwrap();

        let current = total_size(&index.entries);
        let max = self.inner.max_size.load(Ordering::Relaxed);
        if current + required <= max {
            return Ok(());
        }

        let to_free = current + required - max;
        self.inner.evict_by_access(&mut index, to_free);
        self.inner.persist_index(&index);
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.inner.index.read().unwrap();
        let total = total_size(&index.entries);
        let max = self.inner.max_size.load(Ordering::Relaxed);

        CacheStats {
            total_files: index.entries.len(),
            total_size: total,
            max_size: max,
            usage_percent: percent_of(total, max),
            oldest_entry: oldest(&index.entries),
            newest_entry: newest(&index.entries),
        }
    }

    pub fn metrics(&self) -> CacheMetrics {
        let index = self.inner.index.read().unwrap();
        let total = total_size(&index.entries);
        let max = self.inner.max_size.load(Ordering::Relaxed);
        let count = index.entries.len();

        CacheMetrics {
            total_files: count,
            total_size: total,
            max_size: max,
            usage_percent: percent_of(total, max),
            average_file_size: if count > 0 {
                total as f64 / count as f64
            } else {
                0.0
            },
            oldest_entry: oldest(&index.entries),
            newest_entry: newest(&index.entries),
            last_cleanup: index.last_cleanup,
        }
    }

    /// Entries sorted by ascending access time (eviction order).
    pub fn lru_entries(&self) -> Vec<CacheEntry> {
        let index = self.inner.index.read().unwrap();
        let mut entries: Vec<CacheEntry> = index.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.access_time);
        entries
    }

    /// Manual touch, for callers that consumed the file out of band.
    pub fn update_access_time(&self, key: &str) {
        let mut index = self.inner.index.write().unwrap();
        if let Some(entry) = index.entries.get_mut(key) {
            entry.access_time = Utc::now();
        }
    }

    /// Reverse lookup by cached file path.
    pub fn entry_by_path(&self, path: &Path) -> Option<CacheEntry> {
        let index = self.inner.index.read().unwrap();
        index
            .entries
            .values()
            .find(|e| e.file_path == path)
            .cloned()
    }

    pub fn total_size(&self) -> u64 {
        let index = self.inner.index.read().unwrap();
        total_size(&index.entries)
    }

    pub fn set_max_size(&self, max_size: u64) {
        self.inner.max_size.store(max_size, Ordering::Relaxed);
    }

    /// Stops the background maintenance task. Safe to call more than
    /// once; subsequent calls are no-ops.
    pub fn stop_maintenance(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap().take() {
            let _ = tx.send(true);
        }
    }

    fn start_maintenance(&self) {
        // Outside a runtime (plain sync tests) the cache works without
        // background maintenance; callers can still invoke cleanup().
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::debug!("no async runtime; background cache maintenance disabled");
            return;
        };

        let (tx, mut rx) = watch::channel(false);
        *self.stop_tx.lock().unwrap() = Some(tx);

        let weak = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.run_maintenance();
                    }
                    _ = rx.changed() => break,
                }
            }
        });
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        self.stop_maintenance();
    }
}

impl CacheInner {
    fn cleanup_locked(&self, index: &mut IndexState) -> Result<(), PreviewError> {
        let current = total_size(&index.entries);
        let max = self.max_size.load(Ordering::Relaxed);

        match self.policy {
            EvictionPolicy::Age => {
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(self.age_threshold)
                        .unwrap_or_else(|_| chrono::Duration::hours(24));
                let expired: Vec<String> = index
                    .entries
                    .values()
                    .filter(|e| e.create_time < cutoff)
                    .map(|e| e.key.clone())
                    .collect();
                for key in expired {
                    if let Some(entry) = index.entries.get(&key) {
                        if fs::remove_file(&entry.file_path).is_ok() || !entry.file_path.exists() {
                            index.entries.remove(&key);
                        }
                    }
                }
            }
            EvictionPolicy::Lru => {
                if current <= max {
                    return Ok(());
                }
                self.evict_by_access(index, current - max);
            }
            EvictionPolicy::Size => {
                if current <= max {
                    return Ok(());
                }
                self.evict_by_size(index, current - max);
            }
        }

        index.last_cleanup = Utc::now();
        self.persist_index(index);
        Ok(())
    }

    /// Deletes oldest-accessed entries until at least `to_free` bytes are
    /// reclaimed.
    fn evict_by_access(&self, index: &mut IndexState, to_free: u64) {
        let mut order: Vec<(String, DateTime<Utc>)> = index
            .entries
            .values()
            .map(|e| (e.key.clone(), e.access_time))
            .collect();
        order.sort_by_key(|(_, t)| *t);

        self.evict_in_order(index, order.into_iter().map(|(k, _)| k), to_free);
    }

    /// Deletes largest entries first until at least `to_free` bytes are
    /// reclaimed.
    fn evict_by_size(&self, index: &mut IndexState, to_free: u64) {
        let mut order: Vec<(String, u64)> = index
            .entries
            .values()
            .map(|e| (e.key.clone(), e.size))
            .collect();
        order.sort_by(|(_, a), (_, b)| b.cmp(a));

        self.evict_in_order(index, order.into_iter().map(|(k, _)| k), to_free);
    }

    fn evict_in_order(
        &self,
        index: &mut IndexState,
        keys: impl Iterator<Item = String>,
        to_free: u64,
    ) {
        let mut freed = 0u64;
        for key in keys {
            if freed >= to_free {
                break;
            }
            if let Some(entry) = index.entries.get(&key) {
                if fs::remove_file(&entry.file_path).is_ok() || !entry.file_path.exists() {
                    freed += entry.size;
                    index.entries.remove(&key);
                }
            }
        }
    }

    fn run_maintenance(self: &Arc<Self>) {
        let mut index = self.index.write().unwrap();
        if let Err(e) = self.cleanup_locked(&mut index) {
            log::warn!("background cache cleanup failed: {e}");
        }
        self.sweep_orphans(&index);
    }

    /// Deletes files in the cache directory that no index entry
    /// references.
    fn sweep_orphans(&self, index: &IndexState) {
        let Ok(dir) = fs::read_dir(&self.cache_dir) else {
            return;
        };

        for dir_entry in dir.flatten() {
            let path = dir_entry.path();
            if path.is_dir() || dir_entry.file_name() == INDEX_FILE_NAME {
                continue;
            }
            let referenced = index.entries.values().any(|e| e.file_path == path);
            if !referenced {
                if let Err(e) = fs::remove_file(&path) {
                    log::warn!("failed to remove orphaned cache file {path:?}: {e}");
                }
            }
        }
    }

    fn index_path(&self) -> PathBuf {
        self.cache_dir.join(INDEX_FILE_NAME)
    }

    fn persist_index(&self, index: &IndexState) {
        let persisted = PersistedIndex {
            entries: index.entries.clone(),
            total_size: total_size(&index.entries),
            last_cleanup: index.last_cleanup,
        };

        let result = serde_json::to_vec_pretty(&persisted)
            .map_err(std::io::Error::other)
            .and_then(|data| {
                let tmp = self.index_path().with_extension("tmp");
                fs::write(&tmp, data)?;
                fs::rename(&tmp, self.index_path())
            });

        if let Err(e) = result {
            log::warn!("failed to persist cache index: {e}");
        }
    }

    fn load_index(&self) {
        let data = match fs::read(self.index_path()) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                log::warn!("failed to read cache index: {e}");
                return;
            }
        };

        let persisted: PersistedIndex = match serde_json::from_slice(&data) {
            Ok(persisted) => persisted,
            Err(e) => {
                log::warn!("failed to parse cache index, starting empty: {e}");
                return;
            }
        };

        let mut index = self.index.write().unwrap();
        index.last_cleanup = persisted.last_cleanup;
        index.entries = persisted
            .entries
            .into_iter()
            .filter(|(_, entry)| entry.file_path.exists())
            .collect();
    }
}

fn total_size(entries: &HashMap<String, CacheEntry>) -> u64 {
    entries.values().map(|e| e.size).sum()
}

fn percent_of(total: u64, max: u64) -> f64 {
    if max == 0 {
        0.0
    } else {
        total as f64 / max as f64 * 100.0
    }
}

fn oldest(entries: &HashMap<String, CacheEntry>) -> Option<CacheEntry> {
    entries.values().min_by_key(|e| e.create_time).cloned()
}

fn newest(entries: &HashMap<String, CacheEntry>) -> Option<CacheEntry> {
    entries.values().max_by_key(|e| e.create_time).cloned()
}

/// Single-pass copy that tees the bytes through a SHA-256 hasher, so no
/// second read is needed for the checksum.
fn copy_with_checksum(source: &Path, dest: &Path) -> std::io::Result<String> {
    let mut src = fs::File::open(source)?;
    let mut dst = fs::File::create(dest)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 32 * 1024];

    loop {
        let n = src.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buffer[..n])?;
        hasher.update(&buffer[..n]);
    }

    Ok(hex_string(hasher.finalize().as_slice()))
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn verify_entry(entry: &CacheEntry) -> std::io::Result<bool> {
    let mut file = fs::File::open(&entry.file_path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 32 * 1024];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex_string(hasher.finalize().as_slice()) == entry.checksum)
}

/// Best-effort content sniff from the file's leading bytes.
fn sniff_content_type(path: &Path) -> String {
    let mut header = [0u8; 16];
    let n = fs::File::open(path)
        .and_then(|mut f| f.read(&mut header))
        .unwrap_or(0);
    let header = &header[..n];

    let detected = if header.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        "image/png"
    } else if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
        "image/gif"
    } else if header.len() >= 12 && header.starts_with(b"RIFF") && &header[8..12] == b"WEBP" {
        "image/webp"
    } else if header.starts_with(b"BM") {
        "image/bmp"
    } else if header.starts_with(&[0x49, 0x49, 0x2A, 0x00])
        || header.starts_with(&[0x4D, 0x4D, 0x00, 0x2A])
    {
        "image/tiff"
    } else {
        "application/octet-stream"
    };

    detected.to_string()
}
