use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};
use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::error::{Result, SnapshotError};

/// Content-addressed store for fixed-size byte chunks.
///
/// Writes are idempotent and atomic from the point of view of concurrent
/// readers; two racing writers of the same key are allowed and the last one
/// wins. A damaged or evicted entry is simply a miss.
pub trait BlobCache: Send + Sync {
    fn fetch(&self, key: &str) -> Option<Vec<u8>>;
    fn add(&self, key: &str, data: &[u8]);
}

/// Bounded in-memory chunk cache.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Result<Self> {
        let cap = NonZeroUsize::new(max_entries).ok_or_else(|| {
            SnapshotError::InvalidArgument("cache capacity must be positive".into())
        })?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(cap)),
        })
    }
}

impl BlobCache for MemoryCache {
    fn fetch(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn add(&self, key: &str, data: &[u8]) {
        self.entries
            .lock()
            .unwrap()
            .put(key.to_string(), data.to_vec());
    }
}

/// On-disk chunk cache holding one file per entry.
///
/// Filenames are the lowercase hex SHA-256 of the key, writes go through a
/// temp file renamed into place, and an in-memory LRU over keys enforces the
/// entry bound by unlinking evicted files.
pub struct DirectoryCache {
    dir: PathBuf,
    index: Mutex<LruCache<String, PathBuf>>,
}

impl DirectoryCache {
    pub fn new(dir: &Path, max_entries: usize) -> Result<Self> {
        let cap = NonZeroUsize::new(max_entries).ok_or_else(|| {
            SnapshotError::InvalidArgument("cache capacity must be positive".into())
        })?;
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            index: Mutex::new(LruCache::new(cap)),
        })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        self.dir.join(format!("{:x}", hasher.finalize()))
    }
}

impl BlobCache for DirectoryCache {
    fn fetch(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.entry_path(key);
        match std::fs::read(&path) {
            Ok(data) => {
                // Bump recency so the entry survives eviction.
                let mut index = self.index.lock().unwrap();
                if index.get(key).is_none() {
                    index.put(key.to_string(), path);
                }
                Some(data)
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!("discarding damaged cache entry {path:?}: {e}");
                    let _ = std::fs::remove_file(&path);
                }
                self.index.lock().unwrap().pop(key);
                None
            }
        }
    }

    fn add(&self, key: &str, data: &[u8]) {
        let path = self.entry_path(key);
        let res: std::io::Result<()> = (|| {
            let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
            std::fs::write(tmp.path(), data)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })();
        if let Err(e) = res {
            warn!("failed to cache chunk {key:?}: {e}");
            return;
        }
        let evicted = self.index.lock().unwrap().push(key.to_string(), path);
        if let Some((old_key, old_path)) = evicted {
            if old_key != key {
                let _ = std::fs::remove_file(old_path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(cache: &dyn BlobCache) {
        assert!(cache.fetch("a").is_none());
        cache.add("a", b"hello");
        assert_eq!(cache.fetch("a").unwrap(), b"hello");
        // Idempotent re-add keeps the value readable.
        cache.add("a", b"hello");
        assert_eq!(cache.fetch("a").unwrap(), b"hello");
    }

    #[test]
    fn memory_cache_roundtrip() {
        exercise(&MemoryCache::new(8).unwrap());
    }

    #[test]
    fn memory_cache_evicts_least_recently_used() {
        let cache = MemoryCache::new(2).unwrap();
        cache.add("a", b"1");
        cache.add("b", b"2");
        assert!(cache.fetch("a").is_some()); // a is now more recent than b
        cache.add("c", b"3");
        assert!(cache.fetch("b").is_none());
        assert!(cache.fetch("a").is_some());
        assert!(cache.fetch("c").is_some());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(MemoryCache::new(0).is_err());
        let dir = tempfile::tempdir().unwrap();
        assert!(DirectoryCache::new(dir.path(), 0).is_err());
    }

    #[test]
    fn directory_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(dir.path(), 8).unwrap();
        exercise(&cache);
    }

    #[test]
    fn directory_cache_evicts_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(dir.path(), 2).unwrap();
        cache.add("a", b"1");
        cache.add("b", b"2");
        cache.add("c", b"3");
        assert!(cache.fetch("a").is_none());
        assert!(cache.fetch("b").is_some());
        assert!(cache.fetch("c").is_some());
        // Only the two live entries remain on disk.
        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 2);
    }

    #[test]
    fn damaged_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(dir.path(), 8).unwrap();
        cache.add("a", b"1");
        // Simulate damage by making the entry unreadable.
        let path = cache.entry_path("a");
        std::fs::remove_file(&path).unwrap();
        assert!(cache.fetch("a").is_none());
    }
}
