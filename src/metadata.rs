//! 文件元数据的小容量 LRU 缓存。
//!
//! Entries are never refreshed on their own; a file changed behind the
//! cache's back keeps its old entry until it is invalidated or evicted.
//! Handlers that mutate the tree invalidate explicitly. The view path calls
//! [`MetadataCache::refresh`], which always stats, so its ETag follows the
//! file on disk rather than the cached entry.

use lru::LruCache;
use std::io;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;
use tokio::fs;
use tracing::debug;

use crate::media::{MediaKind, content_type};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataEntry {
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub content_type: String,
    pub media_type: MediaKind,
}

#[derive(Debug)]
pub struct MetadataCache {
    entries: Mutex<LruCache<String, MetadataEntry>>,
}

impl MetadataCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// 读取元数据；未命中时 stat 并写入缓存。
    ///
    /// Returns `Ok(None)` when the path does not exist or is not a regular
    /// file.
    pub async fn get(&self, path: &Path) -> io::Result<Option<MetadataEntry>> {
        let key = cache_key(path);
        if let Some(entry) = self.lock().get(&key) {
            return Ok(Some(entry.clone()));
        }

        let Some(entry) = stat_entry(path).await? else {
            return Ok(None);
        };
        self.lock().put(key, entry.clone());
        Ok(Some(entry))
    }

    /// 强制重新 stat；与缓存不一致时替换缓存条目。
    pub async fn refresh(&self, path: &Path) -> io::Result<Option<MetadataEntry>> {
        let key = cache_key(path);
        let Some(fresh) = stat_entry(path).await? else {
            self.lock().pop(&key);
            return Ok(None);
        };
        let mut entries = self.lock();
        if entries.peek(&key).is_some_and(|cached| *cached != fresh) {
            debug!(path = %key, "stale metadata replaced");
        }
        entries.put(key, fresh.clone());
        Ok(Some(fresh))
    }

    pub fn invalidate(&self, path: &Path) {
        self.lock().pop(&cache_key(path));
    }

    /// Drops every entry at or below `dir`.
    pub fn invalidate_prefix(&self, dir: &Path) {
        let mut entries = self.lock();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(key, _)| Path::new(key.as_str()).starts_with(dir))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, MetadataEntry>> {
        // A poisoned cache only ever holds plain data; keep serving it.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn stat_entry(path: &Path) -> io::Result<Option<MetadataEntry>> {
    let metadata = match fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    if !metadata.is_file() {
        return Ok(None);
    }
    Ok(Some(MetadataEntry {
        size: metadata.len(),
        modified: metadata.modified().ok(),
        content_type: content_type(path),
        media_type: MediaKind::from_path(path),
    }))
}

fn cache_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn miss_stats_and_hit_serves_cached_entry() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("clip.mp4");
        std::fs::write(&path, b"12345").expect("write");

        let cache = MetadataCache::new(4);
        let entry = cache.get(&path).await.expect("get").expect("entry");
        assert_eq!(entry.size, 5);
        assert_eq!(entry.media_type, MediaKind::Video);
        assert_eq!(entry.content_type, "video/mp4");

        std::fs::write(&path, b"1234567890").expect("rewrite");
        let stale = cache.get(&path).await.expect("get").expect("entry");
        assert_eq!(stale.size, 5, "cached entry survives external change");

        cache.invalidate(&path);
        let fresh = cache.get(&path).await.expect("get").expect("entry");
        assert_eq!(fresh.size, 10);
    }

    #[tokio::test]
    async fn missing_files_and_directories_are_none() {
        let temp = tempdir().expect("tempdir");
        let cache = MetadataCache::new(4);
        assert!(cache.get(&temp.path().join("nope")).await.expect("get").is_none());
        assert!(cache.get(temp.path()).await.expect("get").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let temp = tempdir().expect("tempdir");
        let cache = MetadataCache::new(2);
        let paths: Vec<_> = ["a.txt", "b.txt", "c.txt"]
            .iter()
            .map(|name| {
                let path = temp.path().join(name);
                std::fs::write(&path, name.as_bytes()).expect("write");
                path
            })
            .collect();

        cache.get(&paths[0]).await.expect("get");
        cache.get(&paths[1]).await.expect("get");
        cache.get(&paths[0]).await.expect("get");
        cache.get(&paths[2]).await.expect("get");
        assert_eq!(cache.len(), 2);

        std::fs::remove_file(&paths[1]).expect("remove");
        std::fs::remove_file(&paths[0]).expect("remove");
        assert!(cache.get(&paths[1]).await.expect("get").is_none());
        assert!(cache.get(&paths[0]).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn invalidate_prefix_drops_subtree() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join("album");
        std::fs::create_dir_all(&dir).expect("mkdir");
        let inside = dir.join("song.mp3");
        let outside = temp.path().join("other.mp3");
        std::fs::write(&inside, b"x").expect("write");
        std::fs::write(&outside, b"y").expect("write");

        let cache = MetadataCache::new(8);
        cache.get(&inside).await.expect("get");
        cache.get(&outside).await.expect("get");
        cache.invalidate_prefix(&dir);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn refresh_replaces_stale_entry() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("notes.txt");
        std::fs::write(&path, b"first").expect("write");

        let cache = MetadataCache::new(4);
        let cached = cache.get(&path).await.expect("get").expect("entry");

        std::fs::write(&path, b"second version").expect("rewrite");
        let later = cached.modified.expect("mtime") + std::time::Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(later))
            .expect("set mtime");

        let fresh = cache.refresh(&path).await.expect("refresh").expect("entry");
        assert_eq!(fresh.size, 14);
        assert_eq!(fresh.modified, Some(later));
        let hit = cache.get(&path).await.expect("get").expect("entry");
        assert_eq!(hit, fresh);

        std::fs::remove_file(&path).expect("remove");
        assert!(cache.refresh(&path).await.expect("refresh").is_none());
        assert_eq!(cache.len(), 0);
    }
}
