//! 分片暂存与合并。
//!
//! Every logical upload is keyed by an identity derived from
//! `fileName|fileSize|directory` and owns one staging directory holding
//! `chunk_<index>` files. Chunks may arrive in any order and any number of
//! times; the last write for an index wins. `complete` concatenates indices
//! `0..total_chunks` strictly in order into a hidden temp file next to the
//! target and publishes it without overwriting anything.
//!
//! Failure handling on `complete`:
//! - missing chunk or size mismatch: temp output removed, staging kept so the
//!   client can fill the gap and retry;
//! - target already exists: staging removed;
//! - I/O failure while merging: temp output and staging removed.

use axum::body::Bytes;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::atomic::AtomicFile;
use crate::executor::{BlockingExecutor, ExecutorError};
use crate::locking::LockManager;

const CHUNK_FILE_PREFIX: &str = "chunk_";

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("no chunk data for identity")]
    NotFound,
    #[error("target already exists: {0}")]
    Conflict(String),
    #[error("chunk {0} is missing")]
    MissingChunk(u64),
    #[error("size mismatch: expected {expected} bytes, merged {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("upload is already being merged")]
    Busy,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// 计算上传会话标识（跨进程重启稳定）。
pub fn upload_identity(file_name: &str, file_size: u64, directory: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_name.as_bytes());
    hasher.update(b"|");
    hasher.update(file_size.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(directory.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

fn is_valid_identity(identity: &str) -> bool {
    !identity.is_empty() && identity.chars().all(|c| c.is_ascii_hexdigit())
}

fn chunk_file_name(index: u64) -> String {
    format!("{CHUNK_FILE_PREFIX}{index}")
}

#[derive(Debug)]
pub struct ChunkAssembler {
    staging_root: PathBuf,
    executor: BlockingExecutor,
    merge_locks: Arc<LockManager>,
    merge_wait: Duration,
}

impl ChunkAssembler {
    pub fn new(staging_root: PathBuf, executor: BlockingExecutor, merge_wait: Duration) -> Self {
        Self {
            staging_root,
            executor,
            merge_locks: Arc::new(LockManager::new()),
            merge_wait,
        }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.staging_root).await
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    pub fn staging_dir(&self, identity: &str) -> PathBuf {
        self.staging_root.join(identity)
    }

    /// 写入一个分片（同一索引重复写入时覆盖）。
    pub async fn put_chunk(
        &self,
        identity: &str,
        chunk_index: u64,
        bytes: Bytes,
    ) -> Result<u64, ChunkError> {
        if !is_valid_identity(identity) {
            return Err(ChunkError::NotFound);
        }
        let dir = self.staging_dir(identity);
        let written = self
            .executor
            .submit(move || write_chunk_blocking(&dir, chunk_index, &bytes))
            .await??;
        debug!(identity, chunk_index, bytes = written, "chunk stored");
        Ok(written)
    }

    /// 按索引顺序合并全部分片并发布到 `target`，返回最终大小。
    pub async fn complete(
        &self,
        identity: &str,
        total_chunks: u64,
        expected_size: u64,
        target: PathBuf,
    ) -> Result<u64, ChunkError> {
        if !is_valid_identity(identity) {
            return Err(ChunkError::NotFound);
        }
        let _guard = self
            .merge_locks
            .lock_with_timeout(identity, self.merge_wait)
            .await
            .ok_or(ChunkError::Busy)?;

        let dir = self.staging_dir(identity);
        let result = self
            .executor
            .submit(move || merge_blocking(&dir, total_chunks, expected_size, &target))
            .await?;
        match &result {
            Ok(size) => info!(identity, total_chunks, size, "upload merged"),
            Err(ChunkError::MissingChunk(index)) => {
                warn!(identity, missing = index, total_chunks, "merge aborted, chunk missing")
            }
            Err(ChunkError::SizeMismatch { expected, actual }) => {
                warn!(identity, expected, actual, "merge aborted, size mismatch")
            }
            Err(err) => warn!(identity, error = %err, "merge failed"),
        }
        result
    }

    /// Drops a staging directory and everything in it.
    pub async fn discard(&self, identity: &str) -> Result<(), ChunkError> {
        if !is_valid_identity(identity) {
            return Err(ChunkError::NotFound);
        }
        let dir = self.staging_dir(identity);
        self.executor
            .submit(move || match fs::remove_dir_all(&dir) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Err(ChunkError::NotFound),
                Err(err) => Err(ChunkError::Io(err)),
            })
            .await?
    }

    /// 清理超过 `ttl` 未更新的暂存目录，返回清理数量。
    pub async fn sweep_stale(&self, ttl: Duration) -> Result<usize, ChunkError> {
        let root = self.staging_root.clone();
        let removed = self
            .executor
            .submit(move || sweep_blocking(&root, ttl))
            .await??;
        self.merge_locks.prune_idle().await;
        Ok(removed)
    }
}

fn write_chunk_blocking(dir: &Path, chunk_index: u64, bytes: &[u8]) -> Result<u64, ChunkError> {
    fs::create_dir_all(dir)?;
    let final_path = dir.join(chunk_file_name(chunk_index));
    let partial_path = dir.join(format!(".{}.{}", chunk_file_name(chunk_index), Uuid::new_v4()));

    let write = || -> io::Result<()> {
        let mut file = File::create(&partial_path)?;
        file.write_all(bytes)?;
        file.sync_data()?;
        fs::rename(&partial_path, &final_path)
    };
    if let Err(err) = write() {
        let _ = fs::remove_file(&partial_path);
        return Err(err.into());
    }
    Ok(bytes.len() as u64)
}

fn merge_blocking(
    dir: &Path,
    total_chunks: u64,
    expected_size: u64,
    target: &Path,
) -> Result<u64, ChunkError> {
    if !dir.is_dir() {
        return Err(ChunkError::NotFound);
    }
    if fs::symlink_metadata(target).is_ok() {
        remove_staging(dir);
        return Err(ChunkError::Conflict(target.display().to_string()));
    }

    let merged = merge_into(dir, total_chunks, target);
    let atomic = match merged {
        Ok(atomic) => atomic,
        Err(err @ ChunkError::MissingChunk(_)) => return Err(err),
        Err(err) => {
            remove_staging(dir);
            return Err(err);
        }
    };
    let (atomic, actual) = atomic;
    if actual != expected_size {
        return Err(ChunkError::SizeMismatch {
            expected: expected_size,
            actual,
        });
    }

    if let Err(err) = atomic.publish() {
        remove_staging(dir);
        if err.kind() == io::ErrorKind::AlreadyExists {
            return Err(ChunkError::Conflict(target.display().to_string()));
        }
        return Err(err.into());
    }

    remove_staging(dir);
    Ok(actual)
}

fn merge_into(
    dir: &Path,
    total_chunks: u64,
    target: &Path,
) -> Result<(AtomicFile, u64), ChunkError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut atomic = AtomicFile::create(target)?;
    let mut total: u64 = 0;
    for index in 0..total_chunks {
        let mut chunk = match File::open(dir.join(chunk_file_name(index))) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ChunkError::MissingChunk(index));
            }
            Err(err) => return Err(err.into()),
        };
        total += io::copy(&mut chunk, atomic.file_mut())?;
    }
    Ok((atomic, total))
}

fn remove_staging(dir: &Path) {
    if let Err(err) = fs::remove_dir_all(dir)
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(path = ?dir, error = %err, "failed to remove staging directory");
    }
}

fn sweep_blocking(root: &Path, ttl: Duration) -> Result<usize, ChunkError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_dir() {
            continue;
        }
        let Some(age) = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
        else {
            continue;
        };
        if age < ttl {
            continue;
        }
        let path = entry.path();
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                removed += 1;
                info!(path = ?path, age_secs = age.as_secs(), "removed stale upload staging");
            }
            Err(err) => warn!(path = ?path, error = %err, "failed to remove stale upload staging"),
        }
    }
    Ok(removed)
}
