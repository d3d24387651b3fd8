//! 临时文件写入与不覆盖的原子发布。
//!
//! The merged file is written under a hidden name next to its target and only
//! becomes visible once complete. Publication never replaces an existing
//! file: it hard-links the temp file to the target, which fails with
//! `AlreadyExists` if something got there first. Filesystems without hard
//! link support fall back to a checked rename. An unpublished temp file is
//! removed on drop. These are blocking calls meant for the I/O worker pool.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
    published: bool,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub fn create(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_path = parent.join(format!(".{base}.tmp.{}", Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
            published: false,
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// 同步数据并发布到目标路径（目标已存在时返回 `AlreadyExists`）。
    pub fn publish(mut self) -> io::Result<()> {
        self.file.sync_all()?;

        match fs::hard_link(&self.temp_path, &self.target) {
            Ok(()) => {
                self.published = true;
                if let Err(err) = fs::remove_file(&self.temp_path) {
                    warn!(path = ?self.temp_path, error = %err, "failed to remove merge temp file");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Err(err),
            Err(_) => {
                if fs::symlink_metadata(&self.target).is_ok() {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "target already exists",
                    ));
                }
                fs::rename(&self.temp_path, &self.target)?;
                self.published = true;
            }
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent);
        }
        Ok(())
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if !self.published {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn publish_moves_content_into_place() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("out.bin");
        let mut atomic = AtomicFile::create(&target).expect("create");
        atomic.file_mut().write_all(b"hello").expect("write");
        let temp_path = atomic.temp_path().to_path_buf();
        atomic.publish().expect("publish");

        assert_eq!(std::fs::read(&target).expect("read"), b"hello");
        assert!(!temp_path.exists());
    }

    #[test]
    fn publish_refuses_to_overwrite() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("out.bin");
        std::fs::write(&target, b"original").expect("write");

        let mut atomic = AtomicFile::create(&target).expect("create");
        atomic.file_mut().write_all(b"new").expect("write");
        let temp_path = atomic.temp_path().to_path_buf();
        let err = atomic.publish().expect_err("must not overwrite");

        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&target).expect("read"), b"original");
        assert!(!temp_path.exists(), "temp file removed on drop");
    }

    #[test]
    fn dropping_unpublished_file_leaves_nothing() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("out.bin");
        let atomic = AtomicFile::create(&target).expect("create");
        drop(atomic);
        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 0);
    }
}
