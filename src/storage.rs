//! 存储根目录的路径约束与基础文件操作。
//!
//! Every user supplied path goes through [`resolve_storage_path`] before the
//! filesystem is touched. [`Storage::resolve_path_checked`] additionally walks
//! the resolved path and refuses symlinked components, so a link placed
//! inside the root cannot point a request outside of it.

use serde::Serialize;
use std::cmp::Ordering;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::ErrorKind;

use crate::media::MediaKind;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path escapes storage root")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 将用户路径约束在 `root` 之下。
///
/// Separators are normalised (`\` becomes `/`, repeated separators collapse,
/// `.` segments are dropped). Absolute paths, drive prefixes and any `..`
/// segment are rejected outright. The empty path resolves to `root`.
pub fn resolve_storage_path(root: &Path, user_path: &str) -> Result<PathBuf, StorageError> {
    if user_path.starts_with(['/', '\\']) || user_path.contains('\0') {
        return Err(StorageError::InvalidPath);
    }

    let mut normalized = PathBuf::new();
    for segment in user_path.split(['/', '\\']) {
        if segment.is_empty() {
            continue;
        }
        for component in Path::new(segment).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath);
                }
            }
        }
    }

    let resolved = root.join(normalized);
    if !resolved.starts_with(root) {
        return Err(StorageError::InvalidPath);
    }
    Ok(resolved)
}

/// Root-relative display form with `/` separators.
pub fn relative_display(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    Some(
        relative
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/"),
    )
}

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        resolve_storage_path(&self.root, relative)
    }

    /// 解析路径并拒绝任何符号链接组件。
    pub async fn resolve_path_checked(
        &self,
        relative: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    /// Like [`Storage::resolve_path_checked`] but tolerates any number of
    /// missing trailing components, for targets whose parents are created
    /// on demand.
    pub async fn resolve_target_checked(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let target = self.resolve(relative)?;
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = self.root.clone();
        for component in relative.components() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) if metadata.file_type().is_symlink() => {
                    return Err(StorageError::InvalidPath);
                }
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) => return Err(StorageError::Io(err)),
            }
        }
        Ok(target)
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = self.root.clone();
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err)
                    if err.kind() == ErrorKind::NotFound
                        && allow_missing_leaf
                        && components.peek().is_none() =>
                {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// 递归列出目录（阻塞调用，应在工作池中执行）。
    pub fn list_tree_blocking(&self, dir: &Path) -> Result<Vec<FileEntry>, StorageError> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if is_merge_temp_name(&name) {
                continue;
            }
            let metadata = std::fs::symlink_metadata(entry.path())?;
            if metadata.file_type().is_symlink() {
                continue;
            }
            let path = relative_display(&self.root, &entry.path()).ok_or(StorageError::InvalidPath)?;

            if metadata.is_dir() {
                let children = self.list_tree_blocking(&entry.path())?;
                entries.push(FileEntry {
                    name,
                    path,
                    kind: EntryKind::Folder,
                    media_type: None,
                    size: None,
                    is_video: None,
                    is_audio: None,
                    is_image: None,
                    children: Some(children),
                });
            } else {
                let media = MediaKind::from_path(&name);
                entries.push(FileEntry {
                    name,
                    path,
                    kind: EntryKind::File,
                    media_type: Some(media),
                    size: Some(metadata.len()),
                    is_video: Some(media == MediaKind::Video),
                    is_audio: Some(media == MediaKind::Audio),
                    is_image: Some(media == MediaKind::Image),
                    children: None,
                });
            }
        }

        entries.sort_by(|a, b| match (a.kind, b.kind) {
            (EntryKind::Folder, EntryKind::File) => Ordering::Less,
            (EntryKind::File, EntryKind::Folder) => Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });
        Ok(entries)
    }
}

/// Temporary merge outputs are named `.<name>.tmp.<uuid>`.
pub fn is_merge_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(".tmp.")
}

/// 阻塞删除单个文件。
pub fn remove_file_blocking(path: &Path) -> Result<(), StorageError> {
    let metadata = std::fs::symlink_metadata(path)?;
    if !metadata.is_file() {
        return Err(StorageError::Io(io::Error::new(
            ErrorKind::NotFound,
            "file not found",
        )));
    }
    std::fs::remove_file(path)?;
    Ok(())
}

/// 阻塞递归删除目录。
pub fn remove_dir_blocking(path: &Path) -> Result<(), StorageError> {
    let metadata = std::fs::symlink_metadata(path)?;
    if !metadata.is_dir() {
        return Err(StorageError::Io(io::Error::new(
            ErrorKind::NotFound,
            "folder not found",
        )));
    }
    std::fs::remove_dir_all(path)?;
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

#[derive(Clone, Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_video: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_audio: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_image: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileEntry>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        let root = Path::new("/srv/storage");
        for bad in [
            "../../etc/passwd",
            "a/../../b",
            "/etc/passwd",
            "\\windows\\system32",
            "a/..",
            "a\\..\\..\\b",
        ] {
            assert!(
                matches!(
                    resolve_storage_path(root, bad),
                    Err(StorageError::InvalidPath)
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn accepts_nested_relative_paths() {
        let root = Path::new("/srv/storage");
        let resolved = resolve_storage_path(root, "a/b/c.txt").expect("resolve");
        assert_eq!(resolved, root.join("a").join("b").join("c.txt"));
    }

    #[test]
    fn collapses_redundant_separators() {
        let root = Path::new("/srv/storage");
        let resolved = resolve_storage_path(root, "a//./b\\c.txt").expect("resolve");
        assert_eq!(resolved, root.join("a").join("b").join("c.txt"));
        assert_eq!(resolve_storage_path(root, "").expect("root"), root);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_path_rejects_symlink() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).expect("create root");

        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write outside file");
        symlink(&outside, root.join("link")).expect("symlink");

        let storage = Storage::new(root);
        let result = storage.resolve_path_checked("link", false).await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));
        let result = storage.resolve_target_checked("link/nested.txt").await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));
    }

    #[tokio::test]
    async fn missing_leaf_is_allowed_only_when_requested() {
        let temp = tempdir().expect("tempdir");
        let storage = Storage::new(temp.path().to_path_buf());

        let result = storage.resolve_path_checked("missing.txt", false).await;
        assert!(matches!(result, Err(StorageError::Io(_))));
        storage
            .resolve_path_checked("missing.txt", true)
            .await
            .expect("missing leaf allowed");
        let result = storage.resolve_path_checked("missing/deeper.txt", true).await;
        assert!(matches!(result, Err(StorageError::Io(_))));
        storage
            .resolve_target_checked("missing/deeper.txt")
            .await
            .expect("missing parents allowed");
    }

    #[test]
    fn list_tree_nests_folders_and_skips_merge_temps() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        std::fs::create_dir_all(root.join("videos")).expect("mkdir");
        std::fs::write(root.join("videos/clip.mp4"), b"1234").expect("write");
        std::fs::write(root.join("b.txt"), b"x").expect("write");
        std::fs::write(root.join(".b.txt.tmp.123"), b"x").expect("write");

        let storage = Storage::new(root.clone());
        let entries = storage.list_tree_blocking(&root).expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::Folder);
        let children = entries[0].children.as_ref().expect("children");
        assert_eq!(children[0].path, "videos/clip.mp4");
        assert_eq!(children[0].media_type, Some(MediaKind::Video));
        assert_eq!(children[0].size, Some(4));
        assert_eq!(entries[1].name, "b.txt");
    }

    #[test]
    fn remove_helpers_check_entry_type() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join("dir");
        std::fs::create_dir_all(&dir).expect("mkdir");
        let file = temp.path().join("f.txt");
        std::fs::write(&file, b"x").expect("write");

        assert!(remove_file_blocking(&dir).is_err());
        assert!(remove_dir_blocking(&file).is_err());
        remove_file_blocking(&file).expect("remove file");
        remove_dir_blocking(&dir).expect("remove dir");
        assert!(!file.exists() && !dir.exists());
    }
}
