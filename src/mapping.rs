//! 本地文件映射：硬链接优先，失败时回退为复制。
//!
//! Mapping sources are directories on the server host whose files may be
//! linked into the storage tree. The list is persisted as a JSON array and
//! owned by [`MappingSources`]. When the list is non-empty, every local path
//! named by a request must live under one of the sources.

use axum::extract::{Extension, Json};
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::executor::BlockingExecutor;
use crate::metadata::MetadataCache;
use crate::storage::Storage;
use crate::upload::{FileSummary, join_relative, normalize_directory, validate_file_name};

/// Allowed difference between the client's and the server's mtime.
const LAST_MODIFIED_TOLERANCE_MS: u64 = 60_000;

/// Home folders offered as mapping suggestions.
#[cfg(target_os = "macos")]
const HOME_SUGGESTIONS: &[&str] = &["Downloads", "Desktop", "Documents", "Pictures", "Movies"];
#[cfg(not(target_os = "macos"))]
const HOME_SUGGESTIONS: &[&str] = &["Downloads", "Desktop", "Documents", "Pictures", "Videos"];

/// Home folders searched by `check-local-file` when no mapping sources are set.
const HOME_SEARCH_DIRS: &[&str] = &["Downloads", "Desktop"];

#[derive(Debug)]
pub struct MappingSources {
    config_path: PathBuf,
    sources: RwLock<Vec<PathBuf>>,
}

impl MappingSources {
    /// 从配置文件加载映射源（文件缺失或格式错误时为空列表）。
    pub fn load(config_path: PathBuf) -> Self {
        let sources = match fs::read(&config_path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<String>>(&bytes) {
                Ok(list) => list.into_iter().map(PathBuf::from).collect(),
                Err(err) => {
                    warn!(path = ?config_path, error = %err, "invalid mapping sources file");
                    Vec::new()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                warn!(path = ?config_path, error = %err, "failed to read mapping sources");
                Vec::new()
            }
        };
        info!(count = sources.len(), "mapping sources loaded");
        Self {
            config_path,
            sources: RwLock::new(sources),
        }
    }

    pub async fn snapshot(&self) -> Vec<PathBuf> {
        self.sources.read().await.clone()
    }

    /// 替换映射源并写回配置文件。
    pub async fn replace(&self, sources: Vec<PathBuf>) -> io::Result<()> {
        let mut current = self.sources.write().await;
        let list: Vec<String> = sources
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        let body = serde_json::to_vec_pretty(&list)?;
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.config_path, body).await?;
        *current = sources;
        Ok(())
    }
}

/// With no sources configured every path is allowed.
pub fn is_permitted(sources: &[PathBuf], path: &Path) -> bool {
    if sources.is_empty() {
        return true;
    }
    let Ok(path) = path.canonicalize() else {
        return false;
    };
    sources.iter().any(|source| {
        source
            .canonicalize()
            .is_ok_and(|source| path.starts_with(source))
    })
}

/// 系统默认路径建议：主目录下常用文件夹（Linux 另含 `/mnt`），仅保留存在的目录。
pub fn default_paths_under(home: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = home
        .map(|home| HOME_SUGGESTIONS.iter().map(|name| home.join(name)).collect())
        .unwrap_or_default();
    if cfg!(target_os = "linux") {
        candidates.push(PathBuf::from("/mnt"));
    }
    candidates.retain(|path| path.is_dir());
    candidates
}

/// Directories `check-local-file` walks: the configured sources, or the
/// user's Downloads and Desktop when none are configured.
fn search_dirs(sources: &[PathBuf], home: Option<&Path>) -> Vec<PathBuf> {
    if !sources.is_empty() {
        return sources.to_vec();
    }
    home.map(|home| HOME_SEARCH_DIRS.iter().map(|name| home.join(name)).collect())
        .unwrap_or_default()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MapMethod {
    Hardlink,
    Copy,
}

/// 创建硬链接，失败时复制；目标已存在时返回 `AlreadyExists`。
pub fn link_or_copy_blocking(source: &Path, target: &Path) -> io::Result<MapMethod> {
    match fs::hard_link(source, target) {
        Ok(()) => return Ok(MapMethod::Hardlink),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => return Err(err),
        Err(err) => debug!(source = ?source, error = %err, "hard link failed, copying"),
    }

    let mut input = fs::File::open(source)?;
    let mut output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)?;
    if let Err(err) = io::copy(&mut input, &mut output).and_then(|_| output.sync_all()) {
        drop(output);
        let _ = fs::remove_file(target);
        return Err(err);
    }
    Ok(MapMethod::Copy)
}

#[derive(Serialize)]
pub(crate) struct SourcesResponse {
    sources: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DefaultPathsResponse {
    system: &'static str,
    default_paths: Vec<String>,
}

#[derive(Deserialize)]
pub(crate) struct SourcesUpdateRequest {
    sources: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SourcesUpdateResponse {
    success: bool,
    valid_sources: Vec<String>,
    invalid_sources: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CheckLocalFileRequest {
    file_name: String,
    #[serde(default)]
    directory: String,
    file_size: u64,
    last_modified: Option<i64>,
    local_path: Option<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CheckLocalFileResponse {
    can_map: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl CheckLocalFileResponse {
    fn found(path: &Path) -> Self {
        Self {
            can_map: true,
            local_path: Some(path.to_string_lossy().to_string()),
            source_directory: path
                .parent()
                .map(|parent| parent.to_string_lossy().to_string()),
            reason: None,
        }
    }

    fn rejected(reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MapLocalFileRequest {
    file_name: String,
    #[serde(default)]
    directory: String,
    local_path: String,
}

#[derive(Serialize)]
pub(crate) struct MapLocalFileResponse {
    message: String,
    file: FileSummary,
    mapped_from: String,
    method: MapMethod,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MapAllRequest {
    source_path: String,
    #[serde(default)]
    target_path: String,
    #[serde(default)]
    include_subfolders: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MapAllResponse {
    success: bool,
    mapped_count: u64,
    skipped_count: u64,
}

/// 查询映射源列表。
pub async fn get_mapping_sources(
    Extension(mapping): Extension<Arc<MappingSources>>,
) -> JsonResponse<SourcesResponse> {
    let sources = mapping
        .snapshot()
        .await
        .iter()
        .map(|path| path.to_string_lossy().to_string())
        .collect();
    JsonResponse(SourcesResponse { sources })
}

/// 更新映射源列表（仅保留存在的目录）。
pub async fn update_mapping_sources(
    Extension(mapping): Extension<Arc<MappingSources>>,
    Extension(executor): Extension<BlockingExecutor>,
    Json(payload): Json<SourcesUpdateRequest>,
) -> Result<JsonResponse<SourcesUpdateResponse>, ApiError> {
    let (valid, invalid) = executor
        .submit(move || {
            let mut valid = Vec::new();
            let mut invalid = Vec::new();
            for source in payload.sources {
                let path = PathBuf::from(source.trim());
                if path.is_absolute() && path.is_dir() {
                    valid.push(path);
                } else {
                    invalid.push(source);
                }
            }
            (valid, invalid)
        })
        .await?;

    let valid_sources = valid
        .iter()
        .map(|path| path.to_string_lossy().to_string())
        .collect();
    mapping.replace(valid).await?;
    info!(invalid = invalid.len(), "mapping sources updated");
    Ok(JsonResponse(SourcesUpdateResponse {
        success: true,
        valid_sources,
        invalid_sources: invalid,
    }))
}

/// 返回当前系统上存在的默认路径建议。
pub async fn get_system_default_paths(
    Extension(executor): Extension<BlockingExecutor>,
) -> Result<JsonResponse<DefaultPathsResponse>, ApiError> {
    let paths = executor
        .submit(|| default_paths_under(dirs::home_dir().as_deref()))
        .await?;
    Ok(JsonResponse(DefaultPathsResponse {
        system: std::env::consts::OS,
        default_paths: paths
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect(),
    }))
}

/// 检查是否存在可映射的同名同大小本地文件。
pub async fn check_local_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(mapping): Extension<Arc<MappingSources>>,
    Extension(executor): Extension<BlockingExecutor>,
    Json(payload): Json<CheckLocalFileRequest>,
) -> Result<JsonResponse<CheckLocalFileResponse>, ApiError> {
    let file_name = validate_file_name(&payload.file_name)?.to_string();
    let directory = normalize_directory(&payload.directory);
    let target = storage
        .resolve_target_checked(&join_relative(&directory, &file_name))
        .await?;
    let sources = mapping.snapshot().await;

    let response = executor
        .submit(move || {
            let search = search_dirs(&sources, dirs::home_dir().as_deref());
            find_local_match(&target, &file_name, &payload, &sources, &search)
        })
        .await?;
    debug!(can_map = response.can_map, "check local file");
    Ok(JsonResponse(response))
}

fn find_local_match(
    target: &Path,
    file_name: &str,
    request: &CheckLocalFileRequest,
    sources: &[PathBuf],
    search: &[PathBuf],
) -> CheckLocalFileResponse {
    if let Ok(existing) = fs::metadata(target)
        && existing.is_file()
        && existing.len() == request.file_size
    {
        return CheckLocalFileResponse::rejected("file already exists at target");
    }

    if let Some(local) = request.local_path.as_deref().map(PathBuf::from)
        && is_permitted(sources, &local)
        && fs::metadata(&local).is_ok_and(|meta| meta.is_file() && meta.len() == request.file_size)
    {
        return CheckLocalFileResponse::found(&local);
    }

    for source in search.iter().filter(|source| source.is_dir()) {
        let direct = source.join(file_name);
        if fs::metadata(&direct).is_ok_and(|meta| meta.is_file() && meta.len() == request.file_size)
        {
            return CheckLocalFileResponse::found(&direct);
        }

        let Ok(children) = fs::read_dir(source) else {
            continue;
        };
        for child in children.flatten() {
            let candidate = child.path().join(file_name);
            let Ok(meta) = fs::metadata(&candidate) else {
                continue;
            };
            if !meta.is_file() || meta.len() != request.file_size {
                continue;
            }
            if let Some(expected) = request.last_modified
                && !mtime_matches(&meta, expected)
            {
                continue;
            }
            return CheckLocalFileResponse::found(&candidate);
        }
    }

    CheckLocalFileResponse::rejected("no matching local file found")
}

fn mtime_matches(meta: &fs::Metadata, expected_ms: i64) -> bool {
    let Some(actual_ms) = meta
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .and_then(|since| i64::try_from(since.as_millis()).ok())
    else {
        return false;
    };
    actual_ms.abs_diff(expected_ms) <= LAST_MODIFIED_TOLERANCE_MS
}

/// 将本地文件映射到存储目录。
pub async fn map_local_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(mapping): Extension<Arc<MappingSources>>,
    Extension(metadata): Extension<Arc<MetadataCache>>,
    Extension(executor): Extension<BlockingExecutor>,
    Json(payload): Json<MapLocalFileRequest>,
) -> Result<JsonResponse<MapLocalFileResponse>, ApiError> {
    let file_name = validate_file_name(&payload.file_name)?.to_string();
    let directory = normalize_directory(&payload.directory);
    let source = PathBuf::from(&payload.local_path);
    let source_meta = tokio::fs::metadata(&source)
        .await
        .ok()
        .filter(|meta| meta.is_file())
        .ok_or_else(|| ApiError::NotFound("source file not found".into()))?;
    if !is_permitted(&mapping.snapshot().await, &source) {
        return Err(ApiError::Forbidden(
            "source is outside the mapping sources".into(),
        ));
    }

    let target = storage
        .resolve_target_checked(&join_relative(&directory, &file_name))
        .await?;
    if tokio::fs::symlink_metadata(&target).await.is_ok() {
        return Err(ApiError::Conflict("target file already exists".into()));
    }

    let (from, to) = (source.clone(), target.clone());
    let method = executor
        .submit(move || {
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            link_or_copy_blocking(&from, &to)
        })
        .await??;
    metadata.invalidate(&target);
    info!(source = ?source, target = ?target, ?method, "local file mapped");

    Ok(JsonResponse(MapLocalFileResponse {
        message: format!("file {file_name} mapped"),
        file: FileSummary::new(&directory, &file_name, source_meta.len()),
        mapped_from: payload.local_path,
        method,
    }))
}

/// 批量映射整个文件夹，已存在的目标跳过。
pub async fn map_all_contents(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(mapping): Extension<Arc<MappingSources>>,
    Extension(metadata): Extension<Arc<MetadataCache>>,
    Extension(executor): Extension<BlockingExecutor>,
    Json(payload): Json<MapAllRequest>,
) -> Result<JsonResponse<MapAllResponse>, ApiError> {
    let source = PathBuf::from(&payload.source_path);
    if !tokio::fs::metadata(&source)
        .await
        .is_ok_and(|meta| meta.is_dir())
    {
        return Err(ApiError::NotFound("source folder not found".into()));
    }
    if !is_permitted(&mapping.snapshot().await, &source) {
        return Err(ApiError::Forbidden(
            "source is outside the mapping sources".into(),
        ));
    }
    let target_dir = storage
        .resolve_target_checked(&normalize_directory(&payload.target_path))
        .await?;

    let (from, to) = (source.clone(), target_dir.clone());
    let include_subfolders = payload.include_subfolders;
    let (mapped, skipped) = executor
        .submit(move || -> io::Result<(u64, u64)> {
            fs::create_dir_all(&to)?;
            let mut counts = (0, 0);
            map_dir_blocking(&from, &to, include_subfolders, &mut counts)?;
            Ok(counts)
        })
        .await??;
    metadata.invalidate_prefix(&target_dir);
    info!(source = ?source, mapped, skipped, "folder mapped");

    Ok(JsonResponse(MapAllResponse {
        success: true,
        mapped_count: mapped,
        skipped_count: skipped,
    }))
}

fn map_dir_blocking(
    source: &Path,
    target: &Path,
    recursive: bool,
    counts: &mut (u64, u64),
) -> io::Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest = target.join(entry.file_name());
        if file_type.is_file() {
            if fs::symlink_metadata(&dest).is_ok() {
                counts.1 += 1;
                continue;
            }
            match link_or_copy_blocking(&entry.path(), &dest) {
                Ok(_) => counts.0 += 1,
                Err(err) => {
                    warn!(source = ?entry.path(), target = ?dest, error = %err, "failed to map file");
                    counts.1 += 1;
                }
            }
        } else if file_type.is_dir() && recursive {
            fs::create_dir_all(&dest)?;
            map_dir_blocking(&entry.path(), &dest, recursive, counts)?;
        }
    }
    Ok(())
}
