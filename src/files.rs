//! 文件浏览、流式播放、预览、下载与目录操作处理器。

use axum::Form;
use axum::extract::{Extension, Path, Query};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::etag::{if_none_match, view_etag};
use crate::executor::BlockingExecutor;
use crate::media::MediaKind;
use crate::metadata::MetadataCache;
use crate::storage::{EntryKind, FileEntry, Storage, remove_dir_blocking, remove_file_blocking};
use crate::stream::{RangeStreamer, attachment_response, insert_header};

#[derive(Deserialize)]
pub(crate) struct ListQuery {
    #[serde(default)]
    path: String,
}

#[derive(Serialize, Default)]
pub(crate) struct Categories {
    videos: Vec<FileEntry>,
    audios: Vec<FileEntry>,
    images: Vec<FileEntry>,
    documents: Vec<FileEntry>,
    others: Vec<FileEntry>,
}

impl Categories {
    fn from_entries(entries: &[FileEntry]) -> Self {
        let mut categories = Self::default();
        for entry in entries.iter().filter(|entry| entry.kind == EntryKind::File) {
            let bucket = match entry.media_type.unwrap_or(MediaKind::Other) {
                MediaKind::Video => &mut categories.videos,
                MediaKind::Audio => &mut categories.audios,
                MediaKind::Image => &mut categories.images,
                MediaKind::Document => &mut categories.documents,
                MediaKind::Other => &mut categories.others,
            };
            bucket.push(entry.clone());
        }
        categories
    }
}

#[derive(Serialize)]
pub(crate) struct ListResponse {
    items: Vec<FileEntry>,
    categories: Categories,
    current_path: String,
}

#[derive(Deserialize)]
pub(crate) struct FolderForm {
    folder_path: String,
}

#[derive(Serialize)]
pub(crate) struct MessageResponse {
    message: String,
}

/// 列出目录树及按媒体类型的分类。
pub async fn list_files(
    Query(ListQuery { path }): Query<ListQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(executor): Extension<BlockingExecutor>,
) -> Result<JsonResponse<ListResponse>, ApiError> {
    let dir = storage.resolve_path_checked(&path, false).await?;
    if !tokio::fs::metadata(&dir).await?.is_dir() {
        return Err(ApiError::NotFound(format!("directory '{path}' not found")));
    }

    let lister = storage.clone();
    let items = executor
        .submit(move || lister.list_tree_blocking(&dir))
        .await??;
    let categories = Categories::from_entries(&items);
    debug!(path, count = items.len(), "list files");
    Ok(JsonResponse(ListResponse {
        items,
        categories,
        current_path: path,
    }))
}

/// Range 感知的媒体流。
pub async fn stream_file(
    Path(path): Path<String>,
    headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(streamer): Extension<Arc<RangeStreamer>>,
) -> Result<Response, ApiError> {
    let target = storage.resolve_path_checked(&path, false).await?;
    let is_media = MediaKind::from_path(&target).is_streamable();
    streamer.stream(&target, &headers, is_media).await
}

/// 预览文件，支持 ETag / 304。
pub async fn view_file(
    Path(path): Path<String>,
    headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(streamer): Extension<Arc<RangeStreamer>>,
) -> Result<Response, ApiError> {
    let target = storage.resolve_path_checked(&path, false).await?;
    let entry = streamer
        .metadata()
        .refresh(&target)
        .await?
        .ok_or_else(|| ApiError::NotFound("file not found".into()))?;

    let etag = view_etag(&target, entry.modified);
    if if_none_match(&headers, &etag) {
        let mut response_headers = HeaderMap::new();
        insert_header(&mut response_headers, header::ETAG, &etag)?;
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    let mut response = streamer
        .stream_entry(&target, &entry, &headers, entry.media_type.is_streamable())
        .await?;
    insert_header(response.headers_mut(), header::ETAG, &etag)?;
    Ok(response)
}

/// 整文件下载。
pub async fn download_file(
    Path(path): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(metadata): Extension<Arc<MetadataCache>>,
) -> Result<Response, ApiError> {
    let target = storage.resolve_path_checked(&path, false).await?;
    let entry = metadata
        .get(&target)
        .await?
        .ok_or_else(|| ApiError::NotFound("file not found".into()))?;
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    info!(path, size = entry.size, "download file");
    attachment_response(&target, &entry, &file_name).await
}

/// 创建文件夹（已存在时视为成功）。
pub async fn create_folder(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(executor): Extension<BlockingExecutor>,
    Form(FolderForm { folder_path }): Form<FolderForm>,
) -> Result<JsonResponse<MessageResponse>, ApiError> {
    let folder_path = folder_path.trim().trim_start_matches(['/', '\\']).to_string();
    if folder_path.is_empty() {
        return Err(ApiError::BadRequest("folder_path is required".into()));
    }
    let target = storage.resolve_target_checked(&folder_path).await?;

    let created = executor
        .submit(move || match std::fs::metadata(&target) {
            Ok(metadata) if metadata.is_dir() => Ok(false),
            Ok(_) => Err(std::io::Error::new(
                ErrorKind::AlreadyExists,
                "a file with this name exists",
            )),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                std::fs::create_dir_all(&target).map(|_| true)
            }
            Err(err) => Err(err),
        })
        .await?
        .map_err(|err| match err.kind() {
            ErrorKind::AlreadyExists => ApiError::BadRequest(err.to_string()),
            _ => ApiError::from(err),
        })?;

    let message = if created {
        info!(path = folder_path, "folder created");
        format!("folder {folder_path} created")
    } else {
        format!("folder {folder_path} already exists")
    };
    Ok(JsonResponse(MessageResponse { message }))
}

/// 递归删除文件夹。
pub async fn delete_folder(
    Path(path): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(metadata): Extension<Arc<MetadataCache>>,
    Extension(executor): Extension<BlockingExecutor>,
) -> Result<JsonResponse<MessageResponse>, ApiError> {
    let target = storage.resolve_path_checked(&path, false).await?;
    if target.as_path() == storage.root_path() {
        return Err(ApiError::Forbidden("cannot delete storage root".into()));
    }

    let removed = target.clone();
    executor
        .submit(move || remove_dir_blocking(&removed))
        .await??;
    metadata.invalidate_prefix(&target);
    info!(path, "folder deleted");
    Ok(JsonResponse(MessageResponse {
        message: format!("folder {path} deleted"),
    }))
}

/// 删除单个文件。
pub async fn delete_file(
    Path(path): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(metadata): Extension<Arc<MetadataCache>>,
    Extension(executor): Extension<BlockingExecutor>,
) -> Result<JsonResponse<MessageResponse>, ApiError> {
    let target = storage.resolve_path_checked(&path, false).await?;

    let removed = target.clone();
    executor
        .submit(move || remove_file_blocking(&removed))
        .await??;
    metadata.invalidate(&target);
    info!(path, "file deleted");
    Ok(JsonResponse(MessageResponse {
        message: format!("file {path} deleted"),
    }))
}
