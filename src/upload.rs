//! 上传处理器：分片上传、合并、放弃与单次上传。

use axum::body::Bytes;
use axum::extract::multipart::Field;
use axum::extract::{Extension, Json, Multipart};
use axum::http::StatusCode;
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::atomic::AtomicFile;
use crate::chunks::{ChunkAssembler, upload_identity};
use crate::error::ApiError;
use crate::executor::BlockingExecutor;
use crate::media::MediaKind;
use crate::metadata::MetadataCache;
use crate::storage::Storage;

#[derive(Debug)]
pub struct UploadConfig {
    pub max_chunk_size: u64,
}

/// Upload result as returned to clients after a file lands in storage.
#[derive(Debug, Serialize)]
pub struct FileSummary {
    pub name: String,
    pub path: String,
    pub media_type: MediaKind,
    pub size: u64,
    pub is_video: bool,
    pub is_audio: bool,
    pub is_image: bool,
}

impl FileSummary {
    pub fn new(directory: &str, name: &str, size: u64) -> Self {
        let media_type = MediaKind::from_path(name);
        Self {
            name: name.to_string(),
            path: join_relative(directory, name),
            media_type,
            size,
            is_video: media_type == MediaKind::Video,
            is_audio: media_type == MediaKind::Audio,
            is_image: media_type == MediaKind::Image,
        }
    }
}

#[derive(Serialize)]
pub(crate) struct ChunkResponse {
    message: String,
    chunk_index: u64,
    file_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CompleteRequest {
    file_name: String,
    #[serde(default)]
    directory: String,
    total_chunks: u64,
    file_size: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AbortRequest {
    file_name: String,
    #[serde(default)]
    directory: String,
    file_size: u64,
}

#[derive(Serialize)]
pub(crate) struct UploadedResponse {
    message: String,
    file: FileSummary,
}

/// 规范化目录：统一分隔符并去掉首尾斜杠。
pub fn normalize_directory(raw: &str) -> String {
    raw.trim()
        .replace('\\', "/")
        .trim_matches('/')
        .to_string()
}

pub fn join_relative(directory: &str, name: &str) -> String {
    if directory.is_empty() {
        name.to_string()
    } else {
        format!("{directory}/{name}")
    }
}

/// 文件名必须是单个路径段。
pub fn validate_file_name(name: &str) -> Result<&str, ApiError> {
    let name = name.trim();
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(ApiError::BadRequest(format!("invalid file name '{name}'")));
    }
    Ok(name)
}

fn invalid_multipart(err: impl std::fmt::Display) -> ApiError {
    ApiError::BadRequest(format!("invalid multipart body: {err}"))
}

async fn read_limited(mut field: Field<'_>, limit: u64) -> Result<Bytes, ApiError> {
    let mut data = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(invalid_multipart)? {
        if (data.len() + chunk.len()) as u64 > limit {
            return Err(ApiError::BadRequest(format!(
                "chunk exceeds {limit} bytes"
            )));
        }
        data.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(data))
}

fn parse_number(field: &str, value: Option<String>) -> Result<u64, ApiError> {
    value
        .ok_or_else(|| ApiError::BadRequest(format!("{field} is required")))?
        .trim()
        .parse::<u64>()
        .map_err(|_| ApiError::BadRequest(format!("{field} must be a non-negative integer")))
}

/// 接收单个分片。
pub async fn upload_chunk(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(assembler): Extension<Arc<ChunkAssembler>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    mut multipart: Multipart,
) -> Result<JsonResponse<ChunkResponse>, ApiError> {
    let mut data: Option<Bytes> = None;
    let mut directory = String::new();
    let mut file_name = None;
    let mut chunk_index = None;
    let mut total_chunks = None;
    let mut file_size = None;
    let mut chunk_size = None;

    while let Some(field) = multipart.next_field().await.map_err(invalid_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => data = Some(read_limited(field, upload.max_chunk_size).await?),
            "directory" => directory = field.text().await.map_err(invalid_multipart)?,
            "fileName" => file_name = Some(field.text().await.map_err(invalid_multipart)?),
            "chunkIndex" => chunk_index = Some(field.text().await.map_err(invalid_multipart)?),
            "totalChunks" => total_chunks = Some(field.text().await.map_err(invalid_multipart)?),
            "fileSize" => file_size = Some(field.text().await.map_err(invalid_multipart)?),
            "chunkSize" => chunk_size = Some(field.text().await.map_err(invalid_multipart)?),
            _ => {}
        }
    }

    let data = data.ok_or_else(|| ApiError::BadRequest("file is required".into()))?;
    let file_name = file_name.ok_or_else(|| ApiError::BadRequest("fileName is required".into()))?;
    let file_name = validate_file_name(&file_name)?;
    let directory = normalize_directory(&directory);
    let chunk_index = parse_number("chunkIndex", chunk_index)?;
    let total_chunks = parse_number("totalChunks", total_chunks)?;
    let file_size = parse_number("fileSize", file_size)?;
    if chunk_size.is_some() {
        parse_number("chunkSize", chunk_size)?;
    }
    if chunk_index >= total_chunks {
        return Err(ApiError::BadRequest(format!(
            "chunkIndex {chunk_index} out of range for {total_chunks} chunks"
        )));
    }
    storage.resolve(&join_relative(&directory, file_name))?;

    let identity = upload_identity(file_name, file_size, &directory);
    assembler.put_chunk(&identity, chunk_index, data).await?;
    info!(
        identity,
        file_name,
        chunk = chunk_index + 1,
        total_chunks,
        "chunk received"
    );

    Ok(JsonResponse(ChunkResponse {
        message: format!("chunk {}/{total_chunks} uploaded", chunk_index + 1),
        chunk_index,
        file_id: identity,
    }))
}

/// 合并全部分片并发布文件。
pub async fn complete_upload(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(assembler): Extension<Arc<ChunkAssembler>>,
    Extension(metadata): Extension<Arc<MetadataCache>>,
    Json(payload): Json<CompleteRequest>,
) -> Result<JsonResponse<UploadedResponse>, ApiError> {
    let file_name = validate_file_name(&payload.file_name)?;
    let directory = normalize_directory(&payload.directory);
    if payload.total_chunks == 0 {
        return Err(ApiError::BadRequest("totalChunks must be positive".into()));
    }
    let target = storage
        .resolve_target_checked(&join_relative(&directory, file_name))
        .await?;

    let identity = upload_identity(file_name, payload.file_size, &directory);
    let size = assembler
        .complete(&identity, payload.total_chunks, payload.file_size, target.clone())
        .await?;
    metadata.invalidate(&target);

    Ok(JsonResponse(UploadedResponse {
        message: format!("file {file_name} uploaded"),
        file: FileSummary::new(&directory, file_name, size),
    }))
}

/// 放弃上传并清理暂存分片。
pub async fn abort_upload(
    Extension(assembler): Extension<Arc<ChunkAssembler>>,
    Json(payload): Json<AbortRequest>,
) -> Result<StatusCode, ApiError> {
    let file_name = validate_file_name(&payload.file_name)?;
    let directory = normalize_directory(&payload.directory);
    let identity = upload_identity(file_name, payload.file_size, &directory);
    assembler.discard(&identity).await?;
    info!(identity, file_name, "upload aborted");
    Ok(StatusCode::NO_CONTENT)
}

/// 单次上传整个文件（目标已存在时返回 409）。
pub async fn upload_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(metadata): Extension<Arc<MetadataCache>>,
    Extension(executor): Extension<BlockingExecutor>,
    mut multipart: Multipart,
) -> Result<JsonResponse<UploadedResponse>, ApiError> {
    let mut file: Option<(String, Bytes)> = None;
    let mut directory = String::new();

    while let Some(field) = multipart.next_field().await.map_err(invalid_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let name = field.file_name().unwrap_or_default().to_string();
                let data = field.bytes().await.map_err(invalid_multipart)?;
                file = Some((name, data));
            }
            "directory" => directory = field.text().await.map_err(invalid_multipart)?,
            _ => {}
        }
    }

    let (file_name, data) = file.ok_or_else(|| ApiError::BadRequest("file is required".into()))?;
    let file_name = validate_file_name(&file_name)?.to_string();
    let directory = normalize_directory(&directory);
    let target = storage
        .resolve_target_checked(&join_relative(&directory, &file_name))
        .await?;
    if tokio::fs::symlink_metadata(&target).await.is_ok() {
        return Err(ApiError::Conflict(format!("file {file_name} already exists")));
    }

    let size = data.len() as u64;
    let written = target.clone();
    executor
        .submit(move || save_new_file_blocking(&written, &data))
        .await?
        .map_err(|err| match err.kind() {
            ErrorKind::AlreadyExists => ApiError::Conflict("file already exists".into()),
            _ => ApiError::from(err),
        })?;
    metadata.invalidate(&target);
    info!(path = ?target, size, "file uploaded");

    Ok(JsonResponse(UploadedResponse {
        message: format!("file {file_name} uploaded"),
        file: FileSummary::new(&directory, &file_name, size),
    }))
}

fn save_new_file_blocking(target: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut atomic = AtomicFile::create(target)?;
    atomic.file_mut().write_all(data)?;
    debug!(path = ?target, bytes = data.len(), "publishing upload");
    atomic.publish()
}
