//! 统一的 API 错误类型与转换。
//!
//! Every error leaves the server as `{"kind": ..., "message": ...}` so that
//! clients can branch on a stable kind instead of parsing prose.

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::io::ErrorKind;

use crate::chunks::ChunkError;
use crate::executor::ExecutorError;
use crate::links::LinkError;
use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Gone(String),
    MissingChunk(u64),
    SizeMismatch { expected: u64, actual: u64 },
    RangeNotSatisfiable(u64),
    Io(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    kind: &'a str,
    message: String,
}

impl ApiError {
    /// 稳定的机器可读错误类型。
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Gone(_) => "gone",
            ApiError::MissingChunk(_) => "missing_chunk",
            ApiError::SizeMismatch { .. } => "size_mismatch",
            ApiError::RangeNotSatisfiable(_) => "range_not_satisfiable",
            ApiError::Io(_) => "io_failure",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::MissingChunk(_) | ApiError::SizeMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Io(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::Gone(msg)
            | ApiError::Io(msg)
            | ApiError::Internal(msg) => msg.clone(),
            ApiError::Unauthorized => "unauthorized".into(),
            ApiError::MissingChunk(index) => format!("chunk {index} is missing"),
            ApiError::SizeMismatch { expected, actual } => {
                format!("size mismatch: expected {expected} bytes, merged {actual} bytes")
            }
            ApiError::RangeNotSatisfiable(_) => "range not satisfiable".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        if let ApiError::RangeNotSatisfiable(size) = &self
            && let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}"))
        {
            headers.insert(header::CONTENT_RANGE, value);
        }
        let body = ErrorBody {
            kind: self.kind(),
            message: self.message(),
        };
        (self.status(), headers, Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::Forbidden("path escapes storage root".into()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
                _ => ApiError::Io(err.to_string()),
            },
        }
    }
}

impl From<ChunkError> for ApiError {
    fn from(error: ChunkError) -> Self {
        match error {
            ChunkError::NotFound => ApiError::NotFound(error.to_string()),
            ChunkError::Conflict(_) | ChunkError::Busy => ApiError::Conflict(error.to_string()),
            ChunkError::MissingChunk(index) => ApiError::MissingChunk(index),
            ChunkError::SizeMismatch { expected, actual } => {
                ApiError::SizeMismatch { expected, actual }
            }
            ChunkError::Io(err) => ApiError::Io(err.to_string()),
            ChunkError::Executor(err) => ApiError::from(err),
        }
    }
}

impl From<LinkError> for ApiError {
    fn from(error: LinkError) -> Self {
        match error {
            LinkError::NotFound => ApiError::NotFound(error.to_string()),
            LinkError::Expired => ApiError::Gone(error.to_string()),
        }
    }
}

impl From<ExecutorError> for ApiError {
    fn from(error: ExecutorError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
            ErrorKind::AlreadyExists => ApiError::Conflict(err.to_string()),
            _ => ApiError::Io(err.to_string()),
        }
    }
}
