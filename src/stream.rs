//! 支持 Range 的文件流式响应。
//!
//! A response is planned from the file size, the Range header and whether the
//! file is video/audio, then its body is a lazy [`ReaderStream`] over a
//! bounded reader. The stream owns the file handle; dropping the response
//! body (client gone) closes the file, and the reader never yields bytes
//! past the planned end offset.

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, Take};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::config::{MEDIA_PREVIEW_WINDOW, STREAM_CHUNK_SIZE};
use crate::error::ApiError;
use crate::metadata::{MetadataCache, MetadataEntry};
use crate::range::{ByteRange, RangeRequest, parse_range};

/// Lazily read file slice. Finite, not restartable.
pub type RangeStream = ReaderStream<Take<File>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamPlan {
    pub status: StatusCode,
    /// `None` only for an empty file.
    pub range: Option<ByteRange>,
    pub total_size: u64,
}

impl StreamPlan {
    pub fn content_length(&self) -> u64 {
        self.range.map_or(0, |range| range.len())
    }
}

/// 根据文件大小、Range 头与媒体类型决定响应状态与区间。
pub fn plan_stream(
    file_size: u64,
    range_header: Option<&str>,
    is_media: bool,
) -> Result<StreamPlan, ApiError> {
    let request = parse_range(range_header, file_size);
    if request == RangeRequest::Malformed {
        debug!(range = range_header, "malformed range header, serving as if absent");
    }
    match request {
        RangeRequest::Satisfiable(range) => Ok(StreamPlan {
            status: StatusCode::PARTIAL_CONTENT,
            range: Some(range),
            total_size: file_size,
        }),
        RangeRequest::Unsatisfiable => Err(ApiError::RangeNotSatisfiable(file_size)),
        RangeRequest::Absent | RangeRequest::Malformed => {
            if file_size == 0 {
                return Ok(StreamPlan {
                    status: StatusCode::OK,
                    range: None,
                    total_size: 0,
                });
            }
            if is_media {
                let end = MEDIA_PREVIEW_WINDOW.min(file_size) - 1;
                return Ok(StreamPlan {
                    status: StatusCode::PARTIAL_CONTENT,
                    range: Some(ByteRange { start: 0, end }),
                    total_size: file_size,
                });
            }
            Ok(StreamPlan {
                status: StatusCode::OK,
                range: Some(ByteRange {
                    start: 0,
                    end: file_size - 1,
                }),
                total_size: file_size,
            })
        }
    }
}

/// 定位到区间起点，返回按 512KiB 分块的惰性流。
pub async fn range_stream(mut file: File, range: ByteRange) -> std::io::Result<RangeStream> {
    file.seek(SeekFrom::Start(range.start)).await?;
    Ok(ReaderStream::with_capacity(
        file.take(range.len()),
        STREAM_CHUNK_SIZE,
    ))
}

#[derive(Clone, Debug)]
pub struct RangeStreamer {
    metadata: Arc<MetadataCache>,
}

impl RangeStreamer {
    pub fn new(metadata: Arc<MetadataCache>) -> Self {
        Self { metadata }
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    /// Looks the file up in the metadata cache, then streams it.
    pub async fn stream(
        &self,
        path: &Path,
        request_headers: &HeaderMap,
        is_media: bool,
    ) -> Result<Response, ApiError> {
        let entry = self
            .metadata
            .get(path)
            .await?
            .ok_or_else(|| ApiError::NotFound("file not found".into()))?;
        self.stream_entry(path, &entry, request_headers, is_media)
            .await
    }

    /// 使用已知元数据构建流式响应。
    pub async fn stream_entry(
        &self,
        path: &Path,
        entry: &MetadataEntry,
        request_headers: &HeaderMap,
        is_media: bool,
    ) -> Result<Response, ApiError> {
        let range_header = request_headers
            .get(header::RANGE)
            .and_then(|value| value.to_str().ok());

        let file = File::open(path).await?;
        let actual_size = file.metadata().await?.len();
        if actual_size != entry.size {
            // Cached size is stale; plan against what is on disk now.
            self.metadata.invalidate(path);
        }

        let plan = plan_stream(actual_size, range_header, is_media)?;

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, header::CONTENT_TYPE, &entry.content_type)?;
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        insert_header(
            &mut headers,
            header::CONTENT_LENGTH,
            &plan.content_length().to_string(),
        )?;

        let Some(range) = plan.range else {
            return Ok((plan.status, headers, AxumBody::empty()).into_response());
        };
        if plan.status == StatusCode::PARTIAL_CONTENT {
            insert_header(
                &mut headers,
                header::CONTENT_RANGE,
                &range.content_range(plan.total_size),
            )?;
        }
        debug!(
            path = ?path,
            start = range.start,
            end = range.end,
            total = plan.total_size,
            status = plan.status.as_u16(),
            "stream file"
        );

        let stream = range_stream(file, range).await?;
        Ok((plan.status, headers, AxumBody::from_stream(stream)).into_response())
    }
}

/// 整文件下载响应（附件形式，不处理 Range）。
pub async fn attachment_response(
    path: &Path,
    entry: &MetadataEntry,
    file_name: &str,
) -> Result<Response, ApiError> {
    let file = File::open(path).await?;
    let size = file.metadata().await?.len();

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, header::CONTENT_TYPE, &entry.content_type)?;
    insert_header(&mut headers, header::CONTENT_LENGTH, &size.to_string())?;
    insert_header(
        &mut headers,
        header::CONTENT_DISPOSITION,
        &format!(
            "attachment; filename*=UTF-8''{}",
            urlencoding::encode(file_name)
        ),
    )?;
    if let Some(modified) = entry.modified {
        insert_header(
            &mut headers,
            header::LAST_MODIFIED,
            &httpdate::fmt_http_date(modified),
        )?;
    }

    let stream = ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE);
    Ok((StatusCode::OK, headers, AxumBody::from_stream(stream)).into_response())
}

pub fn insert_header(
    headers: &mut HeaderMap,
    name: header::HeaderName,
    value: &str,
) -> Result<(), ApiError> {
    let value =
        HeaderValue::from_str(value).map_err(|_| ApiError::Internal("响应头构建失败".into()))?;
    headers.insert(name, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use http_body_util::BodyExt;
    use tempfile::tempdir;

    fn sample(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn media_without_range_gets_preview_window() {
        let plan = plan_stream(10 * 1024 * 1024, None, true).expect("plan");
        assert_eq!(plan.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            plan.range,
            Some(ByteRange {
                start: 0,
                end: MEDIA_PREVIEW_WINDOW - 1
            })
        );

        let small = plan_stream(5000, None, true).expect("plan");
        assert_eq!(small.range, Some(ByteRange { start: 0, end: 4999 }));
        assert_eq!(small.status, StatusCode::PARTIAL_CONTENT);
    }

    #[test]
    fn non_media_without_range_is_full_ok() {
        let plan = plan_stream(5000, None, false).expect("plan");
        assert_eq!(plan.status, StatusCode::OK);
        assert_eq!(plan.content_length(), 5000);
    }

    #[test]
    fn malformed_range_falls_back_to_no_range_behaviour() {
        let plan = plan_stream(5000, Some("bytes=oops"), false).expect("plan");
        assert_eq!(plan.status, StatusCode::OK);
        let plan = plan_stream(5000, Some("bytes=oops"), true).expect("plan");
        assert_eq!(plan.status, StatusCode::PARTIAL_CONTENT);
    }

    #[test]
    fn empty_file_and_unsatisfiable_range() {
        let plan = plan_stream(0, None, true).expect("plan");
        assert_eq!(plan.status, StatusCode::OK);
        assert_eq!(plan.range, None);
        assert!(matches!(
            plan_stream(10, Some("bytes=10-"), false),
            Err(ApiError::RangeNotSatisfiable(10))
        ));
    }

    #[tokio::test]
    async fn range_stream_yields_exact_slice_in_bounded_chunks() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("big.bin");
        let data = sample(2 * STREAM_CHUNK_SIZE + 777);
        std::fs::write(&path, &data).expect("write");

        let range = ByteRange {
            start: 100,
            end: (STREAM_CHUNK_SIZE + 5000) as u64,
        };
        let file = File::open(&path).await.expect("open");
        let mut stream = range_stream(file, range).await.expect("seek");
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.expect("chunk");
            assert!(chunk.len() <= STREAM_CHUNK_SIZE);
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected.len() as u64, range.len());
        assert_eq!(&collected[..], &data[100..=STREAM_CHUNK_SIZE + 5000]);
    }

    #[tokio::test]
    async fn streamer_serves_requested_range() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("movie.mp4");
        let data = sample(5000);
        std::fs::write(&path, &data).expect("write");

        let streamer = RangeStreamer::new(Arc::new(MetadataCache::new(4)));
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=1000-1999"));
        let response = streamer.stream(&path, &headers, true).await.expect("stream");

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers()[header::CONTENT_RANGE],
            "bytes 1000-1999/5000"
        );
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "1000");
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&body[..], &data[1000..2000]);
    }

    #[tokio::test]
    async fn streamer_replans_when_cached_size_is_stale() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("notes.txt");
        std::fs::write(&path, b"short").expect("write");

        let cache = Arc::new(MetadataCache::new(4));
        let streamer = RangeStreamer::new(cache.clone());
        cache.get(&path).await.expect("prime");
        std::fs::write(&path, b"much longer body").expect("rewrite");

        let response = streamer
            .stream(&path, &HeaderMap::new(), false)
            .await
            .expect("stream");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&body[..], b"much longer body");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let temp = tempdir().expect("tempdir");
        let streamer = RangeStreamer::new(Arc::new(MetadataCache::new(4)));
        let result = streamer
            .stream(&temp.path().join("gone.mp4"), &HeaderMap::new(), true)
            .await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }
}
