//! 带有效期的直链下载。
//!
//! Tokens live only in memory. A token is checked lazily on every resolve
//! and the background sweep removes whatever nobody asked for. Both paths go
//! through the same mutex, so an entry is removed at most once.

use axum::extract::{Extension, Path, Query};
use axum::http::HeaderMap;
use axum::response::{Json as JsonResponse, Response};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{DEFAULT_DIRECT_LINK_TTL_SECS, MAX_DIRECT_LINK_TTL_SECS};
use crate::error::ApiError;
use crate::http::request_base_url;
use crate::metadata::MetadataCache;
use crate::storage::Storage;
use crate::stream::attachment_response;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("link not found")]
    NotFound,
    #[error("link expired")]
    Expired,
}

#[derive(Clone, Debug)]
pub struct DirectLink {
    pub path: String,
    pub expires_at: Instant,
    pub expires_at_utc: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct DirectLinkRegistry {
    links: Mutex<HashMap<String, DirectLink>>,
}

impl DirectLinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 签发新令牌；同一路径可同时存在多个有效令牌。
    pub fn issue(&self, path: &str, ttl: Duration) -> Option<(String, DirectLink)> {
        let expires_at = Instant::now().checked_add(ttl)?;
        let expires_at_utc = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta))?;
        let token = Uuid::new_v4().to_string();
        let link = DirectLink {
            path: path.to_string(),
            expires_at,
            expires_at_utc,
        };
        self.lock().insert(token.clone(), link.clone());
        Some((token, link))
    }

    /// Returns the target path. An expired entry is evicted on the way out.
    pub fn resolve(&self, token: &str) -> Result<String, LinkError> {
        let mut links = self.lock();
        let link = links.get(token).ok_or(LinkError::NotFound)?;
        if Instant::now() > link.expires_at {
            links.remove(token);
            debug!(token, "direct link expired");
            return Err(LinkError::Expired);
        }
        Ok(link.path.clone())
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.lock().remove(token).is_some()
    }

    /// 清理所有已过期的令牌，返回清理数量。
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut links = self.lock();
        let before = links.len();
        links.retain(|_, link| link.expires_at >= now);
        before - links.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DirectLink>> {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Deserialize)]
pub(crate) struct DirectLinkQuery {
    expires_in: Option<u64>,
}

#[derive(Serialize)]
pub(crate) struct DirectLinkResponse {
    direct_link: String,
    full_link: String,
    expires_at: String,
}

/// 为文件生成直链。
pub async fn create_direct_link(
    Path(path): Path<String>,
    Query(query): Query<DirectLinkQuery>,
    headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(metadata): Extension<Arc<MetadataCache>>,
    Extension(links): Extension<Arc<DirectLinkRegistry>>,
) -> Result<JsonResponse<DirectLinkResponse>, ApiError> {
    let ttl_secs = query.expires_in.unwrap_or(DEFAULT_DIRECT_LINK_TTL_SECS);
    if ttl_secs == 0 || ttl_secs > MAX_DIRECT_LINK_TTL_SECS {
        return Err(ApiError::BadRequest(format!(
            "expires_in must be between 1 and {MAX_DIRECT_LINK_TTL_SECS} seconds"
        )));
    }

    let target = storage.resolve_path_checked(&path, false).await?;
    if metadata.get(&target).await?.is_none() {
        return Err(ApiError::NotFound("file not found".into()));
    }

    let (token, link) = links
        .issue(&path, Duration::from_secs(ttl_secs))
        .ok_or_else(|| ApiError::BadRequest("expires_in out of range".into()))?;
    info!(path, ttl_secs, "direct link issued");

    let direct_link = format!("/dl/{token}");
    Ok(JsonResponse(DirectLinkResponse {
        full_link: format!("{}{direct_link}", request_base_url(&headers)),
        direct_link,
        expires_at: link
            .expires_at_utc
            .to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

/// 通过直链下载文件（404 未知令牌，410 已过期）。
pub async fn download_direct_link(
    Path(token): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(metadata): Extension<Arc<MetadataCache>>,
    Extension(links): Extension<Arc<DirectLinkRegistry>>,
) -> Result<Response, ApiError> {
    let path = links.resolve(&token)?;

    let entry = match storage.resolve_path_checked(&path, false).await {
        Ok(target) => metadata.get(&target).await?.map(|entry| (target, entry)),
        Err(_) => None,
    };
    let Some((target, entry)) = entry else {
        links.revoke(&token);
        debug!(token, path, "direct link target vanished");
        return Err(ApiError::NotFound("file not found".into()));
    };

    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    attachment_response(&target, &entry, &file_name).await
}
