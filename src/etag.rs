//! ETag 计算与 If-None-Match 校验。

use axum::http::{HeaderMap, header};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// 由绝对路径与修改时间派生强 ETag。
pub fn view_etag(absolute: &Path, modified: Option<SystemTime>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(absolute.to_string_lossy().as_bytes());
    hasher.update(b"|");
    if let Some(duration) = modified.and_then(|ts| ts.duration_since(UNIX_EPOCH).ok()) {
        hasher.update(format!("{}.{:09}", duration.as_secs(), duration.subsec_nanos()).as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("\"{}\"", &digest[..32])
}

/// `If-None-Match` 是否命中当前 ETag（弱比较）。
pub fn if_none_match(headers: &HeaderMap, current: &str) -> bool {
    let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    if value.trim() == "*" {
        return true;
    }
    let current = strip_weak(current);
    value
        .split(',')
        .map(|item| strip_weak(item.trim()))
        .any(|item| item == current)
}

fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}
