//! 基于扩展名的媒体类型分类与 Content-Type 推断。

use serde::Serialize;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Image,
    Document,
    Other,
}

impl MediaKind {
    /// 根据文件扩展名（不区分大小写）分类。
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let Some(extension) = lowercase_extension(path.as_ref()) else {
            return MediaKind::Other;
        };
        match extension.as_str() {
            "mp4" | "webm" | "ogv" | "mkv" | "avi" | "mov" | "m4v" | "ts" | "3gp" | "flv" => {
                MediaKind::Video
            }
            "mp3" | "wav" | "ogg" | "flac" | "aac" | "m4a" => MediaKind::Audio,
            "jpg" | "jpeg" | "png" | "gif" | "webp" => MediaKind::Image,
            "pdf" | "doc" | "docx" | "txt" | "md" => MediaKind::Document,
            _ => MediaKind::Other,
        }
    }

    /// Video and audio are served with a partial first response.
    pub fn is_streamable(self) -> bool {
        matches!(self, MediaKind::Video | MediaKind::Audio)
    }
}

/// 推断 Content-Type，`mime_guess` 不认识的媒体格式走内置表。
pub fn content_type(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    if let Some(mime) = mime_guess::from_path(path).first() {
        return mime.essence_str().to_string();
    }
    let fallback = match lowercase_extension(path).as_deref() {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("ogv") => "video/ogg",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("mov") => "video/quicktime",
        Some("m4v") => "video/x-m4v",
        Some("3gp") => "video/3gpp",
        Some("ts") => "video/mp2t",
        Some("flv") => "video/x-flv",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("flac") => "audio/flac",
        Some("aac") => "audio/aac",
        Some("m4a") => "audio/mp4",
        _ => "application/octet-stream",
    };
    fallback.to_string()
}

fn lowercase_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}
