//! `/api/version`：构建元数据。

use axum::response::Json as JsonResponse;
use serde::Serialize;

use crate::build;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    name: &'static str,
    version: &'static str,
    commit: &'static str,
    branch: &'static str,
    build_time: &'static str,
    rustc: String,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            name: build::PROJECT_NAME,
            version: build::PKG_VERSION,
            commit: build::SHORT_COMMIT,
            branch: build::BRANCH,
            build_time: build::BUILD_TIME,
            rustc: format!("{} ({})", build::RUST_VERSION, build::RUST_CHANNEL),
        }
    }
}

pub async fn get_version_info() -> JsonResponse<VersionInfo> {
    JsonResponse(VersionInfo::current())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_package_version() {
        let JsonResponse(info) = get_version_info().await;
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        let json = serde_json::to_value(&info).expect("json");
        assert!(json.get("buildTime").is_some());
        assert!(json.get("rustc").is_some());
    }
}
