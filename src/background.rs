//! 后台任务：会话清理、直链清理与过期上传暂存清理。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::{AuthConfig, prune_expired_sessions};
use crate::chunks::ChunkAssembler;
use crate::config::{SESSION_PRUNE_INTERVAL_SECS, STAGING_SWEEP_INTERVAL_SECS};
use crate::links::DirectLinkRegistry;

pub struct BackgroundConfig {
    pub link_sweep_interval: Duration,
    /// Zero disables the staging sweep.
    pub staging_ttl: Duration,
}

/// 启动后台任务。
pub fn spawn_background_tasks(
    auth: Arc<AuthConfig>,
    links: Arc<DirectLinkRegistry>,
    assembler: Arc<ChunkAssembler>,
    config: BackgroundConfig,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SESSION_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let removed = prune_expired_sessions(&auth).await;
            if removed > 0 {
                debug!(removed, "expired sessions pruned");
            }
        }
    });

    let link_interval = config.link_sweep_interval.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(link_interval);
        loop {
            interval.tick().await;
            let removed = links.sweep();
            if removed > 0 {
                info!(removed, remaining = links.len(), "expired direct links swept");
            }
        }
    });

    if config.staging_ttl.is_zero() {
        info!("upload staging sweep disabled");
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(STAGING_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match assembler.sweep_stale(config.staging_ttl).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "stale upload staging swept"),
                Err(err) => warn!(error = %err, "upload staging sweep failed"),
            }
        }
    });
}
