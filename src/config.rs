//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const STREAM_CHUNK_SIZE: usize = 512 * 1024;
pub const MEDIA_PREVIEW_WINDOW: u64 = 2 * 1024 * 1024;
pub const DEFAULT_DIRECT_LINK_TTL_SECS: u64 = 24 * 60 * 60;
pub const MAX_DIRECT_LINK_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;
pub const DEFAULT_LINK_SWEEP_INTERVAL_SECS: u64 = 60 * 60;
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_STAGING_TTL_SECS: u64 = 24 * 60 * 60;
pub const STAGING_SWEEP_INTERVAL_SECS: u64 = 900;
pub const DEFAULT_IO_WORKERS: usize = 8;
pub const DEFAULT_METADATA_CACHE_SIZE: usize = 32;
pub const MERGE_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_AUTH_USER: &str = "cumulus";
pub const DEFAULT_AUTH_PASS: &str = "cumulus";
pub const AUTH_COOKIE_NAME: &str = "CUMULUS_SESSION";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const SESSION_PRUNE_INTERVAL_SECS: u64 = 300;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "cumulus-drive", version = VERSION_INFO, about = "Cumulus personal file server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "CUMULUS_STORAGE_DIR",
        default_value = ".cumulus/storage",
        help = "Storage directory exposed over HTTP"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "CUMULUS_STAGING_DIR",
        default_value = ".cumulus/chunks",
        help = "Staging directory for chunked uploads"
    )]
    pub staging_dir: String,
    #[arg(
        long,
        env = "CUMULUS_MAPPING_CONFIG",
        default_value = ".cumulus/config/mapping_sources.json",
        help = "JSON file holding local mapping source directories"
    )]
    pub mapping_config: String,
    #[arg(
        short = 'b',
        long = "bind",
        env = "CUMULUS_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "CUMULUS_PORT",
        default_value_t = 5888,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "CUMULUS_AUTH_USER",
        default_value = DEFAULT_AUTH_USER,
        help = "Login username"
    )]
    pub auth_user: String,
    #[arg(
        long,
        env = "CUMULUS_AUTH_PASS",
        default_value = DEFAULT_AUTH_PASS,
        help = "Login password"
    )]
    pub auth_pass: String,
    #[arg(
        long,
        env = "CUMULUS_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Session expiration in seconds"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "CUMULUS_IO_WORKERS",
        default_value_t = DEFAULT_IO_WORKERS,
        help = "Concurrent blocking filesystem operations"
    )]
    pub io_workers: usize,
    #[arg(
        long,
        env = "CUMULUS_METADATA_CACHE_SIZE",
        default_value_t = DEFAULT_METADATA_CACHE_SIZE,
        help = "Number of file metadata entries kept in memory"
    )]
    pub metadata_cache_size: usize,
    #[arg(
        long,
        env = "CUMULUS_MAX_CHUNK_SIZE",
        default_value_t = DEFAULT_MAX_CHUNK_SIZE,
        help = "Max size of a single upload chunk in bytes"
    )]
    pub max_chunk_size: u64,
    #[arg(
        long,
        env = "CUMULUS_STAGING_TTL_SECS",
        default_value_t = DEFAULT_STAGING_TTL_SECS,
        help = "Abandoned upload cleanup threshold in seconds (0 to disable)"
    )]
    pub staging_ttl_secs: u64,
    #[arg(
        long,
        env = "CUMULUS_LINK_SWEEP_INTERVAL_SECS",
        default_value_t = DEFAULT_LINK_SWEEP_INTERVAL_SECS,
        help = "Interval between expired direct link sweeps"
    )]
    pub link_sweep_interval_secs: u64,
    #[arg(long, env = "CUMULUS_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
}
