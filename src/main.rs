//! Cumulus Drive server binary.
//!
//! A personal file server: range-aware media streaming, chunked uploads
//! merged atomically into the storage tree, expiring direct download links
//! and hard-link based mapping of local files. `main` wires the services
//! together, builds the Axum router and serves it until a shutdown signal.

mod atomic;
mod auth;
mod background;
mod chunks;
mod config;
mod error;
mod etag;
mod executor;
mod files;
mod http;
mod links;
mod locking;
mod logging;
mod mapping;
mod media;
mod metadata;
mod range;
mod storage;
mod stream;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::auth::AuthConfig;
use crate::background::{BackgroundConfig, spawn_background_tasks};
use crate::chunks::ChunkAssembler;
use crate::config::{Args, MERGE_LOCK_WAIT_TIMEOUT_SECS};
use crate::executor::BlockingExecutor;
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::links::DirectLinkRegistry;
use crate::mapping::MappingSources;
use crate::metadata::MetadataCache;
use crate::storage::Storage;
use crate::stream::RangeStreamer;
use crate::upload::UploadConfig;

shadow!(build);

/// Multipart framing allowance on top of the raw chunk size.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Shared services handed to every handler through `Extension` layers.
#[derive(Clone)]
struct AppState {
    storage: Arc<Storage>,
    metadata: Arc<MetadataCache>,
    streamer: Arc<RangeStreamer>,
    executor: BlockingExecutor,
    assembler: Arc<ChunkAssembler>,
    links: Arc<DirectLinkRegistry>,
    mapping: Arc<MappingSources>,
    auth: Arc<AuthConfig>,
    upload: Arc<UploadConfig>,
}

impl AppState {
    fn from_args(args: &Args) -> Self {
        let executor = BlockingExecutor::new(args.io_workers);
        let metadata = Arc::new(MetadataCache::new(args.metadata_cache_size));
        Self {
            storage: Arc::new(Storage::new(PathBuf::from(&args.storage_dir))),
            streamer: Arc::new(RangeStreamer::new(metadata.clone())),
            metadata,
            assembler: Arc::new(ChunkAssembler::new(
                PathBuf::from(&args.staging_dir),
                executor.clone(),
                Duration::from_secs(MERGE_LOCK_WAIT_TIMEOUT_SECS),
            )),
            executor,
            links: Arc::new(DirectLinkRegistry::new()),
            mapping: Arc::new(MappingSources::load(PathBuf::from(&args.mapping_config))),
            auth: Arc::new(AuthConfig::new(
                args.auth_user.clone(),
                args.auth_pass.clone(),
                Duration::from_secs(args.session_ttl_secs),
            )),
            upload: Arc::new(UploadConfig {
                max_chunk_size: args.max_chunk_size,
            }),
        }
    }
}

fn build_router(state: &AppState) -> Router {
    let chunk_limit = usize::try_from(state.upload.max_chunk_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/stream/{*path}", get(files::stream_file))
        .route("/view/{*path}", get(files::view_file))
        .route("/download/{*path}", get(files::download_file))
        .route("/api/direct-link/{*path}", get(links::create_direct_link))
        .route("/dl/{token}", get(links::download_direct_link))
        .route("/api/files", get(files::list_files))
        .route("/api/folders", post(files::create_folder))
        .route("/api/folders/{*path}", delete(files::delete_folder))
        .route("/delete/{*path}", delete(files::delete_file))
        .route(
            "/upload",
            post(upload::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/api/upload/chunk",
            post(upload::upload_chunk).layer(DefaultBodyLimit::max(chunk_limit)),
        )
        .route("/api/upload/complete", post(upload::complete_upload))
        .route("/api/upload/abort", post(upload::abort_upload))
        .route(
            "/api/mapping-sources",
            get(mapping::get_mapping_sources).post(mapping::update_mapping_sources),
        )
        .route(
            "/api/system-default-paths",
            get(mapping::get_system_default_paths),
        )
        .route("/api/check-local-file", post(mapping::check_local_file))
        .route("/api/map-local-file", post(mapping::map_local_file))
        .route("/api/map-all-contents", post(mapping::map_all_contents))
        .route("/api/auth/login", post(auth::auth_login))
        .route("/api/auth/logout", post(auth::auth_logout))
        .route("/api/auth/status", get(auth::auth_status))
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(state.storage.clone()))
        .layer(Extension(state.metadata.clone()))
        .layer(Extension(state.streamer.clone()))
        .layer(Extension(state.executor.clone()))
        .layer(Extension(state.assembler.clone()))
        .layer(Extension(state.links.clone()))
        .layer(Extension(state.mapping.clone()))
        .layer(Extension(state.auth.clone()))
        .layer(Extension(state.upload.clone()))
}

/// Starts the Cumulus Drive server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let state = AppState::from_args(&args);
    state.storage.ensure_root().await?;
    state.assembler.ensure_root().await?;
    info!(
        storage = ?state.storage.root_path(),
        staging = ?state.assembler.staging_root(),
        io_workers = state.executor.workers(),
        "storage ready"
    );

    let mut app = build_router(&state);
    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    spawn_background_tasks(
        state.auth.clone(),
        state.links.clone(),
        state.assembler.clone(),
        BackgroundConfig {
            link_sweep_interval: Duration::from_secs(args.link_sweep_interval_secs),
            staging_ttl: Duration::from_secs(args.staging_ttl_secs),
        },
    );

    tokio::spawn(shutdown_signal(handle.clone()));

    info!("🚀 Starting HTTP server at {}", addr);
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    state.executor.shutdown();
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use axum::http::{StatusCode, header};
    use axum::response::Response;
    use http_body_util::BodyExt;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    const BOUNDARY: &str = "router-test-boundary";

    fn make_state() -> (TempDir, AppState) {
        let temp = tempdir().expect("tempdir");
        let base = temp.path().to_string_lossy().to_string();
        let args = Args::parse_from([
            "cumulus-drive",
            "--storage-dir",
            &format!("{base}/storage"),
            "--staging-dir",
            &format!("{base}/chunks"),
            "--mapping-config",
            &format!("{base}/config/mapping_sources.json"),
            "--auth-user",
            "admin",
            "--auth-pass",
            "secret",
        ]);
        let state = AppState::from_args(&args);
        std::fs::create_dir_all(state.storage.root_path()).expect("storage root");
        (temp, state)
    }

    async fn send(state: &AppState, request: Request<AxumBody>) -> Response {
        build_router(state)
            .oneshot(request)
            .await
            .unwrap_or_else(|err| match err {})
    }

    async fn login(state: &AppState) -> String {
        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from(r#"{"username":"admin","password":"secret"}"#))
            .expect("request");
        let response = send(state, request).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let set_cookie = response.headers()[header::SET_COOKIE]
            .to_str()
            .expect("cookie header");
        set_cookie
            .split(';')
            .next()
            .expect("cookie pair")
            .to_string()
    }

    fn chunk_request(cookie: &str, index: usize, data: &[u8]) -> Request<AxumBody> {
        let mut body = Vec::new();
        for (name, value) in [
            ("directory", "videos".to_string()),
            ("fileName", "movie.mp4".to_string()),
            ("chunkIndex", index.to_string()),
            ("totalChunks", "3".to_string()),
            ("fileSize", (10 * 1024 * 1024).to_string()),
            ("chunkSize", (4 * 1024 * 1024).to_string()),
        ] {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/upload/chunk")
            .header(header::COOKIE, cookie)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(AxumBody::from(body))
            .expect("request")
    }

    #[tokio::test]
    async fn stream_route_serves_requested_range() {
        let (_temp, state) = make_state();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(state.storage.root_path().join("movie.mp4"), &data).expect("write");

        let request = Request::builder()
            .uri("/stream/movie.mp4")
            .header(header::RANGE, "bytes=1000-1999")
            .body(AxumBody::empty())
            .expect("request");
        let response = send(&state, request).await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers()[header::CONTENT_RANGE],
            "bytes 1000-1999/5000"
        );
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "1000");
        assert_eq!(response.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&body[..], &data[1000..2000]);
    }

    #[tokio::test]
    async fn view_etag_follows_external_modification() {
        let (_temp, state) = make_state();
        let path = state.storage.root_path().join("notes.txt");
        std::fs::write(&path, b"first draft").expect("write");

        let view = |etag: Option<&str>| {
            let mut builder = Request::builder().uri("/view/notes.txt");
            if let Some(etag) = etag {
                builder = builder.header(header::IF_NONE_MATCH, etag);
            }
            builder.body(AxumBody::empty()).expect("request")
        };

        let response = send(&state, view(None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let etag = response.headers()[header::ETAG]
            .to_str()
            .expect("etag")
            .to_string();
        let response = send(&state, view(Some(&etag))).await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        let modified = std::fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .expect("mtime");
        std::fs::write(&path, b"second draft, longer").expect("rewrite");
        std::fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(modified + Duration::from_secs(3600)))
            .expect("set mtime");

        let response = send(&state, view(Some(&etag))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_ne!(response.headers()[header::ETAG], etag.as_str());
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&body[..], b"second draft, longer");
    }

    #[tokio::test]
    async fn traversal_and_unauthenticated_writes_are_rejected() {
        let (_temp, state) = make_state();

        let request = Request::builder()
            .uri("/stream/..%2F..%2Fetc%2Fpasswd")
            .body(AxumBody::empty())
            .expect("request");
        let response = send(&state, request).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["kind"], "forbidden");

        let request = Request::builder()
            .method("DELETE")
            .uri("/delete/anything.txt")
            .body(AxumBody::empty())
            .expect("request");
        assert_eq!(send(&state, request).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn chunked_upload_then_direct_link_download() {
        let (temp, state) = make_state();
        let cookie = login(&state).await;

        const MIB: usize = 1024 * 1024;
        let parts = [vec![1u8; 4 * MIB], vec![2u8; 4 * MIB], vec![3u8; 2 * MIB]];
        let mut file_id = String::new();
        for index in [1usize, 0, 2] {
            let response = send(&state, chunk_request(&cookie, index, &parts[index])).await;
            assert_eq!(response.status(), StatusCode::OK);
            let body = response.into_body().collect().await.expect("body").to_bytes();
            let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
            file_id = json["file_id"].as_str().expect("file_id").to_string();
        }

        let request = Request::builder()
            .method("POST")
            .uri("/api/upload/complete")
            .header(header::COOKIE, &cookie)
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from(format!(
                r#"{{"fileName":"movie.mp4","directory":"videos","totalChunks":3,"fileSize":{}}}"#,
                10 * MIB
            )))
            .expect("request");
        let response = send(&state, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["file"]["path"], "videos/movie.mp4");
        assert_eq!(json["file"]["size"], 10 * MIB);
        assert_eq!(json["file"]["is_video"], true);

        let merged = state.storage.root_path().join("videos").join("movie.mp4");
        assert_eq!(std::fs::metadata(&merged).expect("merged").len(), (10 * MIB) as u64);
        assert!(!temp.path().join("chunks").join(&file_id).exists());

        let request = Request::builder()
            .uri("/api/direct-link/videos/movie.mp4?expires_in=60")
            .header(header::HOST, "drive.test")
            .body(AxumBody::empty())
            .expect("request");
        let response = send(&state, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        let direct_link = json["direct_link"].as_str().expect("link").to_string();
        assert_eq!(json["full_link"], format!("http://drive.test{direct_link}"));

        let request = Request::builder()
            .uri(&direct_link)
            .body(AxumBody::empty())
            .expect("request");
        let response = send(&state, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_LENGTH],
            (10 * MIB).to_string()
        );

        let request = Request::builder()
            .uri("/dl/not-a-token")
            .body(AxumBody::empty())
            .expect("request");
        assert_eq!(send(&state, request).await.status(), StatusCode::NOT_FOUND);
    }
}
