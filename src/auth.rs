//! 会话 Cookie 认证：登录、登出、状态查询与访问控制中间件。

use axum::extract::{Extension, Json};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use axum::{body::Body as AxumBody, middleware};
use axum_extra::extract::{CookieJar, cookie::Cookie};
use cookie::SameSite;
use cookie::time::Duration as CookieDuration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AUTH_COOKIE_NAME;
use crate::error::ApiError;
use crate::http::is_https_request;

#[derive(Debug)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    pub sessions: Mutex<HashMap<String, SessionEntry>>,
    pub session_ttl: Duration,
}

#[derive(Debug)]
pub struct SessionEntry {
    pub expires_at: Instant,
}

impl AuthConfig {
    pub fn new(username: String, password: String, session_ttl: Duration) -> Self {
        Self {
            username,
            password,
            sessions: Mutex::new(HashMap::new()),
            session_ttl,
        }
    }
}

/// 认证中间件：需要会话的请求校验 Cookie。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if !requires_session(req.method(), req.uri().path()) {
        return Ok(next.run(req).await);
    }

    if let Some(cookie) = jar.get(AUTH_COOKIE_NAME)
        && is_session_valid(&auth, cookie.value()).await
    {
        return Ok(next.run(req).await);
    }

    Err(ApiError::Unauthorized)
}

/// Reads (streams, previews, downloads, direct links) stay public; writes,
/// listings and mapping configuration need a session.
fn requires_session(method: &Method, path: &str) -> bool {
    if path.starts_with("/api/auth/") || path == "/api/version" {
        return false;
    }
    if !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
        return true;
    }
    matches!(
        path,
        "/api/files" | "/api/mapping-sources" | "/api/system-default-paths"
    )
}

#[derive(Deserialize)]
pub(crate) struct AuthLoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
pub(crate) struct AuthStatusResponse {
    authenticated: bool,
}

/// 登录接口：创建会话并写入 Cookie。
pub async fn auth_login(
    Extension(auth): Extension<Arc<AuthConfig>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<AuthLoginRequest>,
) -> Result<(CookieJar, Response), ApiError> {
    if payload.username != auth.username || payload.password != auth.password {
        warn!(username = payload.username, "login rejected");
        return Err(ApiError::Unauthorized);
    }

    let token = Uuid::new_v4().to_string();
    let expires_at = Instant::now() + auth.session_ttl;
    auth.sessions
        .lock()
        .await
        .insert(token.clone(), SessionEntry { expires_at });
    info!(username = payload.username, "login");

    let cookie = Cookie::build((AUTH_COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .secure(is_https_request(&headers))
        .same_site(SameSite::Strict)
        .max_age(CookieDuration::seconds(
            i64::try_from(auth.session_ttl.as_secs()).unwrap_or(i64::MAX),
        ))
        .build();
    Ok((jar.add(cookie), StatusCode::NO_CONTENT.into_response()))
}

/// 登出接口：清理会话并删除 Cookie。
pub async fn auth_logout(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
) -> (CookieJar, StatusCode) {
    if let Some(cookie) = jar.get(AUTH_COOKIE_NAME) {
        auth.sessions.lock().await.remove(cookie.value());
    }

    (
        jar.remove(Cookie::build(AUTH_COOKIE_NAME).path("/").build()),
        StatusCode::NO_CONTENT,
    )
}

/// 查询当前登录状态。
pub async fn auth_status(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
) -> JsonResponse<AuthStatusResponse> {
    let authenticated = match jar.get(AUTH_COOKIE_NAME) {
        Some(cookie) => is_session_valid(&auth, cookie.value()).await,
        None => false,
    };
    JsonResponse(AuthStatusResponse { authenticated })
}

async fn is_session_valid(auth: &AuthConfig, token: &str) -> bool {
    let mut sessions = auth.sessions.lock().await;
    let now = Instant::now();
    match sessions.get(token) {
        Some(entry) if entry.expires_at > now => true,
        _ => {
            sessions.remove(token);
            false
        }
    }
}

/// 清理过期会话。
pub async fn prune_expired_sessions(auth: &AuthConfig) -> usize {
    let mut sessions = auth.sessions.lock().await;
    let now = Instant::now();
    let before = sessions.len();
    sessions.retain(|_, entry| entry.expires_at > now);
    before - sessions.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_auth(ttl: Duration) -> Arc<AuthConfig> {
        Arc::new(AuthConfig::new("admin".into(), "secret".into(), ttl))
    }

    fn login_request(password: &str) -> Json<AuthLoginRequest> {
        Json(AuthLoginRequest {
            username: "admin".into(),
            password: password.into(),
        })
    }

    #[test]
    fn reads_are_public_and_writes_are_gated() {
        assert!(!requires_session(&Method::GET, "/stream/a.mp4"));
        assert!(!requires_session(&Method::GET, "/view/a.png"));
        assert!(!requires_session(&Method::GET, "/dl/token"));
        assert!(!requires_session(&Method::GET, "/api/direct-link/a.mp4"));
        assert!(!requires_session(&Method::POST, "/api/auth/login"));
        assert!(!requires_session(&Method::GET, "/api/version"));
        assert!(requires_session(&Method::GET, "/api/files"));
        assert!(requires_session(&Method::GET, "/api/mapping-sources"));
        assert!(requires_session(&Method::GET, "/api/system-default-paths"));
        assert!(requires_session(&Method::POST, "/api/upload/chunk"));
        assert!(requires_session(&Method::DELETE, "/delete/a.txt"));
    }

    #[tokio::test]
    async fn login_status_logout_flow() {
        let auth = make_auth(Duration::from_secs(60));
        let rejected = auth_login(
            Extension(auth.clone()),
            HeaderMap::new(),
            CookieJar::new(),
            login_request("wrong"),
        )
        .await;
        assert!(matches!(rejected, Err(ApiError::Unauthorized)));

        let (jar, response) = auth_login(
            Extension(auth.clone()),
            HeaderMap::new(),
            CookieJar::new(),
            login_request("secret"),
        )
        .await
        .unwrap_or_else(|_| panic!("login failed"));
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let token = jar.get(AUTH_COOKIE_NAME).expect("cookie").value().to_string();

        let session = CookieJar::new().add(Cookie::new(AUTH_COOKIE_NAME, token));
        let JsonResponse(status) = auth_status(Extension(auth.clone()), session.clone()).await;
        assert!(status.authenticated);

        let (_, status_code) = auth_logout(Extension(auth.clone()), session.clone()).await;
        assert_eq!(status_code, StatusCode::NO_CONTENT);
        let JsonResponse(status) = auth_status(Extension(auth), session).await;
        assert!(!status.authenticated);
    }

    #[tokio::test]
    async fn expired_sessions_are_pruned() {
        let auth = make_auth(Duration::ZERO);
        auth_login(
            Extension(auth.clone()),
            HeaderMap::new(),
            CookieJar::new(),
            login_request("secret"),
        )
        .await
        .unwrap_or_else(|_| panic!("login failed"));
        assert_eq!(prune_expired_sessions(&auth).await, 1);
        assert!(auth.sessions.lock().await.is_empty());
    }
}
