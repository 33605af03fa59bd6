//! Server-side route guard driven by the persisted session cookie.
//!
//! The cookie carries the same JSON record as the keyed store. Protected paths
//! without an authenticated record redirect to the login page; an
//! authenticated visitor on the login page is sent to the dashboard.

use crate::session::{persist::decode_cookie_value, Session};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    Router,
};
use std::{path::Path, sync::Arc};
use tower::ServiceBuilder;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, debug_span, Span};

#[derive(Clone, Debug)]
pub struct GatekeeperConfig {
    pub cookie_name: String,
    pub login_path: String,
    pub dashboard_path: String,
    /// Paths served without a session, matched exactly or as a `/`-prefix.
    pub public_paths: Vec<String>,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            cookie_name: crate::config::DEFAULT_STORAGE_KEY.to_string(),
            login_path: "/login".to_string(),
            dashboard_path: "/dashboard".to_string(),
            public_paths: vec!["/static".to_string(), "/health".to_string()],
        }
    }
}

impl GatekeeperConfig {
    fn is_public(&self, path: &str) -> bool {
        self.public_paths.iter().any(|public| {
            path == public
                || path
                    .strip_prefix(public.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// Extract a cookie value from the Cookie header.
#[must_use]
pub fn get_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in cookie_header.split(';') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            if key.trim() == name {
                return Some(value.trim());
            }
        }
    }
    None
}

/// True if the request carries a cookie with an authenticated session record.
#[must_use]
pub fn is_authenticated(headers: &HeaderMap, cookie_name: &str) -> bool {
    get_cookie(headers, cookie_name)
        .map(decode_cookie_value)
        .and_then(|raw| serde_json::from_str::<Session>(&raw).ok())
        .is_some_and(|session| session.is_authenticated)
}

// files like /favicon.ico or /app.js
fn is_asset(path: &str) -> bool {
    path.rsplit('/').next().is_some_and(|segment| segment.contains('.'))
}

pub async fn gatekeeper(
    State(config): State<Arc<GatekeeperConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();

    if path == config.login_path {
        if is_authenticated(request.headers(), &config.cookie_name) {
            debug!("authenticated visitor on login page");
            return Redirect::to(&config.dashboard_path).into_response();
        }
        return next.run(request).await;
    }

    if is_asset(&path) || config.is_public(&path) {
        return next.run(request).await;
    }

    if !is_authenticated(request.headers(), &config.cookie_name) {
        debug!(path = %path, "no session, redirecting to login");
        return Redirect::to(&config.login_path).into_response();
    }

    next.run(request).await
}

/// Wraps `router` with the gatekeeper.
pub fn layer<S>(router: Router<S>, config: GatekeeperConfig) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(Arc::new(config), gatekeeper))
}

/// Static file server for `root` behind the gatekeeper.
pub fn router(root: &Path, config: GatekeeperConfig) -> Router {
    let app = Router::new().fallback_service(ServeDir::new(root));

    layer(app, config).layer(
        ServiceBuilder::new().layer(TraceLayer::new_for_http().make_span_with(make_span)),
    )
}

fn make_span(request: &Request<Body>) -> Span {
    let path = request.uri().path();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    debug_span!("http-request", path, request_id)
}
