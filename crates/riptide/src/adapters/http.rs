use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{
        header::{CONTENT_TYPE, COOKIE, SET_COOKIE},
        HeaderMap, HeaderValue, Method, StatusCode, Uri,
    },
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tracing::{debug, error};

use crate::{
    context::PageError,
    dispatch::Bridge,
    ids::{PageId, SessionId},
    inject::{BOOTSTRAP_FILE, BOOTSTRAP_SCRIPT, BRIDGE_PATH},
    protocol::Reply,
};

/// Cookie carrying the session id between navigations.
pub const SESSION_COOKIE: &str = "UID";

#[derive(Debug, Clone, Copy)]
pub struct HttpOptions {
    /// Without cookies every browser shares one session.
    pub cookies: bool,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self { cookies: true }
    }
}

#[derive(Clone)]
struct RouterState {
    bridge: Bridge,
    options: HttpOptions,
}

/// Routes for the bridge endpoint, the bootstrap file, `/` and app pages.
/// Anything not matched falls through to the app's page handlers.
pub fn router(bridge: Bridge, options: HttpOptions) -> Router {
    Router::new()
        .route(BRIDGE_PATH, post(process))
        .route(&format!("/{BOOTSTRAP_FILE}"), get(bootstrap))
        .route("/", get(home))
        .fallback(page)
        .with_state(RouterState { bridge, options })
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Reply::Text(text) => text.into_response(),
            Reply::Json(value) => Json(value).into_response(),
            Reply::Stop => StatusCode::NO_CONTENT.into_response(),
        }
    }
}

impl IntoResponse for PageError {
    fn into_response(self) -> Response {
        match &self {
            PageError::NotFound(path) => {
                debug!(path = %path, "no page handler");
                (StatusCode::NOT_FOUND, format!("no page at {path}")).into_response()
            }
            PageError::Io { .. } => {
                error!(error = %self, "failed to load page");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

async fn process(State(state): State<RouterState>, body: Bytes) -> Reply {
    state.bridge.dispatch_json(&body).await
}

async fn bootstrap() -> impl IntoResponse {
    ([(CONTENT_TYPE, "application/javascript")], BOOTSTRAP_SCRIPT)
}

async fn home(
    State(state): State<RouterState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let session = state.session_for(&headers, &query);
    let ctx = state.bridge.session(session.as_ref());
    match ctx.show_home().await {
        Ok(html) => state.with_cookie(Html(html), ctx.id()),
        Err(err) => err.into_response(),
    }
}

async fn page(
    State(state): State<RouterState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let session = state.session_for(&headers, &query);
    let ctx = state.bridge.session(session.as_ref());
    match ctx.show_page(uri.path(), query).await {
        Ok(html) => state.with_cookie(Html(html), ctx.id()),
        Err(err) => err.into_response(),
    }
}

impl RouterState {
    /// `?session=<page id>` wins, then the cookie. A cookie-less browser gets a
    /// fresh session unless cookies are disabled, in which case all share one.
    fn session_for(
        &self,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
    ) -> Option<SessionId> {
        if let Some(owner) = query
            .get("session")
            .and_then(|page| self.bridge.session_for_page(&PageId::from(page.as_str())))
        {
            return Some(owner);
        }
        if !self.options.cookies {
            return None;
        }
        Some(session_cookie(headers).unwrap_or_else(SessionId::generate))
    }

    fn with_cookie(&self, body: impl IntoResponse, session: &SessionId) -> Response {
        let mut response = body.into_response();
        if self.options.cookies {
            let cookie = format!("{SESSION_COOKIE}={session}; Path=/");
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().insert(SET_COOKIE, value);
            }
        }
        response
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<SessionId> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .filter(|(name, _)| *name == SESSION_COOKIE)
        .find_map(|(_, value)| SessionId::parse(value))
}
