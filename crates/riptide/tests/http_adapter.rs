mod common;

use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{header, Request, StatusCode},
    Router,
};
use common::{page_id_in, test_config};
use riptide::{
    adapters::http::{router, HttpOptions},
    factory, App, Bridge, CallError, Home, Js, PageHandle, PageRequest, SessionId,
};
use serde_json::{json, Value};
use tower::util::ServiceExt;

struct Site;

#[async_trait]
impl App for Site {
    fn home(&self) -> Home {
        Home::Html("<html><head><title>t</title></head><body>home</body></html>".into())
    }

    fn has_page(&self, name: &str) -> bool {
        matches!(name, "reports_daily" | "silent" | "slow")
    }

    async fn page(
        &self,
        _js: &Js,
        request: PageRequest,
        mut page: PageHandle,
    ) -> Result<(), CallError> {
        match request.name.as_str() {
            "silent" => return Ok(()),
            "slow" => {
                let delay = request
                    .query
                    .get("delay")
                    .and_then(|ms| ms.parse().ok())
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let tab = request.query.get("tab").cloned().unwrap_or_default();
                page.send_html(&format!("<body>tab {tab}</body>"))?;
                return Ok(());
            }
            _ => {}
        }
        let day = request.query.get("day").cloned().unwrap_or_default();
        page.send_html(&format!("<body>report {day}</body>"))?;
        Ok(())
    }
}

fn app(cookies: bool) -> (Bridge, Router) {
    let bridge = Bridge::new(factory(|| Site), test_config());
    let router = router(bridge.clone(), HttpOptions { cookies });
    (bridge, router)
}

async fn get(
    router: &Router,
    uri: &str,
    cookie: Option<&str>,
) -> (StatusCode, Option<String>, String) {
    let mut request = Request::builder().method("GET").uri(uri);
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }
    let response = router
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .map(|value| value.to_str().unwrap().to_string());
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, set_cookie, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn post(router: &Router, payload: Value) -> (StatusCode, String) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/_process_srv0")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[test_timeout::timeout]
async fn home_injects_bootstrap_and_sets_cookie() {
    let (bridge, router) = app(true);
    let (status, cookie, html) = get(&router, "/", None).await;

    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("function evalBrowser()"));
    let page = page_id_in(&html);
    let owner = bridge.session_for_page(&page).unwrap();
    assert_eq!(cookie, Some(format!("UID={owner}; Path=/")));
}

#[test_timeout::timeout]
async fn cookie_selects_existing_session() {
    const UID: &str = "0123456789abcdef0123456789abcdef";
    let (bridge, router) = app(true);
    let (_, cookie, _) = get(&router, "/", Some(&format!("UID={UID}"))).await;

    assert_eq!(cookie, Some(format!("UID={UID}; Path=/")));
    assert!(bridge.registry().get(&SessionId::from(UID)).is_some());
    assert_eq!(bridge.registry().len(), 1);
}

#[test_timeout::timeout]
async fn malformed_cookie_gets_a_fresh_session() {
    let (bridge, router) = app(true);
    let (status, cookie, html) = get(&router, "/", Some("UID=x'+alert(1)+'")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(!html.contains("alert(1)"));
    let owner = bridge.session_for_page(&page_id_in(&html)).unwrap();
    assert_eq!(owner.as_str().len(), 32);
    assert_eq!(cookie, Some(format!("UID={owner}; Path=/")));
}

#[test_timeout::timeout]
async fn without_cookies_every_browser_shares_one_session() {
    let (bridge, router) = app(false);
    let (_, cookie, first) = get(&router, "/", None).await;
    let (_, _, second) = get(&router, "/", None).await;

    assert!(cookie.is_none());
    assert_eq!(bridge.registry().len(), 1);
    assert_eq!(
        bridge.session_for_page(&page_id_in(&first)),
        bridge.session_for_page(&page_id_in(&second))
    );
}

#[test_timeout::timeout]
async fn page_handler_serves_paths_and_query() {
    let (_, router) = app(true);
    let (status, _, html) = get(&router, "/reports/daily?day=mon", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("report mon"));
    assert!(html.contains("var PAGEID=\""));

    let (status, _, _) = get(&router, "/reports/weekly", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[test_timeout::timeout]
async fn handler_that_never_answers_is_not_found() {
    let (_, router) = app(true);
    let (status, _, _) = get(&router, "/silent", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, html) = get(&router, "/reports/daily", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("report "));
}

#[test_timeout::timeout]
async fn concurrent_navigations_in_one_session_get_their_own_html() {
    const COOKIE: &str = "UID=0123456789abcdef0123456789abcdef";
    let (bridge, router) = app(true);
    let ((status_a, _, tab_a), (status_b, _, tab_b)) = tokio::join!(
        get(&router, "/slow?tab=a&delay=150", Some(COOKIE)),
        get(&router, "/slow?tab=b&delay=10", Some(COOKIE)),
    );

    assert_eq!(status_a, StatusCode::OK);
    assert_eq!(status_b, StatusCode::OK);
    assert!(tab_a.contains("tab a"));
    assert!(tab_b.contains("tab b"));
    assert_eq!(bridge.registry().len(), 1);
}

#[test_timeout::timeout]
async fn bootstrap_file_is_served() {
    let (_, router) = app(true);
    let (status, _, script) = get(&router, "/appscript.js", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(script.contains("function sendFromBrowserToServer"));
}

#[test_timeout::timeout]
async fn poll_returns_queued_statement_as_text() {
    let (bridge, router) = app(false);
    let (_, _, html) = get(&router, "/", None).await;
    let page = page_id_in(&html);

    bridge
        .js()
        .statement("document.title='ready'")
        .send()
        .await
        .unwrap();

    let (status, body) = post(&router, json!({"session": page, "task": "next"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "document.title='ready'");
}

#[test_timeout::timeout]
async fn unknown_page_gets_invalid_session_payload() {
    let (_, router) = app(true);
    let (status, body) = post(
        &router,
        json!({"session": "nope", "task": "get", "expression": "x"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        serde_json::from_str::<Value>(&body).unwrap(),
        json!({"error": "InvalidSession: nope"})
    );

    let (status, body) = post(&router, json!({"session": "nope", "task": "next"})).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());
}
