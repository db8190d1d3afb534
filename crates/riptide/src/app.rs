use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::{chain::Js, context::PageHandle, error::BridgeError};

/// Failure of a backend function invoked on behalf of the browser.
/// Encoded to the browser as `<kind>: <message>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    pub kind: String,
    pub message: String,
}

impl CallError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn method_not_found(name: &str) -> Self {
        BridgeError::MethodNotFound(name.to_string()).into()
    }
}

impl From<BridgeError> for CallError {
    fn from(err: BridgeError) -> Self {
        Self::new(err.kind(), err.detail())
    }
}

impl From<anyhow::Error> for CallError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<BridgeError>() {
            Some(bridge) => bridge.clone().into(),
            None => Self::new("Error", format!("{err:#}")),
        }
    }
}

/// Answer to a browser-side property read.
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    Value(Value),
    /// A backend method; the browser receives a function it can call later.
    Method,
}

/// What to serve for `/`.
#[derive(Debug, Clone, PartialEq)]
pub enum Home {
    Html(String),
    File(PathBuf),
    /// Delegate to the page handler named `index`.
    Page,
}

/// A navigation routed to an app page handler.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    /// Handler name derived from the path (`/pg1/a.b` becomes `pg1_a_b`).
    pub name: String,
    pub path: String,
    pub query: HashMap<String, String>,
}

impl PageRequest {
    pub fn new(path: &str, query: HashMap<String, String>) -> Self {
        Self {
            name: page_name(path),
            path: path.to_string(),
            query,
        }
    }
}

pub fn page_name(path: &str) -> String {
    path.trim_start_matches('/').replace(['/', '.'], "_")
}

/// The backend object serving one session.
///
/// Every method has a default so an app only implements what it exposes.
/// Apps are shared between request tasks and the optional `main` task, so any
/// mutable state needs interior mutability.
#[async_trait]
pub trait App: Send + Sync + 'static {
    /// Target of the browser's `server.<name>(...)` and `app.<name>(...)` calls.
    async fn call(&self, _js: &Js, method: &str, _args: Vec<Value>) -> Result<Value, CallError> {
        Err(CallError::method_not_found(method))
    }

    fn property(&self, _name: &str) -> Option<Property> {
        None
    }

    fn set_property(&self, name: &str, _value: Value) -> Result<(), CallError> {
        Err(CallError::method_not_found(name))
    }

    /// Whether [`App::main`] should be spawned when the session is created.
    fn has_main(&self) -> bool {
        false
    }

    async fn main(&self, _js: Js) -> Result<(), CallError> {
        Ok(())
    }

    fn home(&self) -> Home {
        Home::Page
    }

    fn has_page(&self, _name: &str) -> bool {
        false
    }

    /// Runs on its own task; must call [`PageHandle::send_html`] to answer the request.
    async fn page(
        &self,
        _js: &Js,
        request: PageRequest,
        _page: PageHandle,
    ) -> Result<(), CallError> {
        Err(CallError::method_not_found(&request.name))
    }
}

pub type AppFactory = Arc<dyn Fn() -> Arc<dyn App> + Send + Sync>;

/// Wraps a constructor so every new session gets its own app.
pub fn factory<A, F>(build: F) -> AppFactory
where
    A: App,
    F: Fn() -> A + Send + Sync + 'static,
{
    Arc::new(move || Arc::new(build()) as Arc<dyn App>)
}
