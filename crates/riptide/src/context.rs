use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    app::{App, Home, PageRequest},
    chain::Js,
    config::BridgeConfig,
    error::BridgeError,
    functions::FunctionRegistry,
    guard::ConcurrencyGuard,
    ids::{PageId, SessionId},
    links::Links,
    page::{PageTracker, RenderedPage},
    query::PendingQueries,
    queue::TaskQueue,
};

#[derive(Debug, Error)]
pub enum PageError {
    #[error("no page handler for {0}")]
    NotFound(String),
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything the bridge keeps for one session: its app, outbound queue, query
/// waiters, callbacks and the guard.
pub struct SessionContext {
    id: SessionId,
    app: Arc<dyn App>,
    config: BridgeConfig,
    pages: PageTracker,
    tasks: TaskQueue,
    queries: PendingQueries,
    functions: FunctionRegistry,
    links: Links,
    guard: ConcurrencyGuard,
    error: Mutex<Option<BridgeError>>,
    main_finished: AtomicBool,
}

impl SessionContext {
    pub fn new(
        id: SessionId,
        app: Arc<dyn App>,
        config: BridgeConfig,
        pages: PageTracker,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            app,
            tasks: TaskQueue::new(config.queue_capacity),
            config,
            pages,
            queries: PendingQueries::new(),
            functions: FunctionRegistry::new(),
            links: Links::new(),
            guard: ConcurrencyGuard::new(),
            error: Mutex::new(None),
            main_finished: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn app(&self) -> &Arc<dyn App> {
        &self.app
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn pages(&self) -> &PageTracker {
        &self.pages
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    pub fn queries(&self) -> &PendingQueries {
        &self.queries
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn links(&self) -> &Links {
        &self.links
    }

    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.guard
    }

    pub fn js(self: &Arc<Self>) -> Js {
        Js::new(Arc::clone(self))
    }

    /// Parks `err` until backend code next touches the bridge. A newer error
    /// replaces an older one.
    pub fn record_error(&self, err: BridgeError) {
        debug!(session = %self.id, error = %err, "error deferred to next flush");
        *self.error.lock() = Some(err);
    }

    pub fn take_error(&self) -> Option<BridgeError> {
        self.error.lock().take()
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }

    /// Queues `statement` within the configured budget. A statement that could
    /// not be queued is dropped and a timeout is parked for the next flush.
    pub async fn enqueue(&self, statement: String) -> bool {
        match self
            .tasks
            .enqueue(statement, self.config.enqueue_budget())
            .await
        {
            Ok(()) => true,
            Err(full) => {
                warn!(
                    session = %self.id,
                    statement = %full.statement,
                    "dropping statement, queue stayed full"
                );
                self.record_error(BridgeError::Timeout(full.to_string()));
                false
            }
        }
    }

    pub fn render(&self, html: &str) -> RenderedPage {
        self.pages.render(&self.id, html)
    }

    /// Spawns the app's long-running `main`, if it has one.
    pub(crate) fn start_main(self: &Arc<Self>) {
        if !self.app.has_main() {
            return;
        }
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            info!(session = %ctx.id, "app main started");
            match ctx.app.main(ctx.js()).await {
                Ok(()) => info!(session = %ctx.id, "app main finished"),
                Err(err) => warn!(session = %ctx.id, error = %err, "app main failed"),
            }
            ctx.main_finished.store(true, Ordering::Release);
        });
    }

    pub fn main_finished(&self) -> bool {
        self.main_finished.load(Ordering::Acquire)
    }

    /// HTML for `/`, with the bootstrap injected.
    pub async fn show_home(self: &Arc<Self>) -> Result<String, PageError> {
        match self.app.home() {
            Home::Html(html) => Ok(self.render(&html).html),
            Home::File(path) => {
                let html = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| PageError::Io { path, source })?;
                Ok(self.render(&html).html)
            }
            Home::Page => self.show_page("/index", HashMap::new()).await,
        }
    }

    /// Runs the page handler for `path` on its own task and returns the HTML it
    /// sends. The handler keeps running afterwards and may drive the page.
    pub async fn show_page(
        self: &Arc<Self>,
        path: &str,
        query: HashMap<String, String>,
    ) -> Result<String, PageError> {
        let request = PageRequest::new(path, query);
        if !self.app.has_page(&request.name) {
            return Err(PageError::NotFound(path.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let ctx = Arc::clone(self);
        let name = request.name.clone();
        tokio::spawn(async move {
            let js = ctx.js();
            let handle = PageHandle::new(js.clone(), tx);
            if let Err(err) = ctx.app.page(&js, request, handle).await {
                warn!(session = %ctx.id, page = %name, error = %err, "page handler failed");
            }
        });

        // The sender lives in the handle, so a handler that returns without
        // answering closes the channel.
        rx.await.map_err(|_| PageError::NotFound(path.to_string()))
    }
}

/// Lets a page handler answer its HTTP request and then watch the page it served.
pub struct PageHandle {
    js: Js,
    responder: Option<oneshot::Sender<String>>,
    page_id: Option<PageId>,
}

impl PageHandle {
    fn new(js: Js, responder: oneshot::Sender<String>) -> Self {
        Self {
            js,
            responder: Some(responder),
            page_id: None,
        }
    }

    /// Injects the bootstrap into `html` and sends it as the response.
    pub fn send_html(&mut self, html: &str) -> Result<PageId, BridgeError> {
        let Some(responder) = self.responder.take() else {
            return Err(BridgeError::Spent("page response".into()));
        };
        let ctx = self.js.context();
        let rendered = ctx.render(html);
        if responder.send(rendered.html).is_err() {
            warn!(
                session = %ctx.id(),
                page = %rendered.page_id,
                "page request went away before html was sent"
            );
        }
        self.page_id = Some(rendered.page_id.clone());
        Ok(rendered.page_id)
    }

    pub fn page_id(&self) -> Option<&PageId> {
        self.page_id.as_ref()
    }

    /// Whether the served page still shows activity. False before `send_html`.
    pub fn alive(&self) -> bool {
        self.page_id
            .as_ref()
            .map(|page| self.js.context().pages().is_alive(page))
            .unwrap_or(false)
    }
}
