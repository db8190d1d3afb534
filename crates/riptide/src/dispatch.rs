use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    app::{AppFactory, CallError, Property},
    chain::Js,
    clock::{SharedClock, SystemClock},
    config::BridgeConfig,
    context::SessionContext,
    error::BridgeError,
    ids::{PageId, SessionId},
    page::PageTracker,
    protocol::{BridgeRequest, Reply, TaskKind},
    query::QueryReply,
    queue::Task,
    registry::SessionRegistry,
};

/// Function name the browser uses to invoke a registered callback; the first
/// argument is the callback id.
pub const CALLBACK_DISPATCH: &str = "_callfxn";

/// Entry point for every inbound bridge request, plus the session and page
/// services adapters need around it.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    registry: SessionRegistry,
    config: BridgeConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    pub fn new(factory: AppFactory, config: BridgeConfig) -> Self {
        Self::with_clock(factory, config, Arc::new(SystemClock))
    }

    pub fn with_clock(factory: AppFactory, config: BridgeConfig, clock: SharedClock) -> Self {
        let pages = PageTracker::new(clock, config.page_expiry);
        Self {
            inner: Arc::new(BridgeInner {
                registry: SessionRegistry::new(factory, config.clone(), pages),
                config,
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn pages(&self) -> &PageTracker {
        self.inner.registry.pages()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn session(&self, id: Option<&SessionId>) -> Arc<SessionContext> {
        self.inner.registry.resolve(id)
    }

    /// Handle on the shared session, for apps that serve a single browser.
    pub fn js(&self) -> Js {
        self.session(None).js()
    }

    pub fn session_for_page(&self, page: &PageId) -> Option<SessionId> {
        self.pages().owner(page)
    }

    /// Starts the periodic page expiry sweep. Calling it again is a no-op.
    pub fn spawn_sweeper(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_none() {
            info!(interval = ?self.inner.config.sweep_interval, "page sweeper started");
            *sweeper = Some(self.pages().spawn_sweeper(self.inner.config.sweep_interval));
        }
    }

    pub async fn dispatch_json(&self, body: &[u8]) -> Reply {
        match serde_json::from_slice::<BridgeRequest>(body) {
            Ok(request) => self.dispatch(request).await,
            Err(err) => {
                warn!(error = %err, "malformed bridge request");
                Reply::error(format!("InvalidRequest: {err}"))
            }
        }
    }

    pub async fn dispatch(&self, request: BridgeRequest) -> Reply {
        let BridgeRequest { session: page, task } = request;
        let kind = task.name();
        counter!("riptide_requests_total", 1, "task" => kind);

        let ctx = match self.owner_context(&page) {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(page = %page, task = kind, "request for unknown page");
                return match task {
                    TaskKind::Next => Reply::Stop,
                    _ => Reply::error(err.wire_message()),
                };
            }
        };
        debug!(session = %ctx.id(), page = %page, task = kind, "dispatching");

        match task {
            TaskKind::State {
                query,
                value,
                error,
            } => {
                let accepted = ctx.queries().resolve(query, QueryReply { value, error });
                Reply::Json(json!({ "query": query, "accepted": accepted }))
            }
            TaskKind::Run { function, args } => {
                let _permit = match ctx.guard().try_acquire(&function) {
                    Ok(permit) => permit,
                    Err(err) => return Reply::error(err.wire_message()),
                };
                invoke(&ctx, &function, args).await
            }
            TaskKind::Async { function, args } => invoke(&ctx, &function, args).await,
            TaskKind::Get { expression } => {
                let _permit = match ctx.guard().try_acquire(&expression) {
                    Ok(permit) => permit,
                    Err(err) => return Reply::error(err.wire_message()),
                };
                match ctx.app().property(&expression) {
                    Some(Property::Value(value)) => {
                        Reply::Json(json!({ "type": "value", "value": value }))
                    }
                    Some(Property::Method) => Reply::Json(json!({
                        "type": "expression",
                        "expression": format!(
                            "(function(...args) {{ return handleApp('{expression}', args) }})"
                        ),
                    })),
                    None => Reply::error(BridgeError::MethodNotFound(expression).wire_message()),
                }
            }
            TaskKind::Set { property, value } => {
                let _permit = match ctx.guard().try_acquire(&property) {
                    Ok(permit) => permit,
                    Err(err) => return Reply::error(err.wire_message()),
                };
                match ctx.app().set_property(&property, value) {
                    Ok(()) => Reply::empty(),
                    Err(err) => Reply::error(err.to_string()),
                }
            }
            TaskKind::Next => match ctx.tasks().dequeue(self.inner.config.poll_timeout).await {
                Some(Task::Statement(statement)) => Reply::Text(statement),
                Some(Task::End) => Reply::Stop,
                None => Reply::empty(),
            },
            TaskKind::Error { error, expr } => {
                warn!(
                    session = %ctx.id(),
                    error = %error,
                    expression = %expr,
                    "browser reported an error"
                );
                ctx.record_error(BridgeError::RemoteExecution {
                    message: error,
                    expression: expr,
                });
                Reply::empty()
            }
            TaskKind::Unload => {
                info!(session = %ctx.id(), page = %page, "page unloaded");
                ctx.tasks().push_end();
                self.pages().expire(Some(&page));
                Reply::empty()
            }
        }
    }

    fn owner_context(&self, page: &PageId) -> Result<Arc<SessionContext>, BridgeError> {
        let owner = self.pages().touch(page)?;
        self.inner
            .registry
            .get(&owner)
            .ok_or_else(|| BridgeError::InvalidSession(owner.to_string()))
    }
}

async fn invoke(ctx: &Arc<SessionContext>, function: &str, args: Vec<Value>) -> Reply {
    let js = ctx.js();
    let result = if function == CALLBACK_DISPATCH {
        let mut args = args.into_iter();
        match args.next().as_ref().and_then(Value::as_u64) {
            Some(id) => match ctx.functions().get(id) {
                Some(callback) => callback.invoke(js, args.collect()).await,
                None => Err(CallError::method_not_found(&format!("{CALLBACK_DISPATCH}({id})"))),
            },
            None => Err(CallError::method_not_found(CALLBACK_DISPATCH)),
        }
    } else {
        ctx.app().call(&js, function, args).await
    };

    match result {
        Ok(value) => Reply::Json(json!({ "value": value })),
        Err(err) => {
            debug!(session = %ctx.id(), function, error = %err, "backend call failed");
            Reply::error(err.to_string())
        }
    }
}
