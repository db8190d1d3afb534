//! Backend-side construction of browser expressions.
//!
//! A [`Chain`] accumulates fragments of one JavaScript expression and is sent
//! exactly once, either as a fire-and-forget statement or as a synchronous
//! evaluation whose value comes back through a query. A chain still pending
//! when dropped is sent asynchronously.

use std::{fmt, sync::Arc, time::Duration};

use futures::{future::BoxFuture, FutureExt};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::{
    app::CallError,
    context::SessionContext,
    error::BridgeError,
    functions::{Callback, CallbackId},
    ids::SessionId,
    links::Link,
    queue::Task,
};

/// Value a synchronous evaluation yields when it had to be sent without waiting.
pub fn default_value() -> Value {
    Value::from(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Wait for the browser's result.
    Sync,
    /// Queue the statement and return immediately.
    Async,
}

/// A call argument or assigned value: plain JSON, or another pending chain that
/// is evaluated first.
pub enum Arg {
    Value(Value),
    Chain(Chain),
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<Chain> for Arg {
    fn from(chain: Chain) -> Self {
        Arg::Chain(chain)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Value(Value::from(value))
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Value(Value::from(value))
    }
}

macro_rules! arg_from_scalar {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Arg {
            fn from(value: $ty) -> Self {
                Arg::Value(Value::from(value))
            }
        })*
    };
}

arg_from_scalar!(bool, i32, i64, u32, u64, usize, f64);

/// One step appended to a chain.
pub enum Op {
    /// `.name`; `dom.name` becomes `document.getElementById("name")`.
    Attr(String),
    /// `(args...)`
    Call(Vec<Arg>),
    /// `['key']`
    Key(String),
    /// Appended verbatim.
    Raw(String),
}

enum Fragment {
    Text(String),
    Deferred(Chain),
}

/// Handle backend code uses to reach its session's browser.
#[derive(Clone)]
pub struct Js {
    ctx: Arc<SessionContext>,
}

impl Js {
    pub(crate) fn new(ctx: Arc<SessionContext>) -> Self {
        Self { ctx }
    }

    pub fn session_id(&self) -> &SessionId {
        self.ctx.id()
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// Starts a chain at the global `name`.
    pub fn attr(&self, name: &str) -> Chain {
        Chain::new(Arc::clone(&self.ctx)).attr(name)
    }

    /// Shorthand for `attr("dom").attr(id)`.
    pub fn dom(&self, id: &str) -> Chain {
        self.attr("dom").attr(id)
    }

    /// Starts a chain from raw JavaScript.
    pub fn statement(&self, text: &str) -> Chain {
        Chain::new(Arc::clone(&self.ctx)).append(Op::Raw(text.to_string()))
    }

    /// Evaluates `text` in the browser and returns its value.
    pub async fn eval(&self, text: &str) -> Result<Value, BridgeError> {
        self.statement(text).eval().await
    }

    /// Assigns a global, e.g. `counter = 0`.
    pub async fn set(&self, name: &str, value: impl Into<Arg>) -> Result<(), BridgeError> {
        self.attr(name).assign(value).await
    }

    /// Binds `key` so that [`Js::set_linked`] assigns to `target`.
    pub async fn link_value(&self, key: &str, target: Chain) -> Result<(), BridgeError> {
        let template = target.into_template().await?;
        self.ctx.links().insert(key, Link::Assign(template));
        Ok(())
    }

    /// Binds `key` so that [`Js::set_linked`] calls `target` with the value.
    pub async fn link_call(&self, key: &str, target: Chain) -> Result<(), BridgeError> {
        let template = target.into_template().await?;
        self.ctx.links().insert(key, Link::Call(template));
        Ok(())
    }

    /// Binds `key` to a backend callback.
    pub fn link_callback(&self, key: &str, callback: Callback) {
        self.ctx.links().insert(key, Link::Callback(callback));
    }

    /// Pushes `value` through the link bound to `key`. Browser targets are sent
    /// without waiting. Returns `false` when nothing is bound to `key`.
    pub async fn set_linked(&self, key: &str, value: Value) -> Result<bool, CallError> {
        let Some(link) = self.ctx.links().get(key) else {
            debug!(session = %self.ctx.id(), key, "no link bound");
            return Ok(false);
        };
        match link {
            Link::Assign(target) => self.statement(&format!("{target}={value}")).send().await?,
            Link::Call(target) => {
                let args = match value {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                self.statement(&target).call(args).send().await?
            }
            Link::Callback(callback) => {
                callback.invoke(self.clone(), vec![value]).await?;
            }
        }
        Ok(true)
    }

    /// Ships `statement` and waits for its result, honouring the guard.
    async fn round_trip(
        &self,
        statement: String,
        wait: Duration,
    ) -> Result<Option<Value>, BridgeError> {
        let Ok(permit) = self.ctx.guard().try_acquire(&statement) else {
            debug!(
                session = %self.ctx.id(),
                statement = %statement,
                "guard held, sending without waiting"
            );
            counter!("riptide_evaluations_degraded_total", 1);
            self.ctx.enqueue(statement).await;
            return Ok(None);
        };

        let (query, reply) = self.ctx.queries().register();
        let wrapped = format!(
            "sendFromBrowserToServer({}, {query})",
            Value::from(statement.as_str())
        );
        if !self.ctx.enqueue(wrapped).await {
            self.ctx.queries().cancel(query);
            return Err(self.ctx.take_error().unwrap_or_else(|| {
                BridgeError::Timeout(format!("timeout inserting task: {statement}"))
            }));
        }
        counter!("riptide_evaluations_total", 1);

        let reply = match tokio::time::timeout(wait, reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) | Err(_) => {
                self.ctx.queries().cancel(query);
                counter!("riptide_evaluation_timeouts_total", 1);
                return Err(BridgeError::Timeout(format!(
                    "timeout waiting on: {statement}"
                )));
            }
        };
        drop(permit);

        trace!(query, value = %reply.value, "query resolved");
        if !reply.error.is_empty() {
            return Err(BridgeError::RemoteExecution {
                message: reply.error,
                expression: statement,
            });
        }
        Ok(Some(reply.value))
    }
}

/// An expression under construction. Build with [`Chain::append`] or the
/// shorthands, then send it once.
pub struct Chain {
    ctx: Arc<SessionContext>,
    fragments: Vec<Fragment>,
    pending: bool,
}

impl Chain {
    fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            ctx,
            fragments: Vec::new(),
            pending: true,
        }
    }

    pub fn append(mut self, op: Op) -> Self {
        match op {
            Op::Attr(name) => self.push_attr(&name, true),
            Op::Call(args) => {
                self.push_text("(");
                for (n, arg) in args.into_iter().enumerate() {
                    if n > 0 {
                        self.push_text(",");
                    }
                    self.push_arg(arg);
                }
                self.push_text(")");
            }
            Op::Key(key) => self.push_text(&format!("[{}]", quote_key(&key))),
            Op::Raw(text) => self.push_text(&text),
        }
        self
    }

    pub fn attr(self, name: &str) -> Self {
        self.append(Op::Attr(name.to_string()))
    }

    pub fn call<I, A>(self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.append(Op::Call(args.into_iter().map(Into::into).collect()))
    }

    /// `()`
    pub fn invoke(self) -> Self {
        self.append(Op::Call(Vec::new()))
    }

    /// Indexes without checking membership; see [`Chain::get_item`].
    pub fn key(self, key: impl fmt::Display) -> Self {
        self.append(Op::Key(key.to_string()))
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// The expression text so far. Unevaluated chain arguments show as `<pending>`.
    pub fn preview(&self) -> String {
        self.fragments
            .iter()
            .map(|fragment| match fragment {
                Fragment::Text(text) => text.as_str(),
                Fragment::Deferred(_) => "<pending>",
            })
            .collect()
    }

    fn push_text(&mut self, text: &str) {
        self.fragments.push(Fragment::Text(text.to_string()));
    }

    fn push_attr(&mut self, name: &str, dom_rule: bool) {
        if name.is_empty() {
            return;
        }
        if dom_rule && self.last_segment() == Some("dom") {
            self.fragments.pop();
            self.fragments.push(Fragment::Text(format!(
                "document.getElementById({})",
                Value::from(name)
            )));
            return;
        }
        if !self.fragments.is_empty() {
            self.fragments.push(Fragment::Text(".".into()));
        }
        self.fragments.push(Fragment::Text(name.to_string()));
    }

    /// The most recent attribute segment, if the chain ends with one.
    fn last_segment(&self) -> Option<&str> {
        match self.fragments.last() {
            Some(Fragment::Text(text)) => Some(text.as_str()),
            _ => None,
        }
    }

    fn push_arg(&mut self, arg: Arg) {
        match arg {
            Arg::Value(value) => self.push_text(&value.to_string()),
            Arg::Chain(chain) => self.fragments.push(Fragment::Deferred(chain)),
        }
    }

    /// Evaluates chain arguments in order and joins the final text.
    async fn render(&mut self) -> Result<String, BridgeError> {
        let mut statement = String::new();
        let mut fragments = std::mem::take(&mut self.fragments).into_iter();
        while let Some(fragment) = fragments.next() {
            match fragment {
                Fragment::Text(text) => statement.push_str(&text),
                Fragment::Deferred(nested) => match eval_nested(nested).await {
                    Ok(value) => statement.push_str(&value.to_string()),
                    Err(err) => {
                        // Later arguments must not leak out through their own drop.
                        self.fragments.extend(fragments);
                        self.discard();
                        return Err(err);
                    }
                },
            }
        }
        Ok(statement)
    }

    /// Sends the chain. `Async` queues it and yields the default value; `Sync`
    /// waits for the browser, unless the guard is already held, in which case it
    /// is queued like `Async`. A second flush is a no-op for `Async` and
    /// [`BridgeError::Spent`] for `Sync`.
    pub async fn flush(&mut self, mode: FlushMode) -> Result<Value, BridgeError> {
        let wait = self.ctx.config().eval_timeout;
        self.flush_with(mode, wait).await
    }

    async fn flush_with(&mut self, mode: FlushMode, wait: Duration) -> Result<Value, BridgeError> {
        if let Some(err) = self.ctx.take_error() {
            self.discard();
            return Err(err);
        }
        if !self.pending {
            return match mode {
                FlushMode::Async => Ok(default_value()),
                FlushMode::Sync => Err(BridgeError::Spent(self.preview())),
            };
        }
        self.pending = false;
        let statement = self.render().await?;
        match mode {
            FlushMode::Async => {
                self.ctx.enqueue(statement).await;
                Ok(default_value())
            }
            FlushMode::Sync => Ok(Js::new(Arc::clone(&self.ctx))
                .round_trip(statement, wait)
                .await?
                .unwrap_or_else(default_value)),
        }
    }

    /// The expression text with chain arguments evaluated, without sending it.
    pub(crate) async fn into_template(mut self) -> Result<String, BridgeError> {
        self.pending = false;
        self.render().await
    }

    /// Marks this chain and any chain arguments as sent without sending them.
    fn discard(&mut self) {
        self.pending = false;
        for fragment in self.fragments.drain(..) {
            if let Fragment::Deferred(mut nested) = fragment {
                nested.discard();
            }
        }
    }

    pub async fn eval(mut self) -> Result<Value, BridgeError> {
        self.flush(FlushMode::Sync).await
    }

    pub async fn eval_timeout(mut self, wait: Duration) -> Result<Value, BridgeError> {
        self.flush_with(FlushMode::Sync, wait).await
    }

    pub async fn eval_as<T: DeserializeOwned>(self) -> Result<T, BridgeError> {
        let value = self.eval().await?;
        serde_json::from_value(value).map_err(|err| BridgeError::Decode(err.to_string()))
    }

    /// Fire and forget.
    pub async fn send(mut self) -> Result<(), BridgeError> {
        self.flush(FlushMode::Async).await.map(|_| ())
    }

    /// Sends as a statement: waits for completion when the guard is free so that
    /// browser errors surface here, otherwise queues without waiting.
    pub async fn exec(mut self) -> Result<(), BridgeError> {
        self.flush(FlushMode::Sync).await.map(|_| ())
    }

    /// `= value`, executed as a statement.
    pub async fn assign(mut self, value: impl Into<Arg>) -> Result<(), BridgeError> {
        self.push_text("=");
        self.push_arg(value.into());
        self.exec().await
    }

    /// `.attr = value`
    pub async fn set(mut self, attr: &str, value: impl Into<Arg>) -> Result<(), BridgeError> {
        self.push_attr(attr, false);
        self.assign(value).await
    }

    /// `['key'] = value`
    pub async fn set_item(
        self,
        key: impl fmt::Display,
        value: impl Into<Arg>,
    ) -> Result<(), BridgeError> {
        self.key(key).assign(value).await
    }

    /// Installs `callback` as the handler at `.attr`, e.g. a button's `onclick`.
    pub async fn set_callback(
        mut self,
        attr: &str,
        callback: &Callback,
    ) -> Result<CallbackId, BridgeError> {
        let id = self.ctx.functions().register(callback);
        self.push_attr(attr, false);
        self.push_text(&format!("=function(){{server._callfxn({id});}}"));
        self.exec().await?;
        Ok(id)
    }

    /// `chain['key']`, failing with [`BridgeError::KeyNotPresent`] when the
    /// browser reports the key missing.
    pub async fn get_item(mut self, key: impl fmt::Display) -> Result<Value, BridgeError> {
        let key = key.to_string();
        if let Some(err) = self.ctx.take_error() {
            self.discard();
            return Err(err);
        }
        self.pending = false;
        let base = self.render().await?;
        let quoted = quote_key(&key);
        let js = Js::new(Arc::clone(&self.ctx));
        let wait = self.ctx.config().eval_timeout;

        match js.round_trip(format!("{quoted} in {base}"), wait).await? {
            None => return Ok(default_value()),
            Some(present) if !is_truthy(&present) => return Err(BridgeError::KeyNotPresent(key)),
            Some(_) => {}
        }
        Ok(js
            .round_trip(format!("{base}[{quoted}]"), wait)
            .await?
            .unwrap_or_else(default_value))
    }

    /// Evaluates the chain and tests `item` against the result: a key of an
    /// object, an element of an array or a substring of a string.
    pub async fn contains(self, item: impl Into<Value>) -> Result<bool, BridgeError> {
        let item = item.into();
        let container = self.eval().await?;
        Ok(match &container {
            Value::Object(map) => map.contains_key(&key_text(&item)),
            Value::Array(values) => values.contains(&item),
            Value::String(text) => text.contains(&key_text(&item)),
            _ => false,
        })
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("session", self.ctx.id())
            .field("expression", &self.preview())
            .field("pending", &self.pending)
            .finish()
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        if !self.pending {
            return;
        }
        self.pending = false;
        if self.fragments.is_empty() {
            return;
        }
        if self
            .fragments
            .iter()
            .any(|fragment| matches!(fragment, Fragment::Deferred(_)))
        {
            warn!(
                session = %self.ctx.id(),
                expression = %self.preview(),
                "dropping unsent chain with unevaluated arguments"
            );
            self.discard();
            return;
        }
        let statement = self.preview();
        debug!(
            session = %self.ctx.id(),
            statement = %statement,
            "sending chain dropped before flush"
        );
        self.ctx.tasks().push_unchecked(Task::Statement(statement));
    }
}

fn eval_nested(chain: Chain) -> BoxFuture<'static, Result<Value, BridgeError>> {
    async move { chain.eval().await }.boxed()
}

fn quote_key(key: &str) -> String {
    format!("'{}'", key.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn key_text(item: &Value) -> String {
    match item {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// JavaScript truthiness of a JSON value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
