use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::{app::CallError, chain::Js};

pub type CallbackId = u64;

type CallbackFn =
    dyn Fn(Js, Vec<Value>) -> BoxFuture<'static, Result<Value, CallError>> + Send + Sync;

/// A backend function that can be installed as a browser event handler.
/// Clones share identity, so installing the same callback twice reuses its id.
#[derive(Clone)]
pub struct Callback {
    inner: Arc<CallbackFn>,
}

impl Callback {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Js, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |js, args| Box::pin(f(js, args))),
        }
    }

    pub async fn invoke(&self, js: Js, args: Vec<Value>) -> Result<Value, CallError> {
        (self.inner)(js, args).await
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

/// Callbacks reachable from the browser through `server._callfxn(<id>)`.
#[derive(Default)]
pub struct FunctionRegistry {
    next_id: AtomicU64,
    callbacks: DashMap<CallbackId, Callback>,
    ids: DashMap<usize, CallbackId>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `callback`, allocating one on first registration.
    pub fn register(&self, callback: &Callback) -> CallbackId {
        *self
            .ids
            .entry(callback.identity())
            .or_insert_with(|| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                self.callbacks.insert(id, callback.clone());
                id
            })
            .value()
    }

    pub fn get(&self, id: CallbackId) -> Option<Callback> {
        self.callbacks.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}
