use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub type QueryId = u64;

/// What the browser reported for one synchronous evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryReply {
    pub value: Value,
    /// Empty when evaluation succeeded.
    pub error: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueryStats {
    pub created: u64,
    pub resolved: u64,
    pub pending: usize,
}

/// Waiters for synchronous evaluations, keyed by query id.
pub struct PendingQueries {
    next_id: AtomicU64,
    waiters: DashMap<QueryId, oneshot::Sender<QueryReply>>,
    created: AtomicU64,
    resolved: AtomicU64,
}

impl PendingQueries {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiters: DashMap::new(),
            created: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
        }
    }

    /// Opens a rendezvous for a new query.
    pub fn register(&self) -> (QueryId, oneshot::Receiver<QueryReply>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        self.created.fetch_add(1, Ordering::Relaxed);
        (id, rx)
    }

    /// Hands `reply` to whoever waits on `id`. Returns false for unknown or
    /// abandoned queries.
    pub fn resolve(&self, id: QueryId, reply: QueryReply) -> bool {
        let Some((_, waiter)) = self.waiters.remove(&id) else {
            warn!(query = id, "reply for unknown query");
            return false;
        };
        if waiter.send(reply).is_err() {
            debug!(query = id, "query waiter already gone");
            return false;
        }
        self.resolved.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drops the waiter for `id`, e.g. after its wait timed out.
    pub fn cancel(&self, id: QueryId) -> bool {
        self.waiters.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn stats(&self) -> QueryStats {
        QueryStats {
            created: self.created.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            pending: self.waiters.len(),
        }
    }
}

impl Default for PendingQueries {
    fn default() -> Self {
        Self::new()
    }
}
