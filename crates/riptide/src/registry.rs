use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::counter;
use parking_lot::Mutex;
use tracing::info;

use crate::{
    app::AppFactory, config::BridgeConfig, context::SessionContext, ids::SessionId,
    page::PageTracker,
};

/// Maps session ids to their contexts and creates contexts on demand.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: DashMap<SessionId, Arc<SessionContext>>,
    first: Mutex<Option<SessionId>>,
    factory: AppFactory,
    config: BridgeConfig,
    pages: PageTracker,
}

impl SessionRegistry {
    pub fn new(factory: AppFactory, config: BridgeConfig, pages: PageTracker) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                first: Mutex::new(None),
                factory,
                config,
                pages,
            }),
        }
    }

    /// Returns the context for `id`, creating it if needed. Without an id the
    /// first context ever created is shared, or one is created.
    ///
    /// Must be called from within a tokio runtime: a new context spawns the
    /// app's `main`.
    pub fn resolve(&self, id: Option<&SessionId>) -> Arc<SessionContext> {
        if let Some(ctx) = id.and_then(|id| self.get(id)) {
            return ctx;
        }
        // Creation happens under `first` so two id-less callers cannot both
        // create the shared session.
        let mut first = self.inner.first.lock();
        let id = match id {
            Some(id) => id.clone(),
            None => match first.as_ref().and_then(|id| self.get(id)) {
                Some(ctx) => return ctx,
                None => SessionId::generate(),
            },
        };
        self.get_or_create(id, &mut first)
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionContext>> {
        self.inner
            .sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn get_or_create(&self, id: SessionId, first: &mut Option<SessionId>) -> Arc<SessionContext> {
        let ctx = match self.inner.sessions.entry(id.clone()) {
            Entry::Occupied(entry) => return Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let ctx = SessionContext::new(
                    id.clone(),
                    (self.inner.factory)(),
                    self.inner.config.clone(),
                    self.inner.pages.clone(),
                );
                entry.insert(Arc::clone(&ctx));
                ctx
            }
        };
        if first.is_none() {
            *first = Some(id.clone());
        }
        info!(session = %id, "session created");
        counter!("riptide_sessions_created_total", 1);
        ctx.start_main();
        ctx
    }

    pub fn pages(&self) -> &PageTracker {
        &self.inner.pages
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }
}
