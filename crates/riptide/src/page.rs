use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    clock::SharedClock,
    error::BridgeError,
    ids::{PageId, SessionId},
    inject,
};

/// Tracks every served document, who owns it and when it was last heard from.
#[derive(Clone)]
pub struct PageTracker {
    inner: Arc<PageTrackerInner>,
}

struct PageTrackerInner {
    pages: DashMap<PageId, PageEntry>,
    clock: SharedClock,
    expiry: Duration,
}

struct PageEntry {
    owner: SessionId,
    last_activity: Instant,
    html: Arc<str>,
}

#[derive(Debug, Clone)]
pub struct Page {
    pub id: PageId,
    pub owner: SessionId,
    pub last_activity: Instant,
    pub html: Arc<str>,
}

/// A document ready to send, with the bootstrap already injected.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub page_id: PageId,
    pub html: String,
}

impl PageTracker {
    pub fn new(clock: SharedClock, expiry: Duration) -> Self {
        Self {
            inner: Arc::new(PageTrackerInner {
                pages: DashMap::new(),
                clock,
                expiry,
            }),
        }
    }

    /// Stores `html` under a fresh page id owned by `owner`.
    pub fn register(&self, owner: SessionId, html: impl Into<Arc<str>>) -> PageId {
        let page_id = PageId::generate();
        self.insert(page_id.clone(), owner, html.into());
        page_id
    }

    /// Injects the bootstrap into `html` and registers the result as a new page.
    pub fn render(&self, owner: &SessionId, html: &str) -> RenderedPage {
        let page_id = PageId::generate();
        let injected = inject::inject(html, owner, &page_id);
        self.insert(page_id.clone(), owner.clone(), Arc::from(injected.as_str()));
        RenderedPage {
            page_id,
            html: injected,
        }
    }

    fn insert(&self, page_id: PageId, owner: SessionId, html: Arc<str>) {
        let now = self.inner.clock.now();
        debug!(page = %page_id, session = %owner, "page registered");
        counter!("riptide_pages_registered_total", 1);
        self.inner.pages.insert(
            page_id,
            PageEntry {
                owner,
                last_activity: now,
                html,
            },
        );
    }

    /// Records activity on `page_id` and returns its owning session.
    pub fn touch(&self, page_id: &PageId) -> Result<SessionId, BridgeError> {
        let now = self.inner.clock.now();
        match self.inner.pages.get_mut(page_id) {
            Some(mut entry) => {
                entry.last_activity = now;
                Ok(entry.owner.clone())
            }
            None => Err(BridgeError::InvalidSession(page_id.to_string())),
        }
    }

    pub fn owner(&self, page_id: &PageId) -> Option<SessionId> {
        self.inner
            .pages
            .get(page_id)
            .map(|entry| entry.owner.clone())
    }

    pub fn get(&self, page_id: &PageId) -> Option<Page> {
        self.inner.pages.get(page_id).map(|entry| Page {
            id: page_id.clone(),
            owner: entry.owner.clone(),
            last_activity: entry.last_activity,
            html: Arc::clone(&entry.html),
        })
    }

    pub fn is_alive(&self, page_id: &PageId) -> bool {
        let now = self.inner.clock.now();
        self.inner
            .pages
            .get(page_id)
            .map(|entry| now.saturating_duration_since(entry.last_activity) < self.inner.expiry)
            .unwrap_or(false)
    }

    /// Removes `page_id` if given, then every page past the inactivity threshold.
    /// Returns how many pages were removed.
    pub fn expire(&self, page_id: Option<&PageId>) -> usize {
        let mut removed = 0usize;
        if let Some(page_id) = page_id {
            if self.inner.pages.remove(page_id).is_some() {
                debug!(page = %page_id, "page expired explicitly");
                removed += 1;
            } else {
                warn!(page = %page_id, "expire requested for unknown page");
            }
        }

        let now = self.inner.clock.now();
        let expiry = self.inner.expiry;
        let before = self.inner.pages.len();
        self.inner
            .pages
            .retain(|_, entry| now.saturating_duration_since(entry.last_activity) < expiry);
        let swept = before.saturating_sub(self.inner.pages.len());
        if swept > 0 {
            debug!(swept, "stale pages removed");
        }
        removed += swept;
        counter!("riptide_pages_expired_total", removed as u64);
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.pages.is_empty()
    }

    pub fn pages_for(&self, owner: &SessionId) -> Vec<PageId> {
        self.inner
            .pages
            .iter()
            .filter(|entry| &entry.owner == owner)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let _ = tracker.expire(None);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn tracker() -> (PageTracker, ManualClock) {
        let clock = ManualClock::new();
        let tracker = PageTracker::new(Arc::new(clock.clone()), Duration::from_secs(5));
        (tracker, clock)
    }

    #[test_timeout::timeout]
    fn touch_resolves_owner_and_refreshes_liveness() {
        let (tracker, clock) = tracker();
        let owner = SessionId::from("s1");
        let page = tracker.register(owner.clone(), "<p>hi</p>");

        clock.advance(Duration::from_secs(4));
        assert!(tracker.is_alive(&page));
        assert_eq!(tracker.touch(&page).unwrap(), owner);

        clock.advance(Duration::from_secs(4));
        assert!(tracker.is_alive(&page));
        clock.advance(Duration::from_secs(2));
        assert!(!tracker.is_alive(&page));
    }

    #[test_timeout::timeout]
    fn unknown_page_is_invalid_session() {
        let (tracker, _) = tracker();
        let err = tracker.touch(&PageId::from("missing")).unwrap_err();
        assert_eq!(err, BridgeError::InvalidSession("missing".into()));
    }

    #[test_timeout::timeout]
    fn expire_removes_named_page_and_stale_pages() {
        let (tracker, clock) = tracker();
        let owner = SessionId::from("s1");
        let stale = tracker.register(owner.clone(), "a");
        clock.advance(Duration::from_secs(6));
        let named = tracker.register(owner.clone(), "b");
        let fresh = tracker.register(owner.clone(), "c");

        assert_eq!(tracker.expire(Some(&named)), 2);
        assert!(tracker.owner(&stale).is_none());
        assert!(tracker.owner(&named).is_none());
        assert_eq!(tracker.owner(&fresh), Some(owner));
    }

    #[test_timeout::timeout]
    fn render_injects_ids_and_stores_payload() {
        let (tracker, _) = tracker();
        let owner = SessionId::from("sess");
        let rendered = tracker.render(&owner, "<html><body>x</body></html>");
        assert!(rendered.html.contains(&format!("var PAGEID=\"{}\"", rendered.page_id)));
        let page = tracker.get(&rendered.page_id).unwrap();
        assert_eq!(&*page.html, rendered.html.as_str());
        assert_eq!(tracker.pages_for(&owner), vec![rendered.page_id]);
    }
}
