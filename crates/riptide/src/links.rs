use dashmap::DashMap;

use crate::functions::Callback;

/// What a named link does with the value it is given.
#[derive(Clone)]
pub enum Link {
    /// `<target>=<value>`
    Assign(String),
    /// `<target>(<value>)`; an array value is spread into the arguments.
    Call(String),
    /// Runs a backend callback with the value as its only argument.
    Callback(Callback),
}

/// Per-session names bound to browser expressions or backend callbacks, so
/// backend code can push a value by name without rebuilding the expression.
#[derive(Default)]
pub struct Links {
    links: DashMap<String, Link>,
}

impl Links {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `key`, replacing any earlier binding.
    pub fn insert(&self, key: &str, link: Link) {
        self.links.insert(key.to_string(), link);
    }

    pub fn get(&self, key: &str) -> Option<Link> {
        self.links.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, key: &str) -> bool {
        self.links.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
