use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use riptide::{App, AppFactory, CallError, Home, Js, Property};
use serde_json::{json, Value};
use tracing::debug;

const PAGE: &str = r#"<html>
<head><title>riptide counter</title></head>
<body>
<p>Clicked <span id="count">0</span> times</p>
<button onclick="app.increment()">Increment</button>
<button onclick="server.clear()">Clear</button>
</body>
</html>"#;

/// Counts clicks. `increment` is reached through the synchronous `app` proxy,
/// `clear` through the fire-and-forget `server` proxy.
#[derive(Default)]
pub struct Counter {
    count: AtomicI64,
}

pub fn factory() -> AppFactory {
    riptide::factory(Counter::default)
}

impl Counter {
    async fn show(&self, js: &Js, count: i64) -> Result<(), CallError> {
        js.dom("count").set("innerHTML", count).await?;
        Ok(())
    }
}

#[async_trait]
impl App for Counter {
    async fn call(&self, js: &Js, method: &str, _args: Vec<Value>) -> Result<Value, CallError> {
        let count = match method {
            "increment" => self.count.fetch_add(1, Ordering::SeqCst) + 1,
            "clear" => {
                self.count.store(0, Ordering::SeqCst);
                0
            }
            other => return Err(CallError::method_not_found(other)),
        };
        debug!(session = %js.session_id(), count, "counter changed");
        self.show(js, count).await?;
        Ok(json!(count))
    }

    fn property(&self, name: &str) -> Option<Property> {
        match name {
            "count" => Some(Property::Value(json!(self.count.load(Ordering::SeqCst)))),
            "increment" | "clear" => Some(Property::Method),
            _ => None,
        }
    }

    fn set_property(&self, name: &str, value: Value) -> Result<(), CallError> {
        match (name, value.as_i64()) {
            ("count", Some(count)) => {
                self.count.store(count, Ordering::SeqCst);
                Ok(())
            }
            ("count", None) => Err(CallError::new("TypeError", "count must be an integer")),
            (other, _) => Err(CallError::method_not_found(other)),
        }
    }

    fn home(&self) -> Home {
        Home::Html(PAGE.to_string())
    }
}
