use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use riptide::{App, AppFactory, CallError, Callback, Home, Js};
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, warn};

const PAGE: &str = r#"<html>
<head><title>riptide clock</title></head>
<body>
<p id="time">WHEN</p>
<p>started <span id="started"></span></p>
<button id="b1" onclick="server.reset()">Reset</button>
<button id="b2" onclick="server.stop()">Pause</button>
</body>
</html>"#;

const TICK: Duration = Duration::from_millis(100);

/// Stopwatch pushed to the page from the session's main loop. Pausing swaps the
/// pause button's handler for a backend callback that resumes it.
pub struct Clock {
    inner: Arc<ClockInner>,
}

struct ClockInner {
    running: AtomicBool,
    started: Mutex<Instant>,
    on_stop: OnceCell<Callback>,
    on_restart: OnceCell<Callback>,
}

pub fn factory() -> AppFactory {
    riptide::factory(Clock::new)
}

impl Clock {
    pub fn new() -> Self {
        let inner = Arc::new(ClockInner {
            running: AtomicBool::new(true),
            started: Mutex::new(Instant::now()),
            on_stop: OnceCell::new(),
            on_restart: OnceCell::new(),
        });
        let _ = inner.on_stop.set(bind(&inner, "stop"));
        let _ = inner.on_restart.set(bind(&inner, "restart"));
        Self { inner }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

fn bind(inner: &Arc<ClockInner>, method: &'static str) -> Callback {
    let weak: Weak<ClockInner> = Arc::downgrade(inner);
    Callback::new(move |js, _args| {
        let weak = weak.clone();
        async move {
            match weak.upgrade() {
                Some(inner) => inner.handle(&js, method).await,
                None => Ok(Value::Null),
            }
        }
    })
}

impl ClockInner {
    async fn handle(&self, js: &Js, method: &str) -> Result<Value, CallError> {
        match method {
            "reset" => {
                *self.started.lock() = Instant::now();
                js.dom("time").set("innerHTML", format!("{:.1}", 0.0)).await?;
            }
            "start" => self.running.store(true, Ordering::SeqCst),
            "stop" => {
                self.running.store(false, Ordering::SeqCst);
                js.dom("b2").set("innerHTML", "Restart").await?;
                if let Some(restart) = self.on_restart.get() {
                    js.dom("b2").set_callback("onclick", restart).await?;
                }
            }
            "restart" => {
                self.running.store(true, Ordering::SeqCst);
                js.dom("b2").set("innerHTML", "Pause").await?;
                if let Some(stop) = self.on_stop.get() {
                    js.dom("b2").set_callback("onclick", stop).await?;
                }
            }
            other => return Err(CallError::method_not_found(other)),
        }
        debug!(session = %js.session_id(), method, "clock control");
        Ok(Value::Null)
    }

    fn elapsed(&self) -> Duration {
        self.started.lock().elapsed()
    }
}

#[async_trait]
impl App for Clock {
    async fn call(&self, js: &Js, method: &str, _args: Vec<Value>) -> Result<Value, CallError> {
        self.inner.handle(js, method).await
    }

    fn has_main(&self) -> bool {
        true
    }

    async fn main(&self, js: Js) -> Result<(), CallError> {
        *self.inner.started.lock() = Instant::now();
        if let Ok(now) = OffsetDateTime::now_utc().format(&Rfc3339) {
            js.dom("started").attr("innerHTML").assign(now).await.ok();
        }
        loop {
            if self.inner.running.load(Ordering::SeqCst) {
                let shown = format!("{:.1}", self.inner.elapsed().as_secs_f64());
                if let Err(err) = js.dom("time").set("innerHTML", shown).await {
                    warn!(session = %js.session_id(), error = %err, "clock update failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
            tokio::time::sleep(TICK).await;
        }
    }

    fn home(&self) -> Home {
        Home::Html(PAGE.to_string())
    }
}
