use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ids::PageId, query::QueryId};

/// Every request posted to the bridge path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRequest {
    /// The page the request comes from; its owner is the session.
    pub session: PageId,
    #[serde(flatten)]
    pub task: TaskKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "lowercase")]
pub enum TaskKind {
    /// Result of a synchronous evaluation.
    State {
        query: QueryId,
        #[serde(default)]
        value: Value,
        #[serde(default)]
        error: String,
    },
    /// Call a backend function and wait for its result.
    Run {
        function: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Call a backend function without taking the guard.
    Async {
        function: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Get {
        expression: String,
    },
    Set {
        property: String,
        #[serde(default)]
        value: Value,
    },
    /// Long-poll for the next statement.
    Next,
    /// A pushed statement threw in the browser.
    Error {
        error: String,
        #[serde(default)]
        expr: String,
    },
    Unload,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::State { .. } => "state",
            TaskKind::Run { .. } => "run",
            TaskKind::Async { .. } => "async",
            TaskKind::Get { .. } => "get",
            TaskKind::Set { .. } => "set",
            TaskKind::Next => "next",
            TaskKind::Error { .. } => "error",
            TaskKind::Unload => "unload",
        }
    }
}

/// What the dispatcher hands back to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Sent verbatim as text; empty for acknowledgements and idle polls.
    Text(String),
    Json(Value),
    /// The poll loop must stop; carries no body.
    Stop,
}

impl Reply {
    pub fn empty() -> Self {
        Reply::Text(String::new())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply::Json(serde_json::json!({ "error": message.into() }))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Json(Value::Object(map)) if map.contains_key("error"))
    }
}
