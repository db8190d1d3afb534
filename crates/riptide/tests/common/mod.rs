//! An in-process stand-in for the browser side of the bridge.
//!
//! It long-polls the dispatcher like the bootstrap script does and executes the
//! statements it receives against a JSON object model. Only the expression
//! shapes the backend generates are understood.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use riptide::{
    protocol::{BridgeRequest, Reply, TaskKind},
    Bridge, BridgeConfig, PageId,
};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        poll_timeout: Duration::from_millis(50),
        eval_timeout: Duration::from_secs(2),
        ..BridgeConfig::default()
    }
}

/// Pulls the page id out of an injected document.
pub fn page_id_in(html: &str) -> PageId {
    const PAGE_VAR: &str = "var PAGEID=\"";
    let start = html.find(PAGE_VAR).expect("page id variable") + PAGE_VAR.len();
    let len = html[start..].find('"').expect("closing quote");
    PageId::from(&html[start..start + len])
}

type Native = Arc<dyn Fn(Vec<Value>) -> Result<Value, String> + Send + Sync>;

#[derive(Default)]
struct Model {
    globals: Map<String, Value>,
    elements: Map<String, Value>,
}

enum Seg {
    Name(String),
    Element(String),
}

pub struct Browser {
    bridge: Bridge,
    page: PageId,
    model: Mutex<Model>,
    natives: Mutex<HashMap<String, Native>>,
    executed: Mutex<Vec<String>>,
}

impl Browser {
    /// Renders a blank page on the shared session and attaches to it.
    pub fn open(bridge: &Bridge) -> Arc<Self> {
        let page = bridge
            .session(None)
            .render("<html><body></body></html>")
            .page_id;
        Self::attach(bridge, page)
    }

    pub fn attach(bridge: &Bridge, page: PageId) -> Arc<Self> {
        Arc::new(Self {
            bridge: bridge.clone(),
            page,
            model: Mutex::new(Model::default()),
            natives: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
        })
    }

    pub fn page(&self) -> &PageId {
        &self.page
    }

    /// Starts the long-poll loop. It ends when the bridge answers with `Stop`.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let browser = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match browser.send(TaskKind::Next).await {
                    Reply::Text(statement) if statement.is_empty() => continue,
                    Reply::Text(statement) => browser.run_statement(statement).await,
                    Reply::Stop | Reply::Json(_) => break,
                }
            }
        })
    }

    pub async fn send(&self, task: TaskKind) -> Reply {
        self.bridge
            .dispatch(BridgeRequest {
                session: self.page.clone(),
                task,
            })
            .await
    }

    pub fn set_global(&self, name: &str, value: Value) {
        self.model
            .lock()
            .unwrap()
            .globals
            .insert(name.to_string(), value);
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.model.lock().unwrap().globals.get(name).cloned()
    }

    pub fn add_element(&self, id: &str) {
        self.model
            .lock()
            .unwrap()
            .elements
            .insert(id.to_string(), json!({}));
    }

    pub fn element(&self, id: &str) -> Option<Value> {
        self.model.lock().unwrap().elements.get(id).cloned()
    }

    pub fn define<F>(&self, name: &str, f: F)
    where
        F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.natives
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(f));
    }

    /// Statements received from the bridge, in arrival order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    /// Fires the `onclick` handler installed on element `id`.
    pub async fn click(&self, id: &str) -> Reply {
        let handler = self
            .element(id)
            .and_then(|element| element.get("onclick").cloned())
            .and_then(|handler| handler.as_str().map(str::to_string))
            .expect("element has a click handler");
        let callback: u64 = handler
            .strip_prefix("callback:")
            .and_then(|id| id.parse().ok())
            .expect("installed handler is a bridge callback");
        self.send(TaskKind::Async {
            function: "_callfxn".into(),
            args: vec![json!(callback)],
        })
        .await
    }

    async fn run_statement(&self, statement: String) {
        self.executed.lock().unwrap().push(statement.clone());
        if let Some((expression, query)) = parse_sync_wrapper(&statement) {
            let (value, error) = match self.evaluate(&expression) {
                Ok(value) => (value, String::new()),
                Err(error) => (json!(0), error),
            };
            self.send(TaskKind::State {
                query,
                value,
                error,
            })
            .await;
            return;
        }
        if let Err(error) = self.evaluate(&statement) {
            self.send(TaskKind::Error {
                error,
                expr: statement,
            })
            .await;
        }
    }

    pub fn evaluate(&self, expression: &str) -> Result<Value, String> {
        let expression = expression.trim();
        if let Some((key, target)) = parse_membership(expression) {
            let container = self.lookup(&parse_path(target)?)?;
            return match container {
                Value::Object(map) => Ok(Value::Bool(map.contains_key(&key))),
                _ => Err("Cannot use 'in' operator to search for key".into()),
            };
        }
        if let Some((target, value)) = split_assignment(expression) {
            let value = parse_value(value)?;
            self.assign(&parse_path(target)?, value.clone())?;
            return Ok(value);
        }
        if let Some((callee, args)) = split_call(expression) {
            return self.call(callee, args);
        }
        self.lookup(&parse_path(expression)?)
    }

    fn call(&self, callee: &str, args: &str) -> Result<Value, String> {
        let args: Vec<Value> =
            serde_json::from_str(&format!("[{args}]")).map_err(|err| err.to_string())?;
        let native = self.natives.lock().unwrap().get(callee).cloned();
        match native {
            Some(native) => native(args),
            None => {
                let root = callee.split('.').next().unwrap_or(callee);
                Err(format!("{root} is not defined"))
            }
        }
    }

    fn lookup(&self, path: &[Seg]) -> Result<Value, String> {
        let model = self.model.lock().unwrap();
        let (first, rest) = path.split_first().ok_or("empty expression")?;
        let mut current = match first {
            Seg::Name(name) => model
                .globals
                .get(name)
                .cloned()
                .ok_or_else(|| format!("{name} is not defined"))?,
            Seg::Element(id) => model.elements.get(id).cloned().unwrap_or(Value::Null),
        };
        for seg in rest {
            let key = seg.key();
            current = match current {
                Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Null),
                Value::Array(items) => key
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| items.get(n).cloned())
                    .unwrap_or(Value::Null),
                Value::Null => {
                    return Err(format!("Cannot read properties of null (reading '{key}')"))
                }
                _ => Value::Null,
            };
        }
        Ok(current)
    }

    fn assign(&self, path: &[Seg], value: Value) -> Result<(), String> {
        let mut model = self.model.lock().unwrap();
        let (last, parents) = path.split_last().ok_or("empty assignment")?;
        let Some((first, middle)) = parents.split_first() else {
            return match last {
                Seg::Name(name) => {
                    model.globals.insert(name.clone(), value);
                    Ok(())
                }
                Seg::Element(_) => Err("Invalid left-hand side in assignment".into()),
            };
        };
        let mut current = match first {
            Seg::Name(name) => model
                .globals
                .get_mut(name)
                .ok_or_else(|| format!("{name} is not defined"))?,
            Seg::Element(id) => model
                .elements
                .get_mut(id)
                .ok_or_else(|| {
                    format!("Cannot set properties of null (setting '{}')", last.key())
                })?,
        };
        for seg in middle {
            current = current
                .as_object_mut()
                .and_then(|map| map.get_mut(seg.key()))
                .ok_or_else(|| {
                    format!("Cannot set properties of undefined (setting '{}')", last.key())
                })?;
        }
        current
            .as_object_mut()
            .ok_or_else(|| format!("Cannot create property '{}'", last.key()))?
            .insert(last.key().to_string(), value);
        Ok(())
    }
}

impl Seg {
    fn key(&self) -> &str {
        match self {
            Seg::Name(name) | Seg::Element(name) => name,
        }
    }
}

/// `sendFromBrowserToServer("<expression>", <query>)`
fn parse_sync_wrapper(statement: &str) -> Option<(String, u64)> {
    let inner = statement
        .strip_prefix("sendFromBrowserToServer(")?
        .strip_suffix(')')?;
    let (literal, query) = inner.rsplit_once(", ")?;
    Some((serde_json::from_str(literal).ok()?, query.trim().parse().ok()?))
}

/// `'key' in target`
fn parse_membership(expression: &str) -> Option<(String, &str)> {
    let (key, end) = read_single_quoted(expression)?;
    let target = expression[end..].strip_prefix(" in ")?;
    Some((key, target))
}

/// Reads a `'...'` literal at the start of `text`, returning it unescaped and
/// the byte offset just past the closing quote.
fn read_single_quoted(text: &str) -> Option<(String, usize)> {
    let mut chars = text.char_indices();
    if chars.next()?.1 != '\'' {
        return None;
    }
    let mut out = String::new();
    while let Some((at, c)) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?.1),
            '\'' => return Some((out, at + 1)),
            other => out.push(other),
        }
    }
    None
}

/// Splits `target=value` at the first top-level `=`.
fn split_assignment(expression: &str) -> Option<(&str, &str)> {
    let bytes = expression.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut escaped = false;
    for (at, &b) in bytes.iter().enumerate() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'"' | b'\'' => quote = Some(b),
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b'=' if depth == 0 => {
                let next = bytes.get(at + 1).copied();
                let prev = at.checked_sub(1).map(|p| bytes[p]);
                if next != Some(b'=') && !matches!(prev, Some(b'=' | b'!' | b'<' | b'>')) {
                    return Some((&expression[..at], &expression[at + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

/// `callee(args)` for anything but an element lookup.
fn split_call(expression: &str) -> Option<(&str, &str)> {
    let body = expression.strip_suffix(')')?;
    let open = body.find('(')?;
    let callee = &body[..open];
    if callee.ends_with("document.getElementById") || callee.contains('[') {
        return None;
    }
    Some((callee, &body[open + 1..]))
}

fn parse_value(text: &str) -> Result<Value, String> {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix("function(){server._callfxn(") {
        let id = rest
            .strip_suffix(");}")
            .ok_or("unterminated handler")?;
        return Ok(Value::String(format!("callback:{id}")));
    }
    serde_json::from_str(text).map_err(|err| format!("Unexpected token: {err}"))
}

fn parse_path(text: &str) -> Result<Vec<Seg>, String> {
    let mut segs = Vec::new();
    let mut rest = text.trim();

    if let Some(after) = rest.strip_prefix("document.getElementById(") {
        let end = json_string_end(after).ok_or("bad element id")?;
        let id: String = serde_json::from_str(&after[..end]).map_err(|err| err.to_string())?;
        rest = after[end..].strip_prefix(')').ok_or("expected )")?;
        segs.push(Seg::Element(id));
    } else {
        let (name, after) = take_ident(rest);
        if name.is_empty() {
            return Err(format!("Unexpected token in '{text}'"));
        }
        segs.push(Seg::Name(name.to_string()));
        rest = after;
    }

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let (name, after) = take_ident(after);
            if name.is_empty() {
                return Err(format!("Unexpected token in '{text}'"));
            }
            segs.push(Seg::Name(name.to_string()));
            rest = after;
        } else if let Some(after) = rest.strip_prefix('[') {
            let (key, end) = read_single_quoted(after).ok_or("expected quoted key")?;
            rest = after[end..].strip_prefix(']').ok_or("expected ]")?;
            segs.push(Seg::Name(key));
        } else {
            return Err(format!("Unexpected token in '{text}'"));
        }
    }
    Ok(segs)
}

fn take_ident(text: &str) -> (&str, &str) {
    let end = text
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '$'))
        .unwrap_or(text.len());
    text.split_at(end)
}

fn json_string_end(text: &str) -> Option<usize> {
    let mut chars = text.char_indices();
    if chars.next()?.1 != '"' {
        return None;
    }
    let mut escaped = false;
    for (at, c) in chars {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(at + 1),
            _ => {}
        }
    }
    None
}
