//! Browser bootstrap and the rules for splicing it into served HTML.
//!
//! The bootstrap gives the page:
//! - `evalBrowser()`, the long-poll loop that evaluates statements pushed by the backend
//! - `sendFromBrowserToServer(expr, query)`, which answers a synchronous evaluation
//! - `sendErrorToServer(expr, message)` and `closeBrowserWindow()`
//! - `server`, a proxy whose calls post fire-and-forget `async` tasks
//! - `app`, a proxy whose reads and writes are synchronous `get`/`set` tasks

use once_cell::sync::Lazy;
use regex::Regex;

use crate::ids::{PageId, SessionId};

/// Path every bridge request is posted to.
pub const BRIDGE_PATH: &str = "/_process_srv0";

/// Pages that reference this file get the bootstrap served separately.
pub const BOOTSTRAP_FILE: &str = "appscript.js";

pub const BOOTSTRAP_SCRIPT: &str = r#"
if (typeof UID === "undefined") { UID = "COOKIE"; }
if (typeof PAGEID === "undefined") { PAGEID = "COOKIE"; }
function riptidePost(payload, sync) {
    var request = new XMLHttpRequest();
    request.open("POST", "/_process_srv0", !sync);
    request.setRequestHeader("Content-Type", "application/json;charset=UTF-8");
    request.send(JSON.stringify(payload));
    return request;
}
function evalBrowser() {
    var request = new XMLHttpRequest();
    request.onreadystatechange = function() {
        if (request.readyState != 4) { return; }
        if (request.status == 200) {
            setTimeout(evalBrowser, 1);
            try {
                eval(request.responseText);
            } catch (e) {
                setTimeout(function() { sendErrorToServer(request.responseText, e.message); }, 1);
            }
        }
    };
    request.open("POST", "/_process_srv0");
    request.setRequestHeader("Content-Type", "application/json;charset=UTF-8");
    request.send(JSON.stringify({"session": PAGEID, "task": "next"}));
}
function sendFromBrowserToServer(expression, query) {
    var value;
    var error = "";
    try {
        value = eval(expression);
    } catch (e) {
        value = 0;
        error = e.message;
        console.log("riptide: evaluation failed", query, error);
    }
    riptidePost({"session": PAGEID, "task": "state", "value": value, "query": query, "error": error}, false);
}
function sendErrorToServer(expr, message) {
    riptidePost({"session": PAGEID, "task": "error", "error": message, "expr": expr}, false);
}
function closeBrowserWindow() {
    riptidePost({"session": PAGEID, "task": "unload"}, false);
}
function riptideResult(request) {
    if (request.status !== 200) { return null; }
    var result = JSON.parse(request.responseText);
    if ("error" in result) {
        console.log("riptide:", result["error"]);
        throw result["error"];
    }
    if (result["type"] == "expression") {
        return eval(result["expression"]);
    }
    return result["value"];
}
server = new Proxy({}, {
    get: function(target, property) {
        return function(...args) {
            var request = new XMLHttpRequest();
            request.onreadystatechange = function() {
                if (request.readyState == 4 && request.status == 200) {
                    var result = JSON.parse(request.responseText);
                    if ("error" in result) {
                        console.log("riptide async:", property, result["error"]);
                    }
                }
            };
            request.open("POST", "/_process_srv0");
            request.setRequestHeader("Content-Type", "application/json;charset=UTF-8");
            request.send(JSON.stringify({"session": PAGEID, "task": "async", "function": property, "args": args}));
        };
    }
});
function handleApp(property, args) {
    return riptideResult(riptidePost({"session": PAGEID, "task": "run", "block": true, "function": property, "args": args}, true));
}
function handleAppProperty(property) {
    return riptideResult(riptidePost({"session": PAGEID, "task": "get", "block": true, "expression": property}, true));
}
function handleAppSetProperty(property, value) {
    riptidePost({"session": PAGEID, "task": "set", "property": property, "value": value}, true);
    return true;
}
app = new Proxy({}, {
    get: function(target, property) { return handleAppProperty(property); },
    set: function(target, property, value) { return handleAppSetProperty(property, value); }
});
window.addEventListener("beforeunload", function(event) { closeBrowserWindow(); });
window.addEventListener("load", function(event) { evalBrowser(); });
"#;

static BOOTSTRAP_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<script[^>]*\s+src\s*=\s*"[^"]*appscript\.js""#)
        .expect("bootstrap tag pattern")
});

/// Insertion points tried in order after the bootstrap-file check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    Marker,
    Script,
    HeadClose,
    Body,
    Html,
}

const ANCHORS: [(Anchor, &str); 5] = [
    (Anchor::Marker, "{{jscript}}"),
    (Anchor::Script, "<script>"),
    (Anchor::HeadClose, "</head>"),
    (Anchor::Body, "<body>"),
    (Anchor::Html, "<html>"),
];

/// Page-scoped variables naming the session and the page.
pub fn page_variables(session: &SessionId, page: &PageId) -> String {
    format!(
        "var UID={};var PAGEID={};\n",
        script_string(session.as_str()),
        script_string(page.as_str())
    )
}

/// A JSON string literal that cannot close the surrounding `<script>` element.
fn script_string(text: &str) -> String {
    serde_json::Value::from(text).to_string().replace('<', "\\u003c")
}

/// Splices the bootstrap into `html` at the first matching anchor.
pub fn inject(html: &str, session: &SessionId, page: &PageId) -> String {
    let vars = page_variables(session, page);

    if let Some(found) = BOOTSTRAP_TAG.find(html) {
        let at = found.start();
        return format!("{}<script>{}</script>{}", &html[..at], vars, &html[at..]);
    }

    // ASCII lowercasing keeps byte offsets aligned with the original.
    let lowered = html.to_ascii_lowercase();
    for (anchor, needle) in ANCHORS {
        let Some(start) = lowered.find(needle) else {
            continue;
        };
        let end = start + needle.len();
        return match anchor {
            Anchor::Marker => {
                format!("{}{}{}{}", &html[..start], vars, BOOTSTRAP_SCRIPT, &html[end..])
            }
            Anchor::Script => {
                format!("{}{}{}{}", &html[..end], vars, BOOTSTRAP_SCRIPT, &html[end..])
            }
            Anchor::HeadClose => format!(
                "{}<script>{}{}</script>{}",
                &html[..start],
                vars,
                BOOTSTRAP_SCRIPT,
                &html[start..]
            ),
            Anchor::Body => format!(
                "{}<head><script>{}{}</script></head>{}",
                &html[..start],
                vars,
                BOOTSTRAP_SCRIPT,
                &html[start..]
            ),
            Anchor::Html => format!(
                "{}<head><script>{}{}</script></head>{}",
                &html[..end],
                vars,
                BOOTSTRAP_SCRIPT,
                &html[end..]
            ),
        };
    }

    format!("<head><script>{vars}{BOOTSTRAP_SCRIPT}</script></head>{html}")
}
