//! Session-scoped command bridge between a backend process and a browser.
//!
//! Backend code builds JavaScript expressions with [`Js`] and [`Chain`]; the
//! browser drains them by long-polling the bridge path and reports results,
//! errors and calls back into the [`App`] serving its session.

pub mod adapters;
pub mod app;
pub mod chain;
pub mod clock;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod functions;
pub mod guard;
pub mod ids;
pub mod inject;
pub mod links;
pub mod page;
pub mod protocol;
pub mod query;
pub mod queue;
pub mod registry;

pub use app::{factory, App, AppFactory, CallError, Home, PageRequest, Property};
pub use chain::{Arg, Chain, FlushMode, Js, Op};
pub use config::BridgeConfig;
pub use context::{PageError, PageHandle, SessionContext};
pub use dispatch::Bridge;
pub use error::BridgeError;
pub use functions::Callback;
pub use ids::{PageId, SessionId};
pub use links::Link;
pub use protocol::{BridgeRequest, Reply, TaskKind};
