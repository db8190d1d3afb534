//! Framework glue around [`crate::dispatch::Bridge`].

pub mod http;
