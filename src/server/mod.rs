//! HTTP transport for the resource engine

pub mod http;
pub mod util;

pub use http::{run, AppState, ContextStore, HttpConfig};
