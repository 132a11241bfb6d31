//! HTTP control surface for a running viewer

pub mod http_server;
pub use http_server::{router, run_http_server, AppState};
