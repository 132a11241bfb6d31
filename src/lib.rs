//! livecook-viewer - receive-only WebRTC viewer for live cooking streams
//!
//! Joins a live stream through the signaling service, keeps at most one
//! transport alive per session and retries failed attempts a bounded number
//! of times.

pub mod catalog;
pub mod config;
pub mod web;
pub mod webrtc;

// Re-exports
pub use catalog::{CatalogError, StreamCatalog, StreamInfo};
pub use config::Config;
pub use webrtc::{ConnectionState, RetryPolicy, ViewerConnectionManager, ViewerError, ViewerStatus};
