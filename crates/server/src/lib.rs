//! HTTP + WebSocket surface over the per-session agent runtime.
//!
//! Exposed as a library so integration tests can assemble the app with a
//! scripted LLM provider; the binary in `main.rs` is a thin wrapper.

pub mod api;
pub mod auth;
pub mod router;
pub mod runtime;
pub mod state;
pub mod ws;
