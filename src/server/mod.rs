//! Agent-facing HTTP/WebSocket server

pub mod auth;
pub mod http;

pub use http::run;
