//! Shared HTTP proxy
//!
//! One public listener carries the web-map dashboards of every tunnel.
//! Routing inspects only the request's `Host` header; the header block is
//! mirrored while being read and replayed verbatim to the client's local
//! HTTP server once a data channel is paired. Host-less requests (HTTP/1.0
//! without the header) are rejected.

pub mod server;

pub use server::HttpProxyServer;

use std::time::Duration;

/// Deadline for reading the request head on a new connection.
pub const HTTP_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
