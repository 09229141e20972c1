//! Shared Minecraft TCP proxy
//!
//! A single public listener carries every tunnel's game traffic. Each
//! accepted connection is routed by parsing the Minecraft Java Edition
//! handshake packet: the server address the player dialled carries the
//! subdomain, and the bytes consumed while deciding are mirrored so the
//! upstream server still sees an untouched packet.

pub mod handshake;
pub mod server;

pub use handshake::{parse_handshake, HandshakeError};
pub use server::McProxyServer;

use std::time::Duration;

/// Deadline for reading the complete handshake packet from a new player
/// connection.
pub const MC_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
