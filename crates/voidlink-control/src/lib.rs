//! Control/data protocol engine
//!
//! Owns the per-client state of the relay: the authenticated control
//! channels, the keepalive that sheds dead clients, and the rendezvous that
//! pairs each inbound public TCP connection with the data channel the client
//! opens in response to `OPEN`.

pub mod client;
pub mod server;

pub use client::{open_channel, relay, ClientConnection, ClientRegistry, DataChannel, OpenError};
pub use server::ControlServer;

use std::time::Duration;

/// Deadline for the first line of any inbound control-port connection.
pub const CONTROL_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between server `PING`s on a control channel.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Read deadline applied to every iteration of the control loop; twice the
/// keepalive interval, so two missed `PONG`s terminate the client.
pub const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a proxy waits for the client to open the matching data channel.
pub const DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(15);

/// Backoff between retries when a shared listener's accept fails.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Per-direction copy buffer for paired TCP relays.
pub const RELAY_BUF_SIZE: usize = 32 * 1024;
