//! Per-tunnel UDP voice relay
//!
//! Unlike the shared TCP proxies, every tunnel with voice chat owns a
//! dedicated public UDP port (allocated by the admin layer from a
//! configured pool). Inbound datagrams are hex-encoded onto the owning
//! client's control channel as `UDP_PKT`; the client's `UDP_REPLY` lines
//! are decoded by the control engine and sent back through the session
//! recorded here. The peer's own socket address is the session key, so a
//! rebinding NAT simply starts a fresh session.

pub mod relay;

pub use relay::UdpRelay;

/// Receive buffer per listener; one datagram can never exceed this.
pub const UDP_RECV_BUF: usize = 65535;
