//! VoidLink relay composition
//!
//! Ties the routing tables, control engine, shared proxies and UDP relay
//! together behind the two narrow interfaces the admin layer consumes:
//! tunnel registration (`register`/`unregister`) and the health queries
//! (`is_client_connected`, `is_udp_port_in_use`).

pub mod relay;

pub use relay::{BoundAddrs, RelayConfig, RelayError, TunnelRelay};
pub use voidlink_router::TunnelRegistration;
