//! Routing state for the VoidLink relay
//!
//! A flat set of concurrent indices binding subdomains, public UDP ports and
//! tunnel ids to each other, plus the transient UDP session map. Reads vastly
//! outnumber writes (every relayed connection does a handful of point
//! lookups; writes happen on tunnel lifecycle events), so each index is an
//! independent [`dashmap::DashMap`] and no global lock exists.

pub mod hostname;
pub mod tables;

pub use hostname::extract_subdomain;
pub use tables::{RoutingTable, UdpSession};

use serde::{Deserialize, Serialize};

/// Static description of one tunnel, as issued by the admin layer.
///
/// Registrations survive client reconnects; they are torn down only by an
/// explicit unregister.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRegistration {
    /// Opaque tunnel identifier.
    pub tunnel_id: String,
    /// Lower-case label routed over the base domain.
    pub subdomain: String,
    /// Port of the Minecraft server on the client's loopback.
    pub mc_local_port: u16,
    /// Port of the web-map HTTP server on the client's loopback, if any.
    pub http_local_port: Option<u16>,
    /// Port of the voice-chat UDP service on the client's loopback.
    pub udp_local_port: u16,
    /// Dedicated public UDP port for this tunnel, if one was allocated.
    pub udp_public_port: Option<u16>,
}
