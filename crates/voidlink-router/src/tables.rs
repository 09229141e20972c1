//! The concurrent routing indices

use crate::TunnelRegistration;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::info;

/// Where a client's `UDP_REPLY` gets delivered: the public listener the
/// originating datagram arrived on, and the peer that sent it.
#[derive(Clone)]
pub struct UdpSession {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
}

/// All shared routing state of the relay.
///
/// Every index supports point insertion, deletion and lookup; nothing here
/// is transactional. Entries for one tunnel are kept consistent by the
/// registration/unregistration callers, not by this type.
#[derive(Default)]
pub struct RoutingTable {
    /// subdomain → tunnel id (present iff the tunnel is registered)
    subdomains: DashMap<String, String>,
    /// tunnel id → Minecraft local port
    mc_ports: DashMap<String, u16>,
    /// tunnel id → HTTP local port (present iff the tunnel has HTTP enabled)
    http_ports: DashMap<String, u16>,
    /// public UDP port → owning tunnel id
    udp_owners: DashMap<u16, String>,
    /// public UDP port → UDP local port
    udp_local_ports: DashMap<u16, u16>,
    /// conn id (peer address string) → live UDP session
    udp_sessions: DashMap<String, UdpSession>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the subdomain and TCP-port routes for a registration.
    ///
    /// Re-registering an existing tunnel updates the routes in place; a
    /// registration without HTTP clears any stale HTTP route. UDP routes
    /// are installed separately, alongside the listener lifecycle.
    pub fn register_tunnel(&self, reg: &TunnelRegistration) {
        self.subdomains
            .insert(reg.subdomain.clone(), reg.tunnel_id.clone());
        self.mc_ports.insert(reg.tunnel_id.clone(), reg.mc_local_port);

        match reg.http_local_port {
            Some(port) => {
                self.http_ports.insert(reg.tunnel_id.clone(), port);
            }
            None => {
                self.http_ports.remove(&reg.tunnel_id);
            }
        }

        info!(
            tunnel_id = %reg.tunnel_id,
            subdomain = %reg.subdomain,
            "Registered tunnel routes"
        );
    }

    /// Remove the subdomain and TCP-port routes for a tunnel. Total: absent
    /// entries are simply skipped.
    pub fn unregister_tunnel(&self, tunnel_id: &str, subdomain: &str) {
        self.subdomains.remove(subdomain);
        self.mc_ports.remove(tunnel_id);
        self.http_ports.remove(tunnel_id);

        info!(tunnel_id = %tunnel_id, subdomain = %subdomain, "Unregistered tunnel routes");
    }

    /// Whether the tunnel currently appears as a value in the subdomain
    /// index. Checked once per client authentication.
    pub fn is_tunnel_registered(&self, tunnel_id: &str) -> bool {
        self.subdomains.iter().any(|entry| entry.value() == tunnel_id)
    }

    pub fn tunnel_for_subdomain(&self, subdomain: &str) -> Option<String> {
        self.subdomains.get(subdomain).map(|e| e.value().clone())
    }

    pub fn mc_local_port(&self, tunnel_id: &str) -> Option<u16> {
        self.mc_ports.get(tunnel_id).map(|e| *e.value())
    }

    pub fn http_local_port(&self, tunnel_id: &str) -> Option<u16> {
        self.http_ports.get(tunnel_id).map(|e| *e.value())
    }

    // ---- UDP routes ----

    /// Bind a public UDP port to its tunnel. Installed synchronously at
    /// registration time, before the listener bind is attempted: pool
    /// queries must see the port as owned for as long as a registered
    /// tunnel claims it.
    pub fn insert_udp_route(&self, public_port: u16, tunnel_id: &str, local_port: u16) {
        self.udp_owners.insert(public_port, tunnel_id.to_string());
        self.udp_local_ports.insert(public_port, local_port);
    }

    /// Drop a public UDP port's routes.
    pub fn remove_udp_route(&self, public_port: u16) {
        self.udp_owners.remove(&public_port);
        self.udp_local_ports.remove(&public_port);
    }

    /// Whether the public port is allocated to a registered tunnel. The
    /// admin layer consults this when handing out ports from the pool.
    pub fn is_udp_port_in_use(&self, public_port: u16) -> bool {
        self.udp_owners.contains_key(&public_port)
    }

    pub fn udp_owner(&self, public_port: u16) -> Option<String> {
        self.udp_owners.get(&public_port).map(|e| e.value().clone())
    }

    pub fn udp_local_port(&self, public_port: u16) -> Option<u16> {
        self.udp_local_ports.get(&public_port).map(|e| *e.value())
    }

    // ---- UDP sessions ----

    /// Record (or refresh) the session for a peer. One store per inbound
    /// datagram; the key is the peer's address string, so repeat traffic
    /// from the same peer overwrites its own entry.
    pub fn upsert_udp_session(&self, conn_id: &str, session: UdpSession) {
        self.udp_sessions.insert(conn_id.to_string(), session);
    }

    pub fn udp_session(&self, conn_id: &str) -> Option<UdpSession> {
        self.udp_sessions.get(conn_id).map(|e| e.value().clone())
    }

    /// Discard every session owned by the given listener. Called when the
    /// listener is closed at unregistration.
    pub fn remove_udp_sessions_for(&self, socket: &Arc<UdpSocket>) {
        self.udp_sessions
            .retain(|_, session| !Arc::ptr_eq(&session.socket, socket));
    }

    #[cfg(test)]
    pub(crate) fn udp_session_count(&self) -> usize {
        self.udp_sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(id: &str, subdomain: &str) -> TunnelRegistration {
        TunnelRegistration {
            tunnel_id: id.to_string(),
            subdomain: subdomain.to_string(),
            mc_local_port: 25565,
            http_local_port: Some(8123),
            udp_local_port: 24454,
            udp_public_port: Some(20777),
        }
    }

    #[test]
    fn register_then_lookup() {
        let tables = RoutingTable::new();
        tables.register_tunnel(&registration("t1", "happy-cat"));

        assert_eq!(tables.tunnel_for_subdomain("happy-cat").as_deref(), Some("t1"));
        assert_eq!(tables.mc_local_port("t1"), Some(25565));
        assert_eq!(tables.http_local_port("t1"), Some(8123));
        assert!(tables.is_tunnel_registered("t1"));
    }

    #[test]
    fn unregister_restores_prior_state() {
        let tables = RoutingTable::new();
        let reg = registration("t1", "happy-cat");

        tables.register_tunnel(&reg);
        tables.insert_udp_route(20777, "t1", 24454);

        tables.unregister_tunnel("t1", "happy-cat");
        tables.remove_udp_route(20777);

        assert!(tables.tunnel_for_subdomain("happy-cat").is_none());
        assert!(tables.mc_local_port("t1").is_none());
        assert!(tables.http_local_port("t1").is_none());
        assert!(!tables.is_tunnel_registered("t1"));
        assert!(!tables.is_udp_port_in_use(20777));
        assert!(tables.udp_owner(20777).is_none());
        assert!(tables.udp_local_port(20777).is_none());
    }

    #[test]
    fn unregister_is_total() {
        let tables = RoutingTable::new();
        // Nothing registered; must not panic or error.
        tables.unregister_tunnel("ghost", "nowhere");
        tables.remove_udp_route(29999);
    }

    #[test]
    fn reregistration_without_http_clears_stale_route() {
        let tables = RoutingTable::new();
        tables.register_tunnel(&registration("t1", "happy-cat"));
        assert_eq!(tables.http_local_port("t1"), Some(8123));

        let mut reg = registration("t1", "happy-cat");
        reg.http_local_port = None;
        tables.register_tunnel(&reg);
        assert!(tables.http_local_port("t1").is_none());
    }

    #[test]
    fn udp_port_in_use_tracks_registrations_exactly() {
        let tables = RoutingTable::new();
        assert!(!tables.is_udp_port_in_use(20777));

        tables.insert_udp_route(20777, "t1", 24454);
        tables.insert_udp_route(20778, "t2", 24455);
        assert!(tables.is_udp_port_in_use(20777));
        assert!(tables.is_udp_port_in_use(20778));
        assert!(!tables.is_udp_port_in_use(20779));

        tables.remove_udp_route(20777);
        assert!(!tables.is_udp_port_in_use(20777));
        assert!(tables.is_udp_port_in_use(20778));
    }

    #[tokio::test]
    async fn session_sweep_only_touches_one_listener() {
        let tables = RoutingTable::new();
        let sock_a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sock_b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();

        tables.upsert_udp_session(
            "peer-a",
            UdpSession { socket: sock_a.clone(), peer },
        );
        tables.upsert_udp_session(
            "peer-b",
            UdpSession { socket: sock_b.clone(), peer },
        );
        assert_eq!(tables.udp_session_count(), 2);

        tables.remove_udp_sessions_for(&sock_a);
        assert_eq!(tables.udp_session_count(), 1);
        assert!(tables.udp_session("peer-a").is_none());
        assert!(tables.udp_session("peer-b").is_some());
    }

    #[tokio::test]
    async fn session_upsert_overwrites_same_peer() {
        let tables = RoutingTable::new();
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer1: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let peer2: SocketAddr = "127.0.0.1:50001".parse().unwrap();

        tables.upsert_udp_session("p", UdpSession { socket: sock.clone(), peer: peer1 });
        tables.upsert_udp_session("p", UdpSession { socket: sock.clone(), peer: peer2 });

        assert_eq!(tables.udp_session_count(), 1);
        assert_eq!(tables.udp_session("p").unwrap().peer, peer2);
    }
}
