//! The relay server proper

use std::io;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use voidlink_auth::AuthValidator;
use voidlink_control::{ClientRegistry, ControlServer};
use voidlink_router::{RoutingTable, TunnelRegistration};
use voidlink_server_http::HttpProxyServer;
use voidlink_server_mc::McProxyServer;
use voidlink_server_udp::UdpRelay;

/// Relay server errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind control port on {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try a different --control-addr")]
    ControlBind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Listener addresses and the base domain for the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Control port for client AUTH/DATA connections.
    pub control_addr: SocketAddr,
    /// Shared Minecraft proxy port.
    pub mc_addr: SocketAddr,
    /// Shared HTTP proxy port.
    pub http_addr: SocketAddr,
    /// Base domain subdomains are routed over (e.g. `eu.example.com`).
    pub domain: String,
    /// Pool the admin layer allocates public UDP ports from.
    pub udp_port_range: RangeInclusive<u16>,
}

/// Where the listeners actually landed, for callers that bind port 0.
#[derive(Debug, Clone, Copy)]
pub struct BoundAddrs {
    pub control: SocketAddr,
    /// Absent when the Minecraft listener failed to bind.
    pub mc: Option<SocketAddr>,
    /// Absent when the HTTP listener failed to bind.
    pub http: Option<SocketAddr>,
}

/// The core tunnel relay.
///
/// Holds all shared state; [`start`](Self::start) brings up the listeners
/// and returns. Only the control port is load-bearing at startup: losing
/// a shared proxy listener degrades the relay but does not kill it.
pub struct TunnelRelay {
    config: RelayConfig,
    tables: Arc<RoutingTable>,
    clients: Arc<ClientRegistry>,
    udp: UdpRelay,
    validator: Arc<dyn AuthValidator>,
    shutdown: CancellationToken,
}

impl TunnelRelay {
    pub fn new(config: RelayConfig, validator: Arc<dyn AuthValidator>) -> Self {
        let tables = Arc::new(RoutingTable::new());
        let clients = Arc::new(ClientRegistry::new());
        let shutdown = CancellationToken::new();
        let udp = UdpRelay::new(tables.clone(), clients.clone(), shutdown.clone());

        Self {
            config,
            tables,
            clients,
            udp,
            validator,
            shutdown,
        }
    }

    /// Bind the listeners and spawn the server loops.
    ///
    /// Failure to bind the control port is fatal; a dead Minecraft or HTTP
    /// listener is logged and that surface stays down.
    pub async fn start(&self) -> Result<BoundAddrs, RelayError> {
        let control_listener =
            TcpListener::bind(self.config.control_addr)
                .await
                .map_err(|e| RelayError::ControlBind {
                    address: self.config.control_addr.ip().to_string(),
                    port: self.config.control_addr.port(),
                    reason: e.to_string(),
                })?;
        let control_addr = control_listener.local_addr()?;
        info!("Control server listening on {}", control_addr);

        let control = Arc::new(ControlServer::new(
            self.clients.clone(),
            self.tables.clone(),
            self.validator.clone(),
            self.shutdown.clone(),
        ));
        tokio::spawn(control.run(control_listener));

        let mc = match TcpListener::bind(self.config.mc_addr).await {
            Ok(listener) => {
                let addr = listener.local_addr()?;
                info!("Minecraft proxy listening on {} (shared, routed by subdomain)", addr);
                let server = Arc::new(McProxyServer::new(
                    self.config.domain.clone(),
                    self.tables.clone(),
                    self.clients.clone(),
                    self.shutdown.clone(),
                ));
                tokio::spawn(server.run(listener));
                Some(addr)
            }
            Err(e) => {
                error!("Failed to bind Minecraft proxy on {}: {}", self.config.mc_addr, e);
                None
            }
        };

        let http = match TcpListener::bind(self.config.http_addr).await {
            Ok(listener) => {
                let addr = listener.local_addr()?;
                info!("HTTP proxy listening on {} (shared, routed by Host header)", addr);
                let server = Arc::new(HttpProxyServer::new(
                    self.config.domain.clone(),
                    self.tables.clone(),
                    self.clients.clone(),
                    self.shutdown.clone(),
                ));
                tokio::spawn(server.run(listener));
                Some(addr)
            }
            Err(e) => {
                error!("Failed to bind HTTP proxy on {}: {}", self.config.http_addr, e);
                None
            }
        };

        Ok(BoundAddrs {
            control: control_addr,
            mc,
            http,
        })
    }

    /// Activate a tunnel: install its routes and, when it has a public UDP
    /// port, bring up the voice relay for it. Idempotent with respect to an
    /// already-active listener. Called for every persisted-active tunnel at
    /// startup and on user start actions.
    pub async fn register(&self, reg: TunnelRegistration) {
        self.tables.register_tunnel(&reg);

        if let Some(public_port) = reg.udp_public_port {
            if !self.config.udp_port_range.contains(&public_port) {
                warn!(
                    public_port,
                    tunnel_id = %reg.tunnel_id,
                    "Public UDP port is outside the configured pool"
                );
            }
            // The port belongs to this registration from here on, whether
            // or not the listener comes up; the admin layer allocates
            // against this index.
            self.tables
                .insert_udp_route(public_port, &reg.tunnel_id, reg.udp_local_port);
            self.udp
                .start_listener(public_port, reg.tunnel_id.clone(), reg.udp_local_port)
                .await;
        }
    }

    /// Deactivate a tunnel: drop its routes, close its UDP listener and
    /// disconnect its client. Total: unregistering something that is not
    /// registered is a no-op.
    pub fn unregister(&self, tunnel_id: &str, subdomain: &str, udp_public_port: Option<u16>) {
        self.tables.unregister_tunnel(tunnel_id, subdomain);

        if let Some(public_port) = udp_public_port {
            self.udp.stop_listener(public_port);
            self.tables.remove_udp_route(public_port);
        }

        if let Some(client) = self.clients.remove(tunnel_id) {
            client.close();
        }
    }

    /// Whether a desktop client currently holds the tunnel's control channel.
    pub fn is_client_connected(&self, tunnel_id: &str) -> bool {
        self.clients.is_connected(tunnel_id)
    }

    /// Whether the public UDP port is allocated to a registered tunnel.
    pub fn is_udp_port_in_use(&self, port: u16) -> bool {
        self.tables.is_udp_port_in_use(port)
    }

    /// Stop all listeners and tear down every loop. Open client streams
    /// die as their reads return.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
