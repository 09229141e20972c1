//! Shared Minecraft proxy listener

use crate::{parse_handshake, MC_HANDSHAKE_TIMEOUT};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voidlink_control::{open_channel, relay, ClientRegistry, OpenError, ACCEPT_RETRY_DELAY};
use voidlink_router::{extract_subdomain, RoutingTable};

/// The single public Minecraft listener, shared by every tunnel.
pub struct McProxyServer {
    domain: String,
    tables: Arc<RoutingTable>,
    clients: Arc<ClientRegistry>,
    shutdown: CancellationToken,
}

impl McProxyServer {
    pub fn new(
        domain: String,
        tables: Arc<RoutingTable>,
        clients: Arc<ClientRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            domain,
            tables,
            clients,
            shutdown,
        }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_player(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!("Minecraft proxy accept error: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
    }

    async fn handle_player(&self, mut stream: TcpStream, peer: SocketAddr) {
        let (server_addr, mirrored) =
            match timeout(MC_HANDSHAKE_TIMEOUT, parse_handshake(&mut stream)).await {
                Ok(Ok(parsed)) => parsed,
                Ok(Err(e)) => {
                    info!(%peer, "Handshake parse error: {}", e);
                    return;
                }
                Err(_) => {
                    info!(%peer, "Handshake read timed out");
                    return;
                }
            };

        let Some(subdomain) = extract_subdomain(&server_addr, &self.domain) else {
            info!(%peer, address = %server_addr, "Could not extract subdomain");
            return;
        };

        let Some(tunnel_id) = self.tables.tunnel_for_subdomain(&subdomain) else {
            info!(%peer, subdomain = %subdomain, "No tunnel for subdomain");
            return;
        };

        let Some(client) = self.clients.get(&tunnel_id) else {
            info!(tunnel_id = %tunnel_id, subdomain = %subdomain, "No client connected for tunnel");
            return;
        };

        let local_port = self.tables.mc_local_port(&tunnel_id).unwrap_or(25565);

        let mut channel = match open_channel(&client, local_port).await {
            Ok(channel) => channel,
            Err(OpenError::Timeout) => {
                info!(tunnel_id = %tunnel_id, "Timeout waiting for data channel");
                return;
            }
            Err(e) => {
                info!(tunnel_id = %tunnel_id, "Failed to open data channel: {}", e);
                return;
            }
        };

        // The client-side Minecraft server must see the full handshake
        // packet, so the mirrored bytes go out ahead of the relay.
        if let Err(e) = channel.stream.write_all(&mirrored).await {
            debug!(tunnel_id = %tunnel_id, "Failed to forward handshake: {}", e);
            return;
        }

        debug!(%peer, tunnel_id = %tunnel_id, subdomain = %subdomain, "Relaying player connection");
        relay(stream, channel).await;
    }
}
