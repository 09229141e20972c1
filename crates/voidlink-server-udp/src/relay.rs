//! UDP listener lifecycle and the datagram read loop

use crate::UDP_RECV_BUF;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voidlink_control::ClientRegistry;
use voidlink_proto::ControlCommand;
use voidlink_router::{RoutingTable, UdpSession};

struct ListenerHandle {
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

/// Owns one read-loop task per active public UDP port.
///
/// Listener handles are tracked in a mutexed map so `stop_listener` can
/// abort the task and sweep its sessions. Port ownership itself lives in
/// the routing table and is installed by the registration caller before
/// the bind is attempted; this type only manages sockets and tasks.
pub struct UdpRelay {
    tables: Arc<RoutingTable>,
    clients: Arc<ClientRegistry>,
    listeners: Mutex<HashMap<u16, ListenerHandle>>,
    shutdown: CancellationToken,
}

impl UdpRelay {
    pub fn new(
        tables: Arc<RoutingTable>,
        clients: Arc<ClientRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tables,
            clients,
            listeners: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Bring up the listener for a tunnel's public port. A port that is
    /// already being served is left alone, which makes re-registration
    /// idempotent. A bind failure abandons only this tunnel's UDP channel;
    /// game and HTTP traffic keep flowing.
    pub async fn start_listener(&self, public_port: u16, tunnel_id: String, local_port: u16) {
        if self.is_listening(public_port) {
            debug!(public_port, "UDP listener already running");
            return;
        }

        let socket = match UdpSocket::bind(("0.0.0.0", public_port)).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!(public_port, "Failed to bind UDP listener: {}", e);
                return;
            }
        };

        info!(
            public_port,
            tunnel_id = %tunnel_id,
            local_port,
            "UDP voice relay listening"
        );

        let task = tokio::spawn(read_loop(
            socket.clone(),
            tunnel_id,
            local_port,
            self.tables.clone(),
            self.clients.clone(),
            self.shutdown.clone(),
        ));

        self.listeners
            .lock()
            .unwrap()
            .insert(public_port, ListenerHandle { socket, task });
    }

    /// Tear down the listener for a public port, dropping every session it
    /// owned. Total: an unknown port is a no-op.
    pub fn stop_listener(&self, public_port: u16) {
        let handle = self.listeners.lock().unwrap().remove(&public_port);
        let Some(handle) = handle else {
            return;
        };

        handle.task.abort();
        self.tables.remove_udp_sessions_for(&handle.socket);
        info!(public_port, "UDP voice relay closed");
    }

    pub fn is_listening(&self, public_port: u16) -> bool {
        self.listeners.lock().unwrap().contains_key(&public_port)
    }
}

/// One listener's datagram loop.
///
/// The receive buffer is reused, so each datagram is copied out before the
/// send to the client is spawned off; a slow control channel must not stall
/// the socket. Ordering across datagrams is not preserved past this point,
/// which UDP callers already tolerate.
async fn read_loop(
    socket: Arc<UdpSocket>,
    tunnel_id: String,
    local_port: u16,
    tables: Arc<RoutingTable>,
    clients: Arc<ClientRegistry>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_RECV_BUF];
    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!(tunnel_id = %tunnel_id, "UDP read error: {}", e);
                    break;
                }
            },
        };

        // No connected client: the datagram is dropped on the floor.
        let Some(client) = clients.get(&tunnel_id) else {
            continue;
        };

        let conn_id = peer.to_string();
        tables.upsert_udp_session(
            &conn_id,
            UdpSession {
                socket: socket.clone(),
                peer,
            },
        );

        let command = ControlCommand::UdpPacket {
            conn_id,
            local_port,
            payload: buf[..len].to_vec(),
        };
        tokio::spawn(async move {
            if let Err(e) = client.send(&command).await {
                debug!("Failed to forward UDP packet to client: {}", e);
            }
        });
    }
}
