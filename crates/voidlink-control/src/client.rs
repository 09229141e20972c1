//! Connected clients and the data-channel rendezvous

use crate::DATA_CHANNEL_TIMEOUT;
use dashmap::DashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use voidlink_proto::{generate_conn_id, ControlCommand};

/// A data channel delivered to a waiting proxy: the raw stream plus any
/// bytes the client already sent past its `DATA <conn_id>` handshake line.
#[derive(Debug)]
pub struct DataChannel {
    pub stream: TcpStream,
    pub leftover: Vec<u8>,
}

/// Errors from [`open_channel`].
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("control channel write failed: {0}")]
    Send(#[from] io::Error),

    #[error("timed out waiting for the client's data channel")]
    Timeout,

    #[error("client went away while pairing")]
    ClientGone,
}

/// The live control channel for one tunnel.
///
/// Writes are serialised through the mutex and go out one flushed line at a
/// time. The pending table holds one single-shot rendezvous slot per
/// in-flight `OPEN`.
pub struct ClientConnection {
    tunnel_id: String,
    writer: Mutex<OwnedWriteHalf>,
    pending: DashMap<String, oneshot::Sender<DataChannel>>,
    closed: CancellationToken,
}

impl ClientConnection {
    pub fn new(tunnel_id: String, writer: OwnedWriteHalf) -> Arc<Self> {
        Arc::new(Self {
            tunnel_id,
            writer: Mutex::new(writer),
            pending: DashMap::new(),
            closed: CancellationToken::new(),
        })
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// Write one command line to the client.
    pub async fn send(&self, command: &ControlCommand) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(command.to_line().as_bytes()).await
    }

    /// Mark the connection closed. The read and keepalive loops observe the
    /// token and drop their stream halves, which closes the socket.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await
    }

    pub fn has_pending(&self, conn_id: &str) -> bool {
        self.pending.contains_key(conn_id)
    }

    /// Claim the rendezvous slot for a conn id. At most one caller gets the
    /// sender; later offers for the same id find nothing.
    pub(crate) fn take_pending(&self, conn_id: &str) -> Option<oneshot::Sender<DataChannel>> {
        self.pending.remove(conn_id).map(|(_, tx)| tx)
    }

    fn install_pending(&self, conn_id: &str, tx: oneshot::Sender<DataChannel>) {
        self.pending.insert(conn_id.to_string(), tx);
    }

    fn remove_pending(&self, conn_id: &str) {
        self.pending.remove(conn_id);
    }
}

/// Ask the client to open a data channel to relay one public TCP connection.
///
/// Installs a rendezvous slot, sends `OPEN <conn_id> <local_port>` and waits
/// for the paired data channel. The pending entry is gone on every exit
/// path: claimed by the pairing on success, removed here on failure.
pub async fn open_channel(
    client: &Arc<ClientConnection>,
    local_port: u16,
) -> Result<DataChannel, OpenError> {
    open_channel_with_timeout(client, local_port, DATA_CHANNEL_TIMEOUT).await
}

pub async fn open_channel_with_timeout(
    client: &Arc<ClientConnection>,
    local_port: u16,
    wait: Duration,
) -> Result<DataChannel, OpenError> {
    let conn_id = generate_conn_id();
    let (tx, rx) = oneshot::channel();
    client.install_pending(&conn_id, tx);

    let open = ControlCommand::Open {
        conn_id: conn_id.clone(),
        local_port,
    };
    if let Err(e) = client.send(&open).await {
        client.remove_pending(&conn_id);
        return Err(OpenError::Send(e));
    }

    match timeout(wait, rx).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(_)) => {
            client.remove_pending(&conn_id);
            Err(OpenError::ClientGone)
        }
        Err(_) => {
            debug!(conn_id = %conn_id, "Data channel rendezvous timed out");
            client.remove_pending(&conn_id);
            Err(OpenError::Timeout)
        }
    }
}

/// Shuttle bytes between a public connection and its paired data channel
/// until either side closes.
///
/// Any bytes the client raced ahead with on the data channel go to the
/// public side first; the caller has already written its own mirrored bytes
/// into the data channel. Directions run concurrently and independently.
pub async fn relay(mut public: TcpStream, mut channel: DataChannel) {
    if !channel.leftover.is_empty() {
        if let Err(e) = public.write_all(&channel.leftover).await {
            debug!("Relay aborted writing data-channel leftover: {}", e);
            return;
        }
    }

    match tokio::io::copy_bidirectional_with_sizes(
        &mut public,
        &mut channel.stream,
        crate::RELAY_BUF_SIZE,
        crate::RELAY_BUF_SIZE,
    )
    .await
    {
        Ok((to_client, to_public)) => {
            debug!(
                "Relay finished: {} bytes to client, {} bytes to public peer",
                to_client, to_public
            );
        }
        Err(e) => {
            debug!("Relay connection closed: {}", e);
        }
    }
}

/// All currently connected clients, at most one per tunnel.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<String, Arc<ClientConnection>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly authenticated client, returning the connection it
    /// displaced (the caller closes it).
    pub fn insert_replace(&self, client: Arc<ClientConnection>) -> Option<Arc<ClientConnection>> {
        self.clients
            .insert(client.tunnel_id().to_string(), client)
    }

    pub fn get(&self, tunnel_id: &str) -> Option<Arc<ClientConnection>> {
        self.clients.get(tunnel_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, tunnel_id: &str) -> Option<Arc<ClientConnection>> {
        self.clients.remove(tunnel_id).map(|(_, c)| c)
    }

    /// Clear a tunnel's slot only if it still holds this exact connection;
    /// a replacement that raced in stays untouched.
    pub fn remove_if_same(&self, tunnel_id: &str, client: &Arc<ClientConnection>) {
        let _ = self
            .clients
            .remove_if(tunnel_id, |_, current| Arc::ptr_eq(current, client));
    }

    pub fn is_connected(&self, tunnel_id: &str) -> bool {
        self.clients.contains_key(tunnel_id)
    }

    /// Locate the client holding a pending rendezvous for this conn id.
    /// Sequential over the (small) set of connected clients; first match
    /// wins.
    pub fn find_pending(&self, conn_id: &str) -> Option<Arc<ClientConnection>> {
        self.clients
            .iter()
            .find(|entry| entry.value().has_pending(conn_id))
            .map(|entry| entry.value().clone())
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }
}
