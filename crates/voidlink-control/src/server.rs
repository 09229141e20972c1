//! Control-port listener and per-client protocol loops

use crate::client::{ClientConnection, ClientRegistry, DataChannel};
use crate::{
    ACCEPT_RETRY_DELAY, CONTROL_HANDSHAKE_TIMEOUT, CONTROL_READ_TIMEOUT, KEEPALIVE_INTERVAL,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voidlink_auth::AuthValidator;
use voidlink_proto::{ClientCommand, ControlCommand, Handshake, ProtocolError, MAX_LINE_LEN};
use voidlink_router::RoutingTable;

/// Read one newline-terminated line, refusing to buffer more than
/// [`MAX_LINE_LEN`] bytes of it. Returns the number of bytes read; a
/// non-empty read without a trailing newline means EOF or an oversized
/// line, and the caller drops the connection either way.
async fn read_line_capped<R>(reader: &mut R, line: &mut String) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let mut limited = reader.take(MAX_LINE_LEN as u64);
    limited.read_line(line).await
}

/// Accepts connections on the control port and runs the protocol with each.
///
/// Every inbound connection opens with either `AUTH` (becoming a control
/// channel) or `DATA` (becoming a data channel paired with a pending public
/// connection); anything else is turned away.
pub struct ControlServer {
    clients: Arc<ClientRegistry>,
    tables: Arc<RoutingTable>,
    validator: Arc<dyn AuthValidator>,
    shutdown: CancellationToken,
}

impl ControlServer {
    pub fn new(
        clients: Arc<ClientRegistry>,
        tables: Arc<RoutingTable>,
        validator: Arc<dyn AuthValidator>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            clients,
            tables,
            validator,
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
                            server.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!("Control accept error: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
    }

    async fn handle_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::with_capacity(MAX_LINE_LEN, read_half);
        let mut line = String::new();

        match timeout(CONTROL_HANDSHAKE_TIMEOUT, read_line_capped(&mut reader, &mut line)).await {
            Ok(Ok(n)) if n > 0 && line.ends_with('\n') => {}
            _ => return,
        }

        match Handshake::parse(line.trim()) {
            Ok(Handshake::Auth { token, tunnel_id }) => {
                self.handle_control_channel(reader, write_half, token, tunnel_id, peer)
                    .await;
            }
            Ok(Handshake::Data { conn_id }) => {
                self.handle_data_channel(reader, write_half, conn_id).await;
            }
            Err(ProtocolError::MissingOperand("AUTH")) => {
                let _ = write_half
                    .write_all(ControlCommand::Error("invalid handshake".into()).to_line().as_bytes())
                    .await;
            }
            Err(ProtocolError::Empty) | Err(ProtocolError::MissingOperand(_)) => {}
            Err(_) => {
                let _ = write_half
                    .write_all(ControlCommand::Error("unknown command".into()).to_line().as_bytes())
                    .await;
            }
        }
    }

    /// `AUTH <token> <tunnel_id>`: verify, check registration, replace any
    /// previous client, then serve the control loop until the stream dies.
    async fn handle_control_channel(
        &self,
        reader: BufReader<OwnedReadHalf>,
        mut write_half: OwnedWriteHalf,
        token: String,
        tunnel_id: String,
        peer: SocketAddr,
    ) {
        if let Err(e) = self.validator.validate(&token).await {
            info!(tunnel_id = %tunnel_id, %peer, "Auth failed: {}", e);
            let _ = write_half
                .write_all(ControlCommand::Error("unauthorized".into()).to_line().as_bytes())
                .await;
            return;
        }

        if !self.tables.is_tunnel_registered(&tunnel_id) {
            info!(tunnel_id = %tunnel_id, %peer, "Client for unregistered tunnel rejected");
            let _ = write_half
                .write_all(ControlCommand::Error("tunnel not active".into()).to_line().as_bytes())
                .await;
            return;
        }

        let client = ClientConnection::new(tunnel_id.clone(), write_half);

        if let Some(old) = self.clients.insert_replace(client.clone()) {
            debug!(tunnel_id = %tunnel_id, "Replacing stale client connection");
            old.close();
        }

        if client.send(&ControlCommand::Ok).await.is_err() {
            self.clients.remove_if_same(&tunnel_id, &client);
            return;
        }

        info!(tunnel_id = %tunnel_id, %peer, "Client connected");

        tokio::spawn(keepalive_loop(client.clone(), self.shutdown.clone()));
        self.control_loop(&client, reader).await;

        self.clients.remove_if_same(&tunnel_id, &client);
        client.close();
        info!(tunnel_id = %tunnel_id, "Client disconnected");
    }

    /// Inbound side of a control channel. Lines are handled strictly in
    /// receipt order; garbage is skipped. The per-iteration read deadline
    /// doubles as the keepalive check.
    async fn control_loop(&self, client: &Arc<ClientConnection>, mut reader: BufReader<OwnedReadHalf>) {
        let mut line = String::new();
        loop {
            let read = tokio::select! {
                _ = client.wait_closed() => break,
                _ = self.shutdown.cancelled() => break,
                r = timeout(CONTROL_READ_TIMEOUT, read_line_capped(&mut reader, &mut line)) => r,
            };

            match read {
                Err(_) => {
                    debug!(tunnel_id = %client.tunnel_id(), "Keepalive deadline expired");
                    break;
                }
                Ok(Err(_)) | Ok(Ok(0)) => break,
                Ok(Ok(_)) => {}
            }
            if !line.ends_with('\n') {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match ClientCommand::parse(trimmed) {
                Ok(ClientCommand::Pong) => {}
                Ok(ClientCommand::UdpReply { conn_id, payload }) => {
                    // Replies for unknown peers are dropped.
                    if let Some(session) = self.tables.udp_session(&conn_id) {
                        let _ = session.socket.send_to(&payload, session.peer).await;
                    }
                }
                Err(_) => {}
            }
        }
    }

    /// `DATA <conn_id>`: acknowledge, recover the raw stream (plus any
    /// bytes the client raced ahead with), and deliver it to whichever
    /// client holds the pending rendezvous.
    async fn handle_data_channel(
        &self,
        reader: BufReader<OwnedReadHalf>,
        mut write_half: OwnedWriteHalf,
        conn_id: String,
    ) {
        if write_half
            .write_all(ControlCommand::Ok.to_line().as_bytes())
            .await
            .is_err()
        {
            return;
        }

        let leftover = reader.buffer().to_vec();
        let read_half = reader.into_inner();
        let stream = match read_half.reunite(write_half) {
            Ok(stream) => stream,
            Err(_) => return,
        };

        let Some(client) = self.clients.find_pending(&conn_id) else {
            debug!(conn_id = %conn_id, "No pending connection for data channel");
            return;
        };

        if let Some(slot) = client.take_pending(&conn_id) {
            if slot.send(DataChannel { stream, leftover }).is_err() {
                debug!(conn_id = %conn_id, "Proxy abandoned rendezvous before pairing");
            }
        }
        // Stream is dropped (and the socket closed) when not delivered.
    }
}

/// Emit `PING` every keepalive interval until the client goes away.
async fn keepalive_loop(client: Arc<ClientConnection>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.tick().await; // immediate first tick

    loop {
        tokio::select! {
            _ = client.wait_closed() => break,
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if client.send(&ControlCommand::Ping).await.is_err() {
                    client.close();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn capped_read_stops_at_newline() {
        let mut reader = BufReader::new(Cursor::new(b"PONG\nextra".to_vec()));
        let mut line = String::new();
        let n = read_line_capped(&mut reader, &mut line).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(line, "PONG\n");
    }

    #[tokio::test]
    async fn capped_read_truncates_oversized_lines() {
        let big = vec![b'a'; MAX_LINE_LEN + 100];
        let mut reader = BufReader::new(Cursor::new(big));
        let mut line = String::new();
        let n = read_line_capped(&mut reader, &mut line).await.unwrap();
        assert_eq!(n, MAX_LINE_LEN);
        assert!(!line.ends_with('\n'));
    }
}
