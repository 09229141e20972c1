//! Shared HTTP proxy listener

use crate::HTTP_HEADER_TIMEOUT;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voidlink_control::{open_channel, relay, ClientRegistry, ACCEPT_RETRY_DELAY};
use voidlink_router::{extract_subdomain, RoutingTable};

/// Upper bound on a mirrored request head.
const MAX_HEAD_LEN: usize = 64 * 1024;

/// A request head read off a fresh connection: the mirrored header block,
/// the `Host` value if one was present, and any body prefix that was pulled
/// into the reader along the way.
struct RequestHead {
    stream: TcpStream,
    mirror: Vec<u8>,
    leftover: Vec<u8>,
    host: Option<String>,
}

/// Read header lines until the blank separator, mirroring every byte.
///
/// A read error or EOF mid-head stops the scan without failing; routing
/// then rejects the request if no `Host` was seen.
async fn read_request_head(stream: TcpStream) -> io::Result<RequestHead> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut mirror = Vec::new();
    let mut host = None;
    let mut line = Vec::new();

    loop {
        line.clear();
        let budget = (MAX_HEAD_LEN - mirror.len()) as u64;
        let n = match (&mut reader).take(budget).read_until(b'\n', &mut line).await {
            Ok(n) => n,
            Err(_) => break,
        };
        if n == 0 {
            break;
        }
        mirror.extend_from_slice(&line);
        if !line.ends_with(b"\n") {
            // EOF mid-line, or the head hit its size cap.
            break;
        }

        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            break;
        }
        if host.is_none() {
            if let Some(rest) = strip_header_prefix(trimmed, "host") {
                host = Some(rest.trim().to_string());
            }
        }
    }

    let leftover = reader.buffer().to_vec();
    let read_half = reader.into_inner();
    let stream = read_half
        .reunite(write_half)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    Ok(RequestHead {
        stream,
        mirror,
        leftover,
        host,
    })
}

/// Case-insensitive `Name:` header match, returning the raw value.
fn strip_header_prefix<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    if line.len() <= name.len() || !line.as_bytes()[name.len()..].starts_with(b":") {
        return None;
    }
    if !line[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }
    Some(&line[name.len() + 1..])
}

/// The single public HTTP listener, shared by every tunnel with a web map.
pub struct HttpProxyServer {
    domain: String,
    tables: Arc<RoutingTable>,
    clients: Arc<ClientRegistry>,
    shutdown: CancellationToken,
}

impl HttpProxyServer {
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
                            server.handle_request(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!("HTTP proxy accept error: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
    }

    async fn handle_request(&self, stream: TcpStream, peer: SocketAddr) {
        let head = match timeout(HTTP_HEADER_TIMEOUT, read_request_head(stream)).await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                info!(%peer, "Failed to read request head: {}", e);
                return;
            }
            Err(_) => {
                info!(%peer, "Request head read timed out");
                return;
            }
        };

        let Some(host) = head.host.as_deref() else {
            info!(%peer, "No Host header in request");
            return;
        };

        let Some(subdomain) = extract_subdomain(host, &self.domain) else {
            info!(%peer, host = %host, "Could not extract subdomain from Host");
            return;
        };

        let Some(tunnel_id) = self.tables.tunnel_for_subdomain(&subdomain) else {
            info!(%peer, subdomain = %subdomain, "No tunnel for subdomain");
            return;
        };

        // Registered but without a web map: rejected all the same.
        let Some(local_port) = self.tables.http_local_port(&tunnel_id) else {
            info!(tunnel_id = %tunnel_id, "HTTP not enabled for tunnel");
            return;
        };

        let Some(client) = self.clients.get(&tunnel_id) else {
            info!(tunnel_id = %tunnel_id, "No client connected for tunnel");
            return;
        };

        let mut channel = match open_channel(&client, local_port).await {
            Ok(channel) => channel,
            Err(e) => {
                info!(tunnel_id = %tunnel_id, "Failed to open data channel: {}", e);
                return;
            }
        };

        // Replay the mirrored head, then whatever request body prefix the
        // reader pulled in with it.
        if channel.stream.write_all(&head.mirror).await.is_err() {
            return;
        }
        if !head.leftover.is_empty() && channel.stream.write_all(&head.leftover).await.is_err() {
            return;
        }

        debug!(%peer, tunnel_id = %tunnel_id, subdomain = %subdomain, "Relaying HTTP connection");
        relay(head.stream, channel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn header_prefix_match_is_case_insensitive() {
        assert_eq!(strip_header_prefix("Host: a.example.com", "host"), Some(" a.example.com"));
        assert_eq!(strip_header_prefix("HOST:a", "host"), Some("a"));
        assert_eq!(strip_header_prefix("Host-x: a", "host"), None);
        assert_eq!(strip_header_prefix("X-Host: a", "host"), None);
        assert_eq!(strip_header_prefix("host", "host"), None);
    }

    async fn head_of(request: &[u8]) -> RequestHead {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        client.write_all(request).await.unwrap();
        read_request_head(server).await.unwrap()
    }

    #[tokio::test]
    async fn head_scan_captures_host_and_mirror() {
        let request = b"GET /a HTTP/1.1\r\nHost: map.alpha.eu.example.com:12345\r\nAccept: */*\r\n\r\n";
        let head = head_of(request).await;

        assert_eq!(head.host.as_deref(), Some("map.alpha.eu.example.com:12345"));
        assert_eq!(head.mirror, request.to_vec());
    }

    #[tokio::test]
    async fn body_prefix_lands_in_leftover() {
        let request = b"POST /u HTTP/1.1\r\nHost: a.eu.example.com\r\nContent-Length: 5\r\n\r\nhello";
        let head = head_of(request).await;

        assert_eq!(head.host.as_deref(), Some("a.eu.example.com"));
        let replayed = [head.mirror.clone(), head.leftover.clone()].concat();
        assert_eq!(replayed, request.to_vec());
    }

    #[tokio::test]
    async fn missing_host_header_is_none() {
        let head = head_of(b"GET / HTTP/1.0\r\n\r\n").await;
        assert!(head.host.is_none());
    }
}
