//! Command types and the line codec

use thiserror::Error;

/// Protocol parse errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty line")]
    Empty,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("missing operand for {0}")]
    MissingOperand(&'static str),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid hex payload")]
    InvalidPayload(#[from] hex::FromHexError),
}

/// First line of any inbound connection on the control port.
///
/// `AUTH` turns the stream into a control channel; `DATA` turns it into a
/// data channel paired with a pending public connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Auth { token: String, tunnel_id: String },
    Data { conn_id: String },
}

impl Handshake {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.split_whitespace();
        match parts.next() {
            None => Err(ProtocolError::Empty),
            Some("AUTH") => {
                let token = parts.next().ok_or(ProtocolError::MissingOperand("AUTH"))?;
                let tunnel_id = parts.next().ok_or(ProtocolError::MissingOperand("AUTH"))?;
                Ok(Handshake::Auth {
                    token: token.to_string(),
                    tunnel_id: tunnel_id.to_string(),
                })
            }
            Some("DATA") => {
                let conn_id = parts.next().ok_or(ProtocolError::MissingOperand("DATA"))?;
                Ok(Handshake::Data {
                    conn_id: conn_id.to_string(),
                })
            }
            Some(other) => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// Commands the server writes on an established control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Handshake accepted.
    Ok,
    /// Handshake rejected; the stream is closed right after.
    Error(String),
    /// Keepalive; the client answers `PONG`.
    Ping,
    /// A public TCP connection arrived. The client opens a fresh TCP
    /// connection to the control port and sends `DATA <conn_id>`.
    Open { conn_id: String, local_port: u16 },
    /// A UDP datagram arrived on the tunnel's public port.
    UdpPacket {
        conn_id: String,
        local_port: u16,
        payload: Vec<u8>,
    },
}

impl ControlCommand {
    /// Render as a single newline-terminated line.
    pub fn to_line(&self) -> String {
        match self {
            ControlCommand::Ok => "OK\n".to_string(),
            ControlCommand::Error(reason) => format!("ERROR {reason}\n"),
            ControlCommand::Ping => "PING\n".to_string(),
            ControlCommand::Open { conn_id, local_port } => {
                format!("OPEN {conn_id} {local_port}\n")
            }
            ControlCommand::UdpPacket {
                conn_id,
                local_port,
                payload,
            } => format!("UDP_PKT {conn_id} {local_port} {}\n", hex::encode(payload)),
        }
    }

    /// Parse a server line. Used by client implementations and test drivers.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.split_whitespace();
        match parts.next() {
            None => Err(ProtocolError::Empty),
            Some("OK") => Ok(ControlCommand::Ok),
            Some("ERROR") => {
                let rest = line.trim_start();
                let reason = rest.strip_prefix("ERROR").unwrap_or("").trim();
                Ok(ControlCommand::Error(reason.to_string()))
            }
            Some("PING") => Ok(ControlCommand::Ping),
            Some("OPEN") => {
                let conn_id = parts.next().ok_or(ProtocolError::MissingOperand("OPEN"))?;
                let port = parts.next().ok_or(ProtocolError::MissingOperand("OPEN"))?;
                let local_port = port
                    .parse()
                    .map_err(|_| ProtocolError::InvalidPort(port.to_string()))?;
                Ok(ControlCommand::Open {
                    conn_id: conn_id.to_string(),
                    local_port,
                })
            }
            Some("UDP_PKT") => {
                let conn_id = parts.next().ok_or(ProtocolError::MissingOperand("UDP_PKT"))?;
                let port = parts.next().ok_or(ProtocolError::MissingOperand("UDP_PKT"))?;
                let local_port = port
                    .parse()
                    .map_err(|_| ProtocolError::InvalidPort(port.to_string()))?;
                let payload = parts.next().ok_or(ProtocolError::MissingOperand("UDP_PKT"))?;
                Ok(ControlCommand::UdpPacket {
                    conn_id: conn_id.to_string(),
                    local_port,
                    payload: hex::decode(payload)?,
                })
            }
            Some(other) => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// Commands a client writes on an established control channel.
///
/// Unknown or malformed lines are not fatal; the server's read loop skips
/// them and relies on the keepalive deadline to shed dead peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Keepalive reply.
    Pong,
    /// A reply datagram to forward back to the public peer.
    UdpReply { conn_id: String, payload: Vec<u8> },
}

impl ClientCommand {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.split_whitespace();
        match parts.next() {
            None => Err(ProtocolError::Empty),
            Some("PONG") => Ok(ClientCommand::Pong),
            Some("UDP_REPLY") => {
                let conn_id = parts
                    .next()
                    .ok_or(ProtocolError::MissingOperand("UDP_REPLY"))?;
                let payload = parts
                    .next()
                    .ok_or(ProtocolError::MissingOperand("UDP_REPLY"))?;
                Ok(ClientCommand::UdpReply {
                    conn_id: conn_id.to_string(),
                    payload: hex::decode(payload)?,
                })
            }
            Some(other) => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Render as a single newline-terminated line.
    pub fn to_line(&self) -> String {
        match self {
            ClientCommand::Pong => "PONG\n".to_string(),
            ClientCommand::UdpReply { conn_id, payload } => {
                format!("UDP_REPLY {conn_id} {}\n", hex::encode(payload))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_auth_handshake() {
        let hs = Handshake::parse("AUTH eyJhbGci.token.sig tunnel-1").unwrap();
        assert_eq!(
            hs,
            Handshake::Auth {
                token: "eyJhbGci.token.sig".to_string(),
                tunnel_id: "tunnel-1".to_string(),
            }
        );
    }

    #[test]
    fn parse_data_handshake() {
        let hs = Handshake::parse("DATA a1b2c3d4e5f60718").unwrap();
        assert_eq!(
            hs,
            Handshake::Data {
                conn_id: "a1b2c3d4e5f60718".to_string(),
            }
        );
    }

    #[test]
    fn auth_without_tunnel_id_is_malformed() {
        assert!(matches!(
            Handshake::parse("AUTH token-only"),
            Err(ProtocolError::MissingOperand("AUTH"))
        ));
    }

    #[test]
    fn data_without_conn_id_is_malformed() {
        assert!(matches!(
            Handshake::parse("DATA"),
            Err(ProtocolError::MissingOperand("DATA"))
        ));
    }

    #[test]
    fn unknown_first_command_is_rejected() {
        assert!(matches!(
            Handshake::parse("GET / HTTP/1.1"),
            Err(ProtocolError::UnknownCommand(_))
        ));
    }

    #[test]
    fn blank_handshake_is_rejected() {
        assert!(matches!(Handshake::parse("   "), Err(ProtocolError::Empty)));
    }

    #[test]
    fn udp_reply_decodes_hex() {
        let cmd = ClientCommand::parse("UDP_REPLY 127.0.0.1:54321 cafebabe").unwrap();
        assert_eq!(
            cmd,
            ClientCommand::UdpReply {
                conn_id: "127.0.0.1:54321".to_string(),
                payload: vec![0xca, 0xfe, 0xba, 0xbe],
            }
        );
    }

    #[test]
    fn udp_reply_with_bad_hex_is_an_error() {
        assert!(matches!(
            ClientCommand::parse("UDP_REPLY peer zz"),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }

    #[test]
    fn client_garbage_is_nonfatal_error() {
        // The control loop ignores these rather than dropping the client.
        assert!(ClientCommand::parse("HELLO").is_err());
        assert!(ClientCommand::parse("").is_err());
        assert!(ClientCommand::parse("UDP_REPLY onlyone").is_err());
    }

    #[test]
    fn open_renders_single_line() {
        let line = ControlCommand::Open {
            conn_id: "00ff00ff00ff00ff".to_string(),
            local_port: 25565,
        }
        .to_line();
        assert_eq!(line, "OPEN 00ff00ff00ff00ff 25565\n");
    }

    #[test]
    fn udp_packet_encodes_hex_payload() {
        let line = ControlCommand::UdpPacket {
            conn_id: "10.0.0.9:4242".to_string(),
            local_port: 24454,
            payload: vec![0xde, 0xad, 0xbe, 0xef],
        }
        .to_line();
        assert_eq!(line, "UDP_PKT 10.0.0.9:4242 24454 deadbeef\n");
    }

    #[test]
    fn error_parse_keeps_full_reason() {
        let cmd = ControlCommand::parse("ERROR tunnel not active").unwrap();
        assert_eq!(cmd, ControlCommand::Error("tunnel not active".to_string()));
    }
}
