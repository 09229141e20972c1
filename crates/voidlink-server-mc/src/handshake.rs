//! Minecraft Java Edition handshake parsing
//!
//! Wire layout of the packet (unencrypted, first thing a client sends):
//!
//! ```text
//! [PacketLength: VarInt]
//! [PacketId:     VarInt = 0x00]
//! [Protocol:     VarInt]
//! [ServerAddr:   VarInt(len) + UTF-8 bytes]
//! [ServerPort:   u16 big-endian]
//! [NextState:    VarInt (1 = status, 2 = login)]
//! ```
//!
//! Everything read from the socket is mirrored into a buffer, so the bytes
//! that drove the routing decision become the first bytes written to the
//! paired data channel.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Packet length bounds accepted for a handshake.
const MAX_PACKET_LEN: i32 = 32768;

/// A VarInt is at most 5 bytes (35 shift bits).
const MAX_VAR_INT_SHIFT: u32 = 35;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("VarInt too long")]
    VarIntTooLong,

    #[error("bad packet length {0}")]
    BadPacketLength(i32),

    #[error("expected handshake packet id 0x00, got 0x{0:02x}")]
    UnexpectedPacketId(i32),

    #[error("bad server address length {0}")]
    BadAddressLength(i32),

    #[error("server address is not valid UTF-8")]
    InvalidAddress,

    #[error("truncated handshake packet")]
    Truncated,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read the handshake packet, returning the sanitised server address and
/// every byte consumed from the stream, in order.
///
/// The address is truncated at the first NUL byte (BungeeCord/Forge append
/// extra data after one) and any trailing dot is trimmed.
pub async fn parse_handshake<R>(stream: &mut R) -> Result<(String, Vec<u8>), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut mirror = Vec::with_capacity(512);

    let packet_len = read_var_int(stream, &mut mirror).await?;
    if packet_len <= 0 || packet_len > MAX_PACKET_LEN {
        return Err(HandshakeError::BadPacketLength(packet_len));
    }

    let mut body = vec![0u8; packet_len as usize];
    stream.read_exact(&mut body).await?;
    mirror.extend_from_slice(&body);

    let mut pos = 0usize;

    let packet_id = slice_var_int(&body, &mut pos)?;
    if packet_id != 0x00 {
        return Err(HandshakeError::UnexpectedPacketId(packet_id));
    }

    // Protocol version, discarded.
    slice_var_int(&body, &mut pos)?;

    let addr_len = slice_var_int(&body, &mut pos)?;
    if addr_len <= 0 || addr_len > 255 {
        return Err(HandshakeError::BadAddressLength(addr_len));
    }
    let end = pos
        .checked_add(addr_len as usize)
        .filter(|end| *end <= body.len())
        .ok_or(HandshakeError::Truncated)?;
    let addr_bytes = &body[pos..end];

    let mut addr = std::str::from_utf8(addr_bytes)
        .map_err(|_| HandshakeError::InvalidAddress)?
        .to_string();

    if let Some(nul) = addr.find('\0') {
        addr.truncate(nul);
    }
    if addr.ends_with('.') {
        addr.pop();
    }

    Ok((addr, mirror))
}

/// Read a VarInt off the stream, mirroring the consumed bytes.
async fn read_var_int<R>(stream: &mut R, mirror: &mut Vec<u8>) -> Result<i32, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut result: i32 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = stream.read_u8().await?;
        mirror.push(byte);
        result |= ((byte & 0x7f) as i32) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= MAX_VAR_INT_SHIFT {
            return Err(HandshakeError::VarIntTooLong);
        }
    }
}

/// Decode a VarInt from an already-read packet body.
fn slice_var_int(buf: &[u8], pos: &mut usize) -> Result<i32, HandshakeError> {
    let mut result: i32 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = *buf.get(*pos).ok_or(HandshakeError::Truncated)?;
        *pos += 1;
        result |= ((byte & 0x7f) as i32) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= MAX_VAR_INT_SHIFT {
            return Err(HandshakeError::VarIntTooLong);
        }
    }
}

/// Build a handshake packet. Test helper for the proxies' own suites and
/// the end-to-end harness.
pub fn encode_handshake(protocol: i32, server_addr: &str, port: u16, next_state: i32) -> Vec<u8> {
    fn push_var_int(out: &mut Vec<u8>, mut value: u32) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    let mut body = Vec::new();
    push_var_int(&mut body, 0x00); // packet id
    push_var_int(&mut body, protocol as u32);
    push_var_int(&mut body, server_addr.len() as u32);
    body.extend_from_slice(server_addr.as_bytes());
    body.extend_from_slice(&port.to_be_bytes());
    push_var_int(&mut body, next_state as u32);

    let mut packet = Vec::new();
    push_var_int(&mut packet, body.len() as u32);
    packet.extend_from_slice(&body);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn parse(bytes: Vec<u8>) -> Result<(String, Vec<u8>), HandshakeError> {
        let mut cursor = Cursor::new(bytes);
        parse_handshake(&mut cursor).await
    }

    #[tokio::test]
    async fn parses_and_mirrors_a_valid_handshake() {
        let packet = encode_handshake(767, "happy-cat.eu.example.com", 25565, 2);
        let (addr, mirror) = parse(packet.clone()).await.unwrap();

        assert_eq!(addr, "happy-cat.eu.example.com");
        assert_eq!(mirror, packet);
    }

    #[tokio::test]
    async fn bungeecord_nul_suffix_is_stripped() {
        let packet = encode_handshake(767, "alpha.eu.example.com\0127.0.0.1\0uuid", 25565, 2);
        let (addr, _) = parse(packet).await.unwrap();
        assert_eq!(addr, "alpha.eu.example.com");
    }

    #[tokio::test]
    async fn trailing_dot_is_trimmed() {
        let packet = encode_handshake(767, "alpha.eu.example.com.", 25565, 1);
        let (addr, _) = parse(packet).await.unwrap();
        assert_eq!(addr, "alpha.eu.example.com");
    }

    #[tokio::test]
    async fn zero_packet_length_is_rejected() {
        let err = parse(vec![0x00]).await.unwrap_err();
        assert!(matches!(err, HandshakeError::BadPacketLength(0)));
    }

    #[tokio::test]
    async fn oversized_packet_length_is_rejected() {
        // VarInt 0x8000_0 = 1048576, way over the 32768 cap.
        let err = parse(vec![0x80, 0x80, 0x40]).await.unwrap_err();
        assert!(matches!(err, HandshakeError::BadPacketLength(_)));
    }

    #[tokio::test]
    async fn var_int_longer_than_five_bytes_is_rejected() {
        let err = parse(vec![0xff, 0xff, 0xff, 0xff, 0xff, 0x01]).await.unwrap_err();
        assert!(matches!(err, HandshakeError::VarIntTooLong));
    }

    #[tokio::test]
    async fn wrong_packet_id_is_rejected() {
        // Length 1, packet id 0x01 (ping rather than handshake).
        let err = parse(vec![0x01, 0x01]).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedPacketId(0x01)));
    }

    #[tokio::test]
    async fn empty_server_address_is_rejected() {
        // id 0x00, protocol 0, addr length 0.
        let err = parse(vec![0x03, 0x00, 0x00, 0x00]).await.unwrap_err();
        assert!(matches!(err, HandshakeError::BadAddressLength(0)));
    }

    #[tokio::test]
    async fn address_length_over_255_is_rejected() {
        // id 0x00, protocol 0, addr length 300 (0xac 0x02).
        let err = parse(vec![0x04, 0x00, 0x00, 0xac, 0x02]).await.unwrap_err();
        assert!(matches!(err, HandshakeError::BadAddressLength(300)));
    }

    #[tokio::test]
    async fn address_longer_than_body_is_truncated_error() {
        // id 0x00, protocol 0, addr length 5, but only 2 bytes follow.
        let err = parse(vec![0x05, 0x00, 0x00, 0x05, b'a', b'b']).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Truncated));
    }

    #[tokio::test]
    async fn truncated_stream_is_io_error() {
        // Claims 10 bytes of body, delivers 2.
        let err = parse(vec![0x0a, 0x00, 0x00]).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Io(_)));
    }
}
