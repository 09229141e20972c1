//! Control protocol between the relay and VoidLink desktop clients
//!
//! All control messages are newline-terminated ASCII lines with
//! whitespace-separated fields. Binary payloads (UDP datagrams) travel
//! hex-encoded. Data channels carry raw bytes after their initial
//! `DATA <conn_id>` handshake line; everything else is framed on the
//! control channel only.

pub mod command;

pub use command::{ClientCommand, ControlCommand, Handshake, ProtocolError};

/// Upper bound on a single control line. The server never emits longer
/// lines; readers size their buffers to this.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Generate a fresh connection id for a TCP data-channel pairing:
/// 16 lower-case hex characters.
pub fn generate_conn_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_ids_are_16_hex_chars() {
        let id = generate_conn_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
