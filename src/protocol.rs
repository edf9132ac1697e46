//! Control-plane wire protocol.
//!
//! Every administrative exchange is one fixed-size request record answered
//! by one fixed-size response record, after which the connection is closed.
//! Both sides encode integers in host byte order; the protocol only ever
//! crosses a local unix socket, never a machine boundary. String fields are
//! fixed-width and NUL padded so the records always have the same length
//! and a reader can frame them with a single exact-length read.

use bytes::{Buf, BufMut, BytesMut};

/// Upper bound on the entries one response can carry. Connections beyond
/// this count keep relaying but are invisible to the control plane.
pub const MAX_CONNECTIONS: usize = 100;

/// Fixed width of an address field: 63 usable bytes plus a terminator.
pub const ADDR_LEN: usize = 64;

/// Fixed width of the diagnostic message field: 255 usable bytes plus a
/// terminator.
pub const MESSAGE_LEN: usize = 256;

/// Encoded size of one [`ConnectionInfo`] entry.
pub const ENTRY_SIZE: usize = 4 + ADDR_LEN + 4 + ADDR_LEN + 4 + 8 * 4;

/// Encoded size of a [`ControlRequest`].
pub const REQUEST_SIZE: usize = 12;

/// Encoded size of a [`ControlResponse`]. Responses are always emitted at
/// full size with unused entry slots zeroed.
pub const RESPONSE_SIZE: usize = 8 + MAX_CONNECTIONS * ENTRY_SIZE + MESSAGE_LEN;

// Signal numbers carried on the wire. The values match the usual POSIX
// numbering so the operator surface reads like kill(1).
pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGKILL: i32 = 9;
pub const SIGUSR1: i32 = 10;
pub const SIGUSR2: i32 = 12;
pub const SIGTERM: i32 = 15;
pub const SIGCONT: i32 = 18;
pub const SIGSTOP: i32 = 19;

/// Map a signal name to its number.
///
/// Accepts the supported subset of names with or without a `SIG` prefix in
/// any case, or a raw number in 1-31.
pub fn signal_from_name(name: &str) -> Option<i32> {
    let upper = name.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    match bare {
        "TERM" => Some(SIGTERM),
        "KILL" => Some(SIGKILL),
        "STOP" => Some(SIGSTOP),
        "CONT" => Some(SIGCONT),
        "HUP" => Some(SIGHUP),
        "USR1" => Some(SIGUSR1),
        "USR2" => Some(SIGUSR2),
        _ => match bare.parse::<i32>() {
            Ok(num) if (1..32).contains(&num) => Some(num),
            _ => None,
        },
    }
}

/// The operations the control plane understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Enumerate live connections.
    List,
    /// Terminate one connection handler.
    Kill,
    /// Deliver an arbitrary signal to one connection handler.
    Signal,
    /// Fetch the per-connection byte counters.
    Stats,
    /// Shut the whole proxy down.
    Shutdown,
    /// A tag this build does not recognize. Kept so the server can answer
    /// with a diagnostic instead of tearing the connection down.
    Unknown(u32),
}

impl ControlCommand {
    fn from_tag(tag: u32) -> ControlCommand {
        match tag {
            0 => ControlCommand::List,
            1 => ControlCommand::Kill,
            2 => ControlCommand::Signal,
            3 => ControlCommand::Stats,
            4 => ControlCommand::Shutdown,
            other => ControlCommand::Unknown(other),
        }
    }

    fn tag(self) -> u32 {
        match self {
            ControlCommand::List => 0,
            ControlCommand::Kill => 1,
            ControlCommand::Signal => 2,
            ControlCommand::Stats => 3,
            ControlCommand::Shutdown => 4,
            ControlCommand::Unknown(other) => other,
        }
    }
}

/// One administrative request.
///
/// `target_id` and `signal` are only meaningful for `Kill` and `Signal`;
/// other commands carry them as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub command: ControlCommand,
    pub target_id: u32,
    pub signal: i32,
}

impl ControlRequest {
    /// Request with no target, for `List`, `Stats` and `Shutdown`.
    pub fn bare(command: ControlCommand) -> ControlRequest {
        ControlRequest {
            command,
            target_id: 0,
            signal: 0,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(REQUEST_SIZE);
        dst.put_u32_ne(self.command.tag());
        dst.put_u32_ne(self.target_id);
        dst.put_i32_ne(self.signal);
    }

    pub fn decode(mut src: &[u8]) -> crate::Result<ControlRequest> {
        if src.len() < REQUEST_SIZE {
            return Err(format!("short control request: {} bytes", src.len()).into());
        }
        Ok(ControlRequest {
            command: ControlCommand::from_tag(src.get_u32_ne()),
            target_id: src.get_u32_ne(),
            signal: src.get_i32_ne(),
        })
    }
}

/// One live connection as reported to the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u32,
    pub client_addr: String,
    pub client_port: u16,
    pub target_addr: String,
    pub target_port: u16,
    pub client_to_server_bytes: u64,
    pub server_to_client_bytes: u64,
    pub start_time: u64,
    pub last_activity: u64,
}

impl ConnectionInfo {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_ne(self.id);
        put_field(dst, &self.client_addr, ADDR_LEN);
        dst.put_u32_ne(u32::from(self.client_port));
        put_field(dst, &self.target_addr, ADDR_LEN);
        dst.put_u32_ne(u32::from(self.target_port));
        dst.put_u64_ne(self.client_to_server_bytes);
        dst.put_u64_ne(self.server_to_client_bytes);
        dst.put_u64_ne(self.start_time);
        dst.put_u64_ne(self.last_activity);
    }

    fn decode(src: &mut &[u8]) -> ConnectionInfo {
        ConnectionInfo {
            id: src.get_u32_ne(),
            client_addr: get_field(src, ADDR_LEN),
            client_port: src.get_u32_ne() as u16,
            target_addr: get_field(src, ADDR_LEN),
            target_port: src.get_u32_ne() as u16,
            client_to_server_bytes: src.get_u64_ne(),
            server_to_client_bytes: src.get_u64_ne(),
            start_time: src.get_u64_ne(),
            last_activity: src.get_u64_ne(),
        }
    }
}

/// One administrative response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlResponse {
    pub success: bool,
    pub connections: Vec<ConnectionInfo>,
    pub message: String,
}

impl ControlResponse {
    /// A failure response carrying only a diagnostic.
    pub fn failure(message: impl Into<String>) -> ControlResponse {
        ControlResponse {
            success: false,
            connections: Vec::new(),
            message: message.into(),
        }
    }

    /// A success response carrying only a diagnostic.
    pub fn ok(message: impl Into<String>) -> ControlResponse {
        ControlResponse {
            success: true,
            connections: Vec::new(),
            message: message.into(),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(RESPONSE_SIZE);
        dst.put_u32_ne(u32::from(self.success));

        let count = self.connections.len().min(MAX_CONNECTIONS);
        dst.put_u32_ne(count as u32);
        for info in &self.connections[..count] {
            info.encode(dst);
        }
        dst.put_bytes(0, (MAX_CONNECTIONS - count) * ENTRY_SIZE);

        put_field(dst, &self.message, MESSAGE_LEN);
    }

    pub fn decode(mut src: &[u8]) -> crate::Result<ControlResponse> {
        if src.len() < RESPONSE_SIZE {
            return Err(format!("short control response: {} bytes", src.len()).into());
        }

        let success = src.get_u32_ne() != 0;
        let count = src.get_u32_ne() as usize;
        if count > MAX_CONNECTIONS {
            return Err(format!("control response advertises {} entries", count).into());
        }

        let mut connections = Vec::with_capacity(count);
        for _ in 0..count {
            connections.push(ConnectionInfo::decode(&mut src));
        }
        src.advance((MAX_CONNECTIONS - count) * ENTRY_SIZE);

        let message = get_field(&mut src, MESSAGE_LEN);

        Ok(ControlResponse {
            success,
            connections,
            message,
        })
    }
}

/// Write `value` into a fixed-width NUL-padded field, truncating to
/// `width - 1` bytes so the field always terminates.
fn put_field(dst: &mut BytesMut, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(width - 1);
    dst.put_slice(&bytes[..len]);
    dst.put_bytes(0, width - len);
}

/// Read a fixed-width NUL-padded field back into a `String`.
fn get_field(src: &mut &[u8], width: usize) -> String {
    let end = src[..width].iter().position(|&b| b == 0).unwrap_or(width);
    let value = String::from_utf8_lossy(&src[..end]).into_owned();
    src.advance(width);
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(id: u32) -> ConnectionInfo {
        ConnectionInfo {
            id,
            client_addr: "192.0.2.17".to_string(),
            client_port: 49152,
            target_addr: "198.51.100.4".to_string(),
            target_port: 8080,
            client_to_server_bytes: 1024,
            server_to_client_bytes: 4096,
            start_time: 1_700_000_000,
            last_activity: 1_700_000_042,
        }
    }

    #[test]
    fn request_round_trip() {
        let request = ControlRequest {
            command: ControlCommand::Signal,
            target_id: 42,
            signal: SIGSTOP,
        };

        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        assert_eq!(buf.len(), REQUEST_SIZE);

        assert_eq!(ControlRequest::decode(&buf[..]).unwrap(), request);
    }

    #[test]
    fn short_request_is_rejected() {
        assert!(ControlRequest::decode(&[0u8; REQUEST_SIZE - 1]).is_err());
    }

    #[test]
    fn unknown_tags_survive_decoding() {
        let request = ControlRequest::bare(ControlCommand::Unknown(99));

        let mut buf = BytesMut::new();
        request.encode(&mut buf);

        let decoded = ControlRequest::decode(&buf[..]).unwrap();
        assert_eq!(decoded.command, ControlCommand::Unknown(99));
    }

    #[test]
    fn response_round_trip() {
        let response = ControlResponse {
            success: true,
            connections: vec![sample_info(1), sample_info(2)],
            message: "2 active connections".to_string(),
        };

        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        assert_eq!(buf.len(), RESPONSE_SIZE);

        let decoded = ControlResponse::decode(&buf[..]).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn empty_response_round_trip() {
        let response = ControlResponse::failure("handler 7 not found");

        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        assert_eq!(buf.len(), RESPONSE_SIZE);

        let decoded = ControlResponse::decode(&buf[..]).unwrap();
        assert!(!decoded.success);
        assert!(decoded.connections.is_empty());
        assert_eq!(decoded.message, "handler 7 not found");
    }

    #[test]
    fn oversized_strings_are_truncated() {
        let mut info = sample_info(3);
        info.client_addr = "a".repeat(ADDR_LEN * 2);

        let response = ControlResponse {
            success: true,
            connections: vec![info],
            message: "m".repeat(MESSAGE_LEN * 2),
        };

        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        assert_eq!(buf.len(), RESPONSE_SIZE);

        let decoded = ControlResponse::decode(&buf[..]).unwrap();
        assert_eq!(decoded.connections[0].client_addr.len(), ADDR_LEN - 1);
        assert_eq!(decoded.message.len(), MESSAGE_LEN - 1);
    }

    #[test]
    fn corrupt_entry_count_is_rejected() {
        let mut buf = BytesMut::new();
        ControlResponse::ok("fine").encode(&mut buf);
        // overwrite the count field with something impossible
        buf[4..8].copy_from_slice(&(MAX_CONNECTIONS as u32 + 1).to_ne_bytes());

        assert!(ControlResponse::decode(&buf[..]).is_err());
    }

    #[test]
    fn signal_names() {
        assert_eq!(signal_from_name("TERM"), Some(SIGTERM));
        assert_eq!(signal_from_name("sigkill"), Some(SIGKILL));
        assert_eq!(signal_from_name("Stop"), Some(SIGSTOP));
        assert_eq!(signal_from_name("SIGUSR1"), Some(SIGUSR1));
        assert_eq!(signal_from_name("9"), Some(9));
        assert_eq!(signal_from_name("31"), Some(31));

        assert_eq!(signal_from_name("0"), None);
        assert_eq!(signal_from_name("32"), None);
        assert_eq!(signal_from_name("WINCH"), None);
        assert_eq!(signal_from_name(""), None);
    }
}
