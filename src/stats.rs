//! Per-connection transfer statistics.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// The two directions a relayed segment can travel in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "client->server"),
            Direction::ServerToClient => write!(f, "server->client"),
        }
    }
}

/// Counters for one proxied connection, split by direction.
///
/// A handler owns its stats exclusively and is the only writer; the shared
/// registry receives copies of the byte counters after each forwarded
/// segment. All counters only ever grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub client_to_server_bytes: u64,
    pub client_to_server_packets: u64,
    pub client_to_server_dropped: u64,

    pub server_to_client_bytes: u64,
    pub server_to_client_packets: u64,
    pub server_to_client_dropped: u64,

    /// When the connection was accepted, unix seconds.
    pub start_time: u64,

    /// When a segment was last received in either direction, unix seconds.
    /// Never precedes `start_time`.
    pub last_activity: u64,
}

impl ConnectionStats {
    /// Fresh zeroed counters with both timestamps set to now.
    pub fn new() -> ConnectionStats {
        let now = unix_now();
        ConnectionStats {
            start_time: now,
            last_activity: now,
            ..ConnectionStats::default()
        }
    }

    /// Record activity on the connection.
    pub fn touch(&mut self) {
        self.last_activity = unix_now();
    }

    /// Record a fully forwarded segment of `len` bytes.
    pub fn record_forwarded(&mut self, direction: Direction, len: usize) {
        match direction {
            Direction::ClientToServer => {
                self.client_to_server_bytes += len as u64;
                self.client_to_server_packets += 1;
            }
            Direction::ServerToClient => {
                self.server_to_client_bytes += len as u64;
                self.server_to_client_packets += 1;
            }
        }
    }

    /// Record a segment the filter chain discarded.
    pub fn record_dropped(&mut self, direction: Direction) {
        match direction {
            Direction::ClientToServer => self.client_to_server_dropped += 1,
            Direction::ServerToClient => self.server_to_client_dropped += 1,
        }
    }

    /// Seconds the connection has been open.
    pub fn duration_secs(&self) -> u64 {
        unix_now().saturating_sub(self.start_time)
    }
}

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
