//! The bidirectional relay at the heart of every connection handler.
//!
//! A `Relay` owns the client socket, the upstream socket, a private copy of
//! the filter chain and the connection's statistics. It forwards segments
//! in both directions until a peer closes, a socket fails, the connection
//! idles out, or the operator terminates it.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::filter::{FilterChain, Verdict};
use crate::protocol::{self, ConnectionInfo};
use crate::registry::ConnectionRegistry;
use crate::stats::{ConnectionStats, Direction};
use crate::Shutdown;

/// Size of the receive buffer used in each direction. One receive of up to
/// this many bytes is the unit the filter chain sees.
pub const BUFFER_SIZE: usize = 8192;

/// A connection with no traffic in either direction for this long is torn
/// down.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// State for relaying one client/upstream socket pair.
///
/// The relay is the sole owner of both sockets; dropping it performs the
/// TCP teardown on both sides.
#[derive(Debug)]
pub(crate) struct Relay {
    id: u32,
    client: TcpStream,
    client_addr: SocketAddr,
    upstream: TcpStream,
    target_addr: SocketAddr,
    filters: FilterChain,
    stats: ConnectionStats,

    /// Set while the operator has the handler stopped. A paused relay
    /// leaves incoming data in the kernel buffers so TCP backpressure
    /// reaches the peers.
    paused: bool,

    /// Cleared once the signal channel reports closed, so the select loop
    /// stops polling it.
    signals_open: bool,
}

impl Relay {
    pub(crate) fn new(
        id: u32,
        client: TcpStream,
        client_addr: SocketAddr,
        upstream: TcpStream,
        target_addr: SocketAddr,
        filters: FilterChain,
    ) -> Relay {
        Relay {
            id,
            client,
            client_addr,
            upstream,
            target_addr,
            filters,
            stats: ConnectionStats::new(),
            paused: false,
            signals_open: true,
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// The registry entry describing this relay before any traffic flows.
    pub(crate) fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            client_addr: self.client_addr.ip().to_string(),
            client_port: self.client_addr.port(),
            target_addr: self.target_addr.ip().to_string(),
            target_port: self.target_addr.port(),
            client_to_server_bytes: 0,
            server_to_client_bytes: 0,
            start_time: self.stats.start_time,
            last_activity: self.stats.last_activity,
        }
    }

    /// Relay until the connection is over.
    ///
    /// Every pass waits for one of: data on either socket, the inactivity
    /// deadline, an operator signal, or the server-wide shutdown broadcast.
    /// Whichever direction becomes readable is received, filtered and
    /// forwarded before the next wait; the other direction stays readable
    /// and wins one of the following passes.
    pub(crate) async fn run(
        &mut self,
        registry: &ConnectionRegistry,
        shutdown: &mut Shutdown,
        signals: &mut mpsc::UnboundedReceiver<i32>,
    ) {
        let mut client_buf = vec![0u8; BUFFER_SIZE];
        let mut upstream_buf = vec![0u8; BUFFER_SIZE];
        let mut deadline = Instant::now() + IDLE_TIMEOUT;

        while !shutdown.is_shutdown() {
            if self.paused {
                // Only the operator or a server shutdown can wake a
                // stopped handler.
                tokio::select! {
                    signal = signals.recv(), if self.signals_open => {
                        if !self.handle_signal(signal) {
                            break;
                        }
                        if !self.paused {
                            deadline = Instant::now() + IDLE_TIMEOUT;
                        }
                    }
                    _ = shutdown.recv() => break,
                }
                continue;
            }

            tokio::select! {
                result = self.client.read(&mut client_buf) => {
                    if !self.forward(Direction::ClientToServer, result, &client_buf, registry).await {
                        break;
                    }
                    deadline = Instant::now() + IDLE_TIMEOUT;
                }
                result = self.upstream.read(&mut upstream_buf) => {
                    if !self.forward(Direction::ServerToClient, result, &upstream_buf, registry).await {
                        break;
                    }
                    deadline = Instant::now() + IDLE_TIMEOUT;
                }
                _ = time::sleep_until(deadline) => {
                    warn!(
                        id = self.id,
                        idle_secs = IDLE_TIMEOUT.as_secs(),
                        "connection idle, closing"
                    );
                    break;
                }
                signal = signals.recv(), if self.signals_open => {
                    if !self.handle_signal(signal) {
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        self.log_final_stats();
    }

    /// Push one received segment through the filter chain and on to the
    /// opposite socket. Returns `false` when the relay should stop.
    async fn forward(
        &mut self,
        direction: Direction,
        received: io::Result<usize>,
        buf: &[u8],
        registry: &ConnectionRegistry,
    ) -> bool {
        let len = match received {
            Ok(0) => {
                info!(id = self.id, %direction, "peer closed connection");
                return false;
            }
            Ok(len) => len,
            Err(err) => {
                error!(id = self.id, %direction, cause = %err, "receive failed");
                return false;
            }
        };

        self.stats.touch();

        if self.filters.apply(len).await == Verdict::Drop {
            self.stats.record_dropped(direction);
            debug!(id = self.id, %direction, len, "segment discarded by filter");
            return true;
        }

        // write_all keeps resubmitting on partial writes and transient
        // would-block conditions until every byte is out or the socket
        // reports a hard error.
        let destination = match direction {
            Direction::ClientToServer => &mut self.upstream,
            Direction::ServerToClient => &mut self.client,
        };
        if let Err(err) = destination.write_all(&buf[..len]).await {
            error!(id = self.id, %direction, cause = %err, "send failed");
            return false;
        }

        self.stats.record_forwarded(direction, len);
        registry.update_stats(self.id, &self.stats);
        debug!(id = self.id, %direction, len, "segment forwarded");
        true
    }

    /// React to an operator signal. Returns `false` when the relay should
    /// stop.
    fn handle_signal(&mut self, signal: Option<i32>) -> bool {
        let signal = match signal {
            Some(signal) => signal,
            None => {
                // Channel closed; keep relaying without operator control.
                self.signals_open = false;
                return true;
            }
        };

        match signal {
            protocol::SIGTERM | protocol::SIGKILL | protocol::SIGINT | protocol::SIGQUIT => {
                info!(id = self.id, signal, "terminated by operator");
                false
            }
            protocol::SIGSTOP => {
                info!(id = self.id, "relay paused");
                self.paused = true;
                true
            }
            protocol::SIGCONT => {
                if self.paused {
                    info!(id = self.id, "relay resumed");
                }
                self.paused = false;
                true
            }
            other => {
                debug!(id = self.id, signal = other, "ignoring signal");
                true
            }
        }
    }

    fn log_final_stats(&self) {
        let duration = self.stats.duration_secs();
        info!(
            id = self.id,
            duration_secs = duration,
            c2s_bytes = self.stats.client_to_server_bytes,
            c2s_packets = self.stats.client_to_server_packets,
            c2s_dropped = self.stats.client_to_server_dropped,
            s2c_bytes = self.stats.server_to_client_bytes,
            s2c_packets = self.stats.server_to_client_packets,
            s2c_dropped = self.stats.server_to_client_dropped,
            "connection closed"
        );
        if duration > 0 {
            debug!(
                id = self.id,
                c2s_kb_per_sec =
                    self.stats.client_to_server_bytes as f64 / duration as f64 / 1024.0,
                s2c_kb_per_sec =
                    self.stats.server_to_client_bytes as f64 / duration as f64 / 1024.0,
                "average transfer rates"
            );
        }
    }
}
