//! Minimal client for the administrative wire protocol. Used by the
//! operator tool and by integration tests to drive a running proxy.

use std::path::PathBuf;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use crate::protocol::{ControlCommand, ControlRequest, ControlResponse, RESPONSE_SIZE};

/// Handle on a proxy's control socket.
///
/// The server answers exactly one request per connection, so every call
/// dials the socket afresh. That keeps the client stateless; holding one
/// across calls is purely a convenience.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    /// Create a client for the control socket at `socket_path`. No
    /// connection is made until the first command.
    pub fn new(socket_path: impl Into<PathBuf>) -> ControlClient {
        ControlClient {
            socket_path: socket_path.into(),
        }
    }

    /// Enumerate live connections.
    pub async fn list(&self) -> crate::Result<ControlResponse> {
        self.roundtrip(ControlRequest::bare(ControlCommand::List))
            .await
    }

    /// Fetch per-connection byte counters.
    pub async fn stats(&self) -> crate::Result<ControlResponse> {
        self.roundtrip(ControlRequest::bare(ControlCommand::Stats))
            .await
    }

    /// Terminate the handler with the given id.
    pub async fn kill(&self, id: u32) -> crate::Result<ControlResponse> {
        self.roundtrip(ControlRequest {
            command: ControlCommand::Kill,
            target_id: id,
            signal: 0,
        })
        .await
    }

    /// Deliver `signal` to the handler with the given id.
    pub async fn signal(&self, id: u32, signal: i32) -> crate::Result<ControlResponse> {
        self.roundtrip(ControlRequest {
            command: ControlCommand::Signal,
            target_id: id,
            signal,
        })
        .await
    }

    /// Ask the proxy to shut down.
    pub async fn shutdown(&self) -> crate::Result<ControlResponse> {
        self.roundtrip(ControlRequest::bare(ControlCommand::Shutdown))
            .await
    }

    async fn roundtrip(&self, request: ControlRequest) -> crate::Result<ControlResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|err| {
            format!(
                "cannot connect to control socket {}: {} (is the proxy running?)",
                self.socket_path.display(),
                err
            )
        })?;
        debug!(?request, "sending control request");

        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        stream.write_all(&buf).await?;

        let mut raw = vec![0u8; RESPONSE_SIZE];
        stream.read_exact(&mut raw).await?;
        ControlResponse::decode(&raw[..])
    }
}
