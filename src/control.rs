//! The administrative listener.
//!
//! A dedicated task inside the supervisor accepts connections on a unix
//! stream socket. Each admin connection carries exactly one fixed-size
//! request and receives exactly one fixed-size response before it is
//! closed. Requests are served one at a time; the control plane is a
//! low-rate operator surface, not a data path.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::protocol::{self, ControlCommand, ControlRequest, ControlResponse, REQUEST_SIZE};
use crate::registry::ConnectionRegistry;
use crate::Shutdown;

/// Listener state for the control socket.
pub(crate) struct ControlServer {
    listener: UnixListener,

    /// Kept so the bound node can be unlinked on shutdown.
    socket_path: PathBuf,

    registry: Arc<ConnectionRegistry>,

    /// Lets a SHUTDOWN command reach the supervisor's select loop.
    shutdown_request: mpsc::Sender<()>,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale node a previous run may
    /// have left behind.
    pub(crate) fn bind(
        path: &str,
        registry: Arc<ConnectionRegistry>,
        shutdown_request: mpsc::Sender<()>,
    ) -> crate::Result<ControlServer> {
        let socket_path = PathBuf::from(path);
        let _ = fs::remove_file(&socket_path);

        let listener = UnixListener::bind(&socket_path)
            .map_err(|err| format!("cannot bind control socket {}: {}", path, err))?;
        info!(socket = %socket_path.display(), "control listener ready");

        Ok(ControlServer {
            listener,
            socket_path,
            registry,
            shutdown_request,
        })
    }

    /// Serve admin connections until the supervisor shuts down, then
    /// unlink the socket node.
    pub(crate) async fn run(self, mut shutdown: Shutdown) {
        while !shutdown.is_shutdown() {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            if let Err(err) = self.serve(stream).await {
                                error!(cause = %err, "control connection failed");
                            }
                        }
                        Err(err) => {
                            error!(cause = %err, "control accept failed");
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        drop(self.listener);
        let _ = fs::remove_file(&self.socket_path);
        info!("control listener stopped");
    }

    /// One request, one response, close.
    async fn serve(&self, mut stream: UnixStream) -> crate::Result<()> {
        let mut raw = [0u8; REQUEST_SIZE];
        let request = match stream.read_exact(&mut raw).await {
            Ok(_) => ControlRequest::decode(&raw[..])?,
            Err(err) => {
                // A short read is a protocol error; the peer still gets a
                // well-formed failure record before the close.
                warn!(cause = %err, "malformed control request");
                return send(&mut stream, &ControlResponse::failure("malformed control request"))
                    .await;
            }
        };

        debug!(?request, "control request");
        let response = self.dispatch(&request);
        debug!(
            command = ?request.command,
            success = response.success,
            message = %response.message,
            "control request handled"
        );

        send(&mut stream, &response).await
    }

    fn dispatch(&self, request: &ControlRequest) -> ControlResponse {
        match request.command {
            ControlCommand::List => {
                let connections = self.registry.snapshot();
                ControlResponse {
                    success: true,
                    message: format!("{} active connections", connections.len()),
                    connections,
                }
            }
            ControlCommand::Stats => {
                let connections = self.registry.snapshot();
                ControlResponse {
                    success: true,
                    message: format!("statistics for {} connections", connections.len()),
                    connections,
                }
            }
            ControlCommand::Kill => self.signal(request.target_id, protocol::SIGTERM),
            ControlCommand::Signal => self.signal(request.target_id, request.signal),
            ControlCommand::Shutdown => {
                // The response is written after dispatch returns, so the
                // peer hears back before the supervisor starts draining.
                if self.shutdown_request.try_send(()).is_err() {
                    debug!("shutdown already in progress");
                }
                ControlResponse::ok("proxy shutting down")
            }
            ControlCommand::Unknown(tag) => {
                ControlResponse::failure(format!("unknown command tag {}", tag))
            }
        }
    }

    fn signal(&self, id: u32, signal: i32) -> ControlResponse {
        match self.registry.signal(id, signal) {
            Ok(()) => ControlResponse::ok(format!("sent signal {} to connection {}", signal, id)),
            Err(err) => ControlResponse::failure(err.to_string()),
        }
    }
}

async fn send(stream: &mut UnixStream, response: &ControlResponse) -> crate::Result<()> {
    let mut buf = BytesMut::new();
    response.encode(&mut buf);
    stream.write_all(&buf).await?;
    Ok(())
}
