//! Proxy supervisor.
//!
//! Provides an async `run` function that accepts inbound client
//! connections, dials the upstream target for each one, and spawns a task
//! per connection pair to relay traffic between them.

use crate::control::ControlServer;
use crate::filter::FilterChain;
use crate::registry::ConnectionRegistry;
use crate::relay::Relay;
use crate::{ProxyConfig, Shutdown};

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{self, TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

/// Server listener state. Created in the `run` call. It includes a `run`
/// method which performs the TCP listening and initialization of
/// per-connection state.
#[derive(Debug)]
struct Listener {
    /// TCP listener supplied by the `run` caller.
    listener: TcpListener,

    /// Upstream host every accepted connection is relayed to.
    target_host: String,

    /// Upstream port.
    target_port: u16,

    /// Filter chain template. Each handler receives its own copy so that
    /// shaping state never crosses connections.
    filters: FilterChain,

    /// Shared table of live connections.
    ///
    /// Handlers insert themselves when they start relaying and remove
    /// themselves on exit; the control listener reads and signals through
    /// the same handle.
    registry: Arc<ConnectionRegistry>,

    /// Identity for the next spawned handler. Only the accept loop
    /// allocates ids, so a plain counter suffices.
    next_handler_id: u32,

    /// Broadcasts a shutdown signal to all active connections.
    ///
    /// The initial `shutdown` trigger is provided by the `run` caller. The
    /// server is responsible for gracefully shutting down active
    /// connections. When a connection task is spawned, it is passed a
    /// broadcast receiver handle. When a graceful shutdown is initiated, a
    /// `()` value is sent via the broadcast::Sender. Each active connection
    /// receives it, reaches a safe terminal state, and completes the task.
    notify_shutdown: broadcast::Sender<()>,

    /// Used as part of the graceful shutdown process to wait for client
    /// connections to complete processing.
    ///
    /// Tokio channels are closed once all `Sender` handles go out of
    /// scope. When a channel is closed, the receiver receives `None`. This
    /// is leveraged to detect all connection handlers completing. When a
    /// handler is initialized, it is assigned a clone of this sender; when
    /// the listener shuts down it drops its own copy, and once every
    /// handler has exited `shutdown_complete_rx.recv()` yields `None`.
    shutdown_complete_tx: mpsc::Sender<()>,
}

/// Per-connection handler. Owns the relay for one client/upstream pair and
/// keeps the registry in step with the relay's lifetime.
#[derive(Debug)]
struct Handler {
    /// Shared registry handle.
    ///
    /// The handler inserts its entry before relaying and removes it on the
    /// way out. The relay mirrors its counters through the same handle.
    registry: Arc<ConnectionRegistry>,

    /// The relay owning both sockets, the filter chain copy and the stats.
    relay: Relay,

    /// Listen for shutdown notifications.
    shutdown: Shutdown,

    /// Sender half of the operator signal channel. A clone is stored in
    /// the registry so KILL and SIGNAL commands can reach this handler.
    signal_tx: mpsc::UnboundedSender<i32>,

    /// Receiver half of the operator signal channel.
    signal_rx: mpsc::UnboundedReceiver<i32>,

    /// Not used directly. When the handler is dropped, the drain channel
    /// learns that one more connection finished.
    _shutdown_complete: mpsc::Sender<()>,
}

/// Run the proxy server.
///
/// Accepts connections from the supplied listener and relays each one to
/// the target named in `config`. For each inbound connection, a task is
/// spawned to handle that connection. The server runs until the `shutdown`
/// future completes, or until a SHUTDOWN command arrives over the control
/// socket, at which point the server shuts down gracefully.
///
/// `tokio::signal::ctrl_c()` can be used as the `shutdown` argument.
pub async fn run(
    listener: TcpListener,
    config: ProxyConfig,
    filters: FilterChain,
    shutdown: impl Future,
) -> crate::Result<()> {
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);
    // Gives the control listener a way to request a server-wide shutdown.
    let (control_shutdown_tx, mut control_shutdown_rx) = mpsc::channel(1);

    let registry = Arc::new(ConnectionRegistry::new());

    let control = ControlServer::bind(
        &config.control_socket,
        registry.clone(),
        control_shutdown_tx,
    )?;
    let control_handle = tokio::spawn(control.run(Shutdown::new(notify_shutdown.subscribe())));

    let mut server = Listener {
        listener,
        target_host: config.target_host.clone(),
        target_port: config.target_port,
        filters,
        registry,
        next_handler_id: 1,
        notify_shutdown,
        shutdown_complete_tx,
    };

    tokio::select! {
        res = server.run() => {
            // Errors escaping the accept loop mean accepting failed
            // repeatedly and the server gave up. Errors inside individual
            // connections never reach this point.
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = shutdown => {
            info!("shutting down");
        }
        _ = control_shutdown_rx.recv() => {
            info!("shutdown requested over control socket");
        }
    }

    // Extract the shutdown plumbing and drop the rest of the listener
    // state, the listening socket included, before draining.
    let Listener {
        shutdown_complete_tx,
        notify_shutdown,
        ..
    } = server;

    // Dropping `notify_shutdown` signals every subscriber, handlers and
    // control listener alike.
    drop(notify_shutdown);
    // Drop the last extra `Sender` so the drain below can complete.
    drop(shutdown_complete_tx);

    // The control listener unlinks the socket node on its way out.
    let _ = control_handle.await;

    // Wait for all active handlers to finish. Once every handler drops its
    // `Sender` clone, `recv()` returns `None`.
    let _ = shutdown_complete_rx.recv().await;
    info!("proxy shut down cleanly");

    Ok(())
}

impl Listener {
    /// Accept inbound connections, dialing the upstream and spawning a
    /// handler for each.
    ///
    /// # Errors
    ///
    /// Returns `Err` if accepting repeatedly fails. Transient accept
    /// errors are absorbed by an exponential backoff; see `accept`.
    async fn run(&mut self) -> crate::Result<()> {
        info!("accepting inbound connections");

        loop {
            let (client, client_addr) = self.accept().await?;
            info!(client = %client_addr, "new client connection");

            // Dial the upstream for this client. A failure here only
            // costs the one connection; the proxy keeps accepting.
            let upstream = match connect_target(&self.target_host, self.target_port).await {
                Ok(upstream) => upstream,
                Err(err) => {
                    error!(
                        target = %self.target_host,
                        port = self.target_port,
                        cause = %err,
                        "upstream dial failed, dropping client"
                    );
                    continue;
                }
            };
            let target_addr = match upstream.peer_addr() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(cause = %err, "upstream vanished before relaying, dropping client");
                    continue;
                }
            };

            let id = self.next_handler_id;
            self.next_handler_id = self.next_handler_id.wrapping_add(1);

            let (signal_tx, signal_rx) = mpsc::unbounded_channel();
            let mut handler = Handler {
                registry: self.registry.clone(),

                // Ownership of both sockets moves into the relay; the
                // supervisor keeps no descriptor for them, so a close in
                // the handler is a real TCP teardown.
                relay: Relay::new(
                    id,
                    client,
                    client_addr,
                    upstream,
                    target_addr,
                    self.filters.clone(),
                ),

                shutdown: Shutdown::new(self.notify_shutdown.subscribe()),

                signal_tx,
                signal_rx,

                _shutdown_complete: self.shutdown_complete_tx.clone(),
            };

            tokio::spawn(async move {
                handler.run().await;
            });
        }
    }

    /// Accept an inbound connection.
    ///
    /// Errors are handled by backing off and retrying. An exponential
    /// backoff strategy is used: after the first failure the task waits
    /// for 1 second, doubling after each subsequent failure. If accepting
    /// still fails after waiting 64 seconds, the error is returned.
    async fn accept(&mut self) -> crate::Result<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, addr)) => return Ok((socket, addr)),
                Err(err) => {
                    if backoff > 64 {
                        return Err(err.into());
                    }
                    error!(cause = %err, backoff, "accept failed, backing off");
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;

            backoff *= 2;
        }
    }
}

impl Handler {
    /// Service one connection pair to completion.
    ///
    /// The registry entry exists exactly as long as the relay runs; when
    /// the table is already full the relay still runs, invisible to the
    /// control plane.
    async fn run(&mut self) {
        let info = self.relay.connection_info();
        info!(
            id = self.relay.id(),
            client = %info.client_addr,
            client_port = info.client_port,
            target = %info.target_addr,
            target_port = info.target_port,
            "relaying"
        );

        let registered = self.registry.register(info, self.signal_tx.clone());

        self.relay
            .run(&self.registry, &mut self.shutdown, &mut self.signal_rx)
            .await;

        if registered {
            self.registry.unregister(self.relay.id());
        }
    }
}

/// Resolve `host` and dial the first address that accepts the connection.
///
/// Resolution yields both IPv4 and IPv6 candidates; they are attempted in
/// the order returned. Numeric addresses resolve to themselves, so both
/// hostnames and literals work here.
pub(crate) async fn connect_target(host: &str, port: u16) -> crate::Result<TcpStream> {
    let mut last_err: Option<io::Error> = None;

    for addr in net::lookup_host((host, port)).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!(upstream = %addr, "connected to target");
                return Ok(stream);
            }
            Err(err) => {
                debug!(candidate = %addr, cause = %err, "connect attempt failed");
                last_err = Some(err);
            }
        }
    }

    Err(match last_err {
        Some(err) => err.into(),
        None => format!("target {} did not resolve to any address", host).into(),
    })
}
