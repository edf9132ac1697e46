use tokio::sync::broadcast;

/// Listens for the server shutdown signal.
///
/// Shutdown is signalled with a `broadcast::Receiver`. Only a single value
/// is ever sent; once it has been sent, the proxy is draining and every
/// handler and the control listener should reach a safe point and stop.
///
/// `Shutdown` remembers that the signal was received so callers can poll
/// `is_shutdown` between waits.
#[derive(Debug)]
pub(crate) struct Shutdown {
    /// `true` once the shutdown signal has been received.
    is_shutdown: bool,

    /// The receive half of the channel used to listen for shutdown.
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Create a new `Shutdown` backed by the given `broadcast::Receiver`.
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Wait for the shutdown notice, returning immediately if it already
    /// arrived. Cannot receive a lag error, as only one value is ever sent.
    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }

        let _ = self.notify.recv().await;

        self.is_shutdown = true;
    }
}
