//! Shared registry of live connections.
//!
//! The registry is the only mutable state shared between the supervisor,
//! the connection handlers and the control listener. It is a fixed-capacity
//! table behind a single mutex; every compound operation (check-then-insert,
//! find-then-remove, find-then-overwrite) holds the lock for its whole
//! duration, so the control plane always observes a consistent snapshot and
//! stats updates are totally ordered.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{ConnectionInfo, MAX_CONNECTIONS};
use crate::stats::ConnectionStats;

/// Table of live connection handlers, capped at [`MAX_CONNECTIONS`]
/// entries. Handlers past the cap keep relaying; they are simply invisible
/// to the control plane.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    // This is a `std::sync::Mutex` and not a Tokio mutex, because the lock
    // is never held across an `.await` and the critical sections are tiny.
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    /// Valid entries in arrival order.
    entries: Vec<ConnectionInfo>,

    /// Signal channel of each registered handler, keyed by handler id.
    signals: HashMap<u32, mpsc::UnboundedSender<i32>>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry::default()
    }

    /// Insert a new entry together with the handler's signal channel.
    ///
    /// Returns `false` when the table is already full; the caller is
    /// expected to keep relaying without administrative visibility.
    pub fn register(&self, info: ConnectionInfo, signal_tx: mpsc::UnboundedSender<i32>) -> bool {
        let mut state = self.state.lock().unwrap();

        if state.entries.len() >= MAX_CONNECTIONS {
            warn!(
                id = info.id,
                cap = MAX_CONNECTIONS,
                "connection table full, handler will not be tracked"
            );
            return false;
        }

        debug!(
            id = info.id,
            client = %info.client_addr,
            client_port = info.client_port,
            "connection registered"
        );
        state.signals.insert(info.id, signal_tx);
        state.entries.push(info);
        true
    }

    /// Remove the entry for `id`, preserving the order of the rest.
    /// Unknown ids are a no-op.
    pub fn unregister(&self, id: u32) {
        let mut state = self.state.lock().unwrap();

        if let Some(pos) = state.entries.iter().position(|entry| entry.id == id) {
            state.entries.remove(pos);
            debug!(id, "connection unregistered");
        }
        state.signals.remove(&id);
    }

    /// Mirror a handler's byte counters and activity timestamp into its
    /// entry. Only those three fields are touched; unknown ids are a no-op.
    pub fn update_stats(&self, id: u32, stats: &ConnectionStats) {
        let mut state = self.state.lock().unwrap();

        if let Some(entry) = state.entries.iter_mut().find(|entry| entry.id == id) {
            entry.client_to_server_bytes = stats.client_to_server_bytes;
            entry.server_to_client_bytes = stats.server_to_client_bytes;
            entry.last_activity = stats.last_activity;
        }
    }

    /// Copy of all valid entries.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.state.lock().unwrap().entries.clone()
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `signal` to the handler registered under `id`.
    ///
    /// Success means the signal was handed to the handler's channel, not
    /// that the handler has acted on it yet.
    pub fn signal(&self, id: u32, signal: i32) -> crate::Result<()> {
        let state = self.state.lock().unwrap();

        match state.signals.get(&id) {
            Some(tx) if tx.send(signal).is_ok() => Ok(()),
            Some(_) => Err(format!("connection {} is already closing", id).into()),
            None => Err(format!("no connection with id {}", id).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: u32) -> ConnectionInfo {
        ConnectionInfo {
            id,
            client_addr: "127.0.0.1".to_string(),
            client_port: 40000 + id as u16,
            target_addr: "127.0.0.1".to_string(),
            target_port: 8080,
            start_time: 100,
            last_activity: 100,
            ..ConnectionInfo::default()
        }
    }

    fn channel() -> (mpsc::UnboundedSender<i32>, mpsc::UnboundedReceiver<i32>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn register_snapshot_unregister() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();

        assert!(registry.register(info(1), tx.clone()));
        assert!(registry.register(info(2), tx.clone()));
        assert!(registry.register(info(3), tx));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(
            snapshot.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        registry.unregister(2);
        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![1, 3]
        );

        // unknown ids are a no-op
        registry.unregister(2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn capacity_is_enforced() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();

        for id in 0..MAX_CONNECTIONS as u32 {
            assert!(registry.register(info(id), tx.clone()));
        }
        assert!(!registry.register(info(10_000), tx));
        assert_eq!(registry.len(), MAX_CONNECTIONS);

        // an untracked handler cannot be signalled
        assert!(registry.signal(10_000, 15).is_err());
    }

    #[test]
    fn update_stats_touches_only_counters_and_activity() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        registry.register(info(7), tx);

        let mut stats = ConnectionStats::new();
        stats.client_to_server_bytes = 512;
        stats.server_to_client_bytes = 2048;
        stats.last_activity = stats.start_time + 5;
        registry.update_stats(7, &stats);

        let entry = &registry.snapshot()[0];
        assert_eq!(entry.client_to_server_bytes, 512);
        assert_eq!(entry.server_to_client_bytes, 2048);
        assert_eq!(entry.last_activity, stats.start_time + 5);
        // identity fields are left alone
        assert_eq!(entry.client_addr, "127.0.0.1");
        assert_eq!(entry.start_time, 100);

        // unknown ids are a no-op
        registry.update_stats(99, &stats);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn signals_reach_the_registered_channel() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = channel();
        registry.register(info(4), tx);

        registry.signal(4, 19).unwrap();
        registry.signal(4, 18).unwrap();
        assert_eq!(rx.try_recv().unwrap(), 19);
        assert_eq!(rx.try_recv().unwrap(), 18);

        assert!(registry.signal(5, 15).is_err());

        // a handler that already dropped its receiver reports failure
        drop(rx);
        assert!(registry.signal(4, 15).is_err());
    }
}
