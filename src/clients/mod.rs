//! Client for the proxy's administrative control plane.

mod client;
pub use client::ControlClient;
