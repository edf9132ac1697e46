pub mod clients;
pub use clients::ControlClient;

pub mod config;
pub use config::ProxyConfig;

pub mod control;

pub mod filter;
pub use filter::{Filter, FilterChain};

pub mod protocol;
pub use protocol::{ConnectionInfo, ControlCommand, ControlRequest, ControlResponse};

pub mod registry;
pub use registry::ConnectionRegistry;

pub mod relay;

pub mod server;

pub mod shutdown;
use shutdown::Shutdown;

pub mod stats;
pub use stats::ConnectionStats;

/// Default port the proxy listens on.
///
/// Used if no port is specified.
pub const DEFAULT_LISTEN_PORT: u16 = 9999;

/// Default filesystem path of the administrative control socket.
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/tcp_proxy_control.sock";

/// Error returned by most functions.
///
/// When writing a real application, one might want to consider a specialized
/// error handling crate or defining an error type as an `enum` of causes.
/// However, for this proxy, using a boxed `std::error::Error` is sufficient:
/// none of the error paths are hot, and every failure either aborts startup
/// or tears down exactly one connection.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for proxy operations.
/// This is defined as a convenience.
pub type Result<T> = std::result::Result<T, Error>;
