//! Proxy configuration.
//!
//! A `ProxyConfig` is assembled once at startup from three layers: built-in
//! defaults, an optional plain-text configuration file, and command line
//! flags. Later layers win. After startup the configuration is immutable.

use std::fs;
use std::path::Path;

use tracing::{debug, info};

/// Runtime configuration for the proxy supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Port the proxy accepts client connections on.
    pub listen_port: u16,

    /// Upstream host every connection is relayed to. A hostname or a
    /// numeric IPv4/IPv6 address.
    pub target_host: String,

    /// Upstream port.
    pub target_port: u16,

    /// Whether log lines are additionally appended to `log_file`.
    pub enable_logging: bool,

    /// Path of the append-only log file.
    pub log_file: String,

    /// Whether the configured filter chain is applied to relayed traffic.
    pub enable_filters: bool,

    /// Filesystem path the administrative listener binds to.
    pub control_socket: String,
}

impl Default for ProxyConfig {
    fn default() -> ProxyConfig {
        ProxyConfig {
            listen_port: crate::DEFAULT_LISTEN_PORT,
            target_host: "127.0.0.1".to_string(),
            target_port: 8080,
            enable_logging: true,
            log_file: "logs/proxy.log".to_string(),
            enable_filters: false,
            control_socket: crate::DEFAULT_CONTROL_SOCKET.to_string(),
        }
    }
}

impl ProxyConfig {
    /// Merge directives from a configuration file into `self`.
    ///
    /// The format is one `key=value` directive per line. Blank lines and
    /// lines starting with `#` are ignored, as is whitespace around the key
    /// and the value. Directives with keys this version does not recognize
    /// are skipped so that one file can serve several proxy builds.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> crate::Result<()> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|err| format!("cannot read config file {}: {}", path.display(), err))?;

        for (line_num, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => {
                    debug!(line = line_num + 1, "skipping malformed config line");
                    continue;
                }
            };

            match key {
                "listen_port" => self.listen_port = parse_port(value)?,
                "target_host" => self.target_host = value.to_string(),
                "target_port" => self.target_port = parse_port(value)?,
                "enable_logging" => self.enable_logging = parse_bool(value),
                "log_file" => self.log_file = value.to_string(),
                "enable_filters" => self.enable_filters = parse_bool(value),
                "control_socket" => self.control_socket = value.to_string(),
                other => debug!(key = other, "ignoring unknown config key"),
            }
        }

        info!(config = %path.display(), "configuration file loaded");
        Ok(())
    }

    /// Check cross-field constraints that the individual setters cannot.
    pub fn validate(&self) -> crate::Result<()> {
        if self.target_host.is_empty() {
            return Err("target host must not be empty".into());
        }
        if self.target_host.len() > 255 {
            return Err("target host exceeds 255 characters".into());
        }
        if self.control_socket.is_empty() {
            return Err("control socket path must not be empty".into());
        }
        Ok(())
    }
}

/// Parse a `host:port` target specification.
///
/// The port is taken after the last colon so that bracket-free IPv6
/// addresses keep working.
pub fn parse_target(spec: &str) -> crate::Result<(String, u16)> {
    match spec.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), parse_port(port)?)),
        _ => Err(format!("invalid target `{}`, expected host:port", spec).into()),
    }
}

/// Parse a port number in 1-65535.
pub fn parse_port(value: &str) -> crate::Result<u16> {
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(format!("invalid port `{}`, expected 1-65535", value).into()),
    }
}

fn parse_bool(value: &str) -> bool {
    value == "true" || value == "1"
}
