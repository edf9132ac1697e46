//! my-tcp-proxy server.
//!
//! This file is the entry point for the proxy itself. It parses the
//! command line, merges it with the optional configuration file, wires up
//! logging, and hands the resulting configuration to the
//! `my_tcp_proxy::server` module. The `clap` crate is used to parse
//! arguments.

use my_tcp_proxy::config::{self, ProxyConfig};
use my_tcp_proxy::filter::FilterChain;
use my_tcp_proxy::server;

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpSocket;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[clap(
    name = "my-tcp-proxy-server",
    version,
    author,
    about = "A shaping TCP reverse proxy"
)]
struct Cli {
    /// Listening port
    #[clap(short = 'p', long, value_parser = config::parse_port)]
    port: Option<u16>,

    /// Target server as host:port
    #[clap(short = 't', long)]
    target: Option<String>,

    /// Configuration file path
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log file path
    #[clap(short = 'l', long)]
    log_file: Option<String>,

    /// Append a delay filter (milliseconds)
    #[clap(short = 'd', long, value_name = "MS", value_parser = delay_from_str)]
    delay: Option<u64>,

    /// Append a drop filter (probability, 0.0-1.0)
    #[clap(short = 'r', long, value_name = "RATE", value_parser = rate_from_str)]
    drop_rate: Option<f64>,

    /// Append a throttle filter (bytes per second)
    #[clap(short = 'b', long, value_name = "BYTES_PER_SEC", value_parser = throttle_from_str)]
    throttle: Option<u64>,

    /// Control socket path
    #[clap(short = 's', long)]
    control_socket: Option<String>,

    /// Enable debug logging
    #[clap(short = 'v', long)]
    verbose: bool,
}

/// Backlog for the listening socket. Accepts are serviced promptly, so a
/// short queue is enough.
const LISTEN_BACKLOG: u32 = 10;

#[tokio::main]
async fn main() -> my_tcp_proxy::Result<()> {
    // clap exits with status 2 on its own; the proxy reserves 1 for every
    // startup failure, so parse errors are rendered by hand.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            process::exit(code);
        }
    };

    // Defaults first, then the configuration file, then the flags, so the
    // command line always has the last word.
    let mut config = ProxyConfig::default();
    if let Some(path) = &cli.config {
        config.load_file(path)?;
    }
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if let Some(target) = &cli.target {
        let (host, port) = config::parse_target(target)?;
        config.target_host = host;
        config.target_port = port;
    }
    if let Some(log_file) = cli.log_file {
        config.log_file = log_file;
    }
    if let Some(control_socket) = cli.control_socket {
        config.control_socket = control_socket;
    }

    let mut filters = FilterChain::new();
    if let Some(ms) = cli.delay {
        filters.add_delay(ms)?;
        config.enable_filters = true;
    }
    if let Some(rate) = cli.drop_rate {
        filters.add_drop(rate)?;
        config.enable_filters = true;
    }
    if let Some(bytes_per_sec) = cli.throttle {
        filters.add_throttle(bytes_per_sec)?;
        config.enable_filters = true;
    }
    config.validate()?;
    set_up_logging(&config, cli.verbose)?;

    info!("tcp proxy v{}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_port = config.listen_port,
        target = %config.target_host,
        target_port = config.target_port,
        logging = config.enable_logging,
        log_file = %config.log_file,
        control_socket = %config.control_socket,
        "effective configuration"
    );
    if config.enable_filters {
        info!(chain = %filters, "traffic shaping enabled");
    }

    // Bind with address reuse so a restart does not trip over sockets
    // lingering in TIME_WAIT.
    let addr: SocketAddr = format!("0.0.0.0:{}", config.listen_port).parse()?;
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket
        .bind(addr)
        .map_err(|err| format!("cannot bind port {}: {}", config.listen_port, err))?;
    let listener = socket.listen(LISTEN_BACKLOG)?;

    // Shut down on either SIGINT or SIGTERM.
    let mut terminate = unix_signal(SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    };

    server::run(listener, config, filters, shutdown).await?;

    Ok(())
}

fn set_up_logging(config: &ProxyConfig, verbose: bool) -> my_tcp_proxy::Result<()> {
    // `-v` forces debug output; otherwise `RUST_LOG` applies over an
    // `info` default.
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let stdout_layer = tracing_subscriber::fmt::layer();
    let registry = tracing_subscriber::registry().with(filter).with(stdout_layer);

    if config.enable_logging {
        if let Some(parent) = Path::new(&config.log_file).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file)?;
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Arc::new(file));
        registry.with(file_layer).try_init()?;
    } else {
        registry.try_init()?;
    }

    Ok(())
}

fn delay_from_str(src: &str) -> Result<u64, String> {
    match src.parse::<u64>() {
        Ok(ms) if ms <= 10_000 => Ok(ms),
        _ => Err(format!("invalid delay `{}`, expected 0-10000 ms", src)),
    }
}

fn rate_from_str(src: &str) -> Result<f64, String> {
    match src.parse::<f64>() {
        Ok(rate) if (0.0..=1.0).contains(&rate) => Ok(rate),
        _ => Err(format!("invalid drop rate `{}`, expected 0.0-1.0", src)),
    }
}

fn throttle_from_str(src: &str) -> Result<u64, String> {
    match src.parse::<u64>() {
        Ok(rate) if rate > 0 => Ok(rate),
        _ => Err(format!("invalid throttle `{}`, expected a positive byte rate", src)),
    }
}
