//! Operator tool for a running my-tcp-proxy instance.
//!
//! Dials the proxy's control socket and issues one administrative command
//! per invocation: enumerate connections, inspect transfer totals, signal
//! or terminate a single connection, or shut the whole proxy down.

use my_tcp_proxy::clients::ControlClient;
use my_tcp_proxy::protocol::{self, ConnectionInfo};
use my_tcp_proxy::stats::unix_now;
use my_tcp_proxy::DEFAULT_CONTROL_SOCKET;

use std::io::{self, BufRead, Write};

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(
    name = "my-tcp-proxy-ctl",
    version,
    author,
    about = "Manage a running tcp proxy"
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    /// Control socket path
    #[clap(short = 's', long, default_value = DEFAULT_CONTROL_SOCKET)]
    socket: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List active connections
    #[clap(alias = "ls")]
    List,

    /// Terminate one connection
    Kill {
        /// Connection id as shown by `list`
        id: u32,
    },

    /// Send a signal to one connection
    Signal {
        /// Connection id as shown by `list`
        id: u32,

        /// TERM, KILL, STOP, CONT, HUP, USR1, USR2 or a number
        #[clap(value_parser = signal_from_str)]
        signal: i32,
    },

    /// Show aggregate transfer statistics
    Stats,

    /// Shut the proxy down
    Shutdown,
}

/// A current-thread runtime is plenty here; every invocation performs a
/// single request/response exchange and exits.
#[tokio::main(flavor = "current_thread")]
async fn main() -> my_tcp_proxy::Result<()> {
    let cli = Cli::parse();

    let client = ControlClient::new(&cli.socket);

    match cli.command {
        Command::List => list(&client).await,
        Command::Kill { id } => kill(&client, id).await,
        Command::Signal { id, signal } => signal_cmd(&client, id, signal).await,
        Command::Stats => stats(&client).await,
        Command::Shutdown => shutdown(&client).await,
    }
}

async fn list(client: &ControlClient) -> my_tcp_proxy::Result<()> {
    let response = client.list().await?;
    if !response.success {
        return Err(response.message.into());
    }

    if response.connections.is_empty() {
        println!("no active connections");
        return Ok(());
    }

    println!("{} active connection(s):", response.connections.len());
    println!();
    println!(
        "{:<6} {:<22} {:<22} {:>10} {:>10} {:>10}  {}",
        "ID", "CLIENT", "TARGET", "UPLOAD", "DOWNLOAD", "AGE", "LAST ACTIVITY"
    );

    let now = unix_now();
    for conn in &response.connections {
        println!(
            "{:<6} {:<22} {:<22} {:>10} {:>10} {:>10}  {}",
            conn.id,
            endpoint(&conn.client_addr, conn.client_port),
            endpoint(&conn.target_addr, conn.target_port),
            format_bytes(conn.client_to_server_bytes),
            format_bytes(conn.server_to_client_bytes),
            format_duration(now.saturating_sub(conn.start_time)),
            format_activity(now.saturating_sub(conn.last_activity)),
        );
    }

    Ok(())
}

async fn kill(client: &ControlClient, id: u32) -> my_tcp_proxy::Result<()> {
    let response = client.kill(id).await?;
    if !response.success {
        return Err(response.message.into());
    }
    println!("{}", response.message);
    Ok(())
}

async fn signal_cmd(client: &ControlClient, id: u32, signal: i32) -> my_tcp_proxy::Result<()> {
    let response = client.signal(id, signal).await?;
    if !response.success {
        return Err(response.message.into());
    }
    println!("{}", response.message);
    Ok(())
}

async fn stats(client: &ControlClient) -> my_tcp_proxy::Result<()> {
    let response = client.stats().await?;
    if !response.success {
        return Err(response.message.into());
    }

    if response.connections.is_empty() {
        println!("no active connections");
        return Ok(());
    }

    let total_up: u64 = totals(&response.connections, |c| c.client_to_server_bytes);
    let total_down: u64 = totals(&response.connections, |c| c.server_to_client_bytes);

    println!("active connections:  {}", response.connections.len());
    println!("total upload:        {}", format_bytes(total_up));
    println!("total download:      {}", format_bytes(total_down));
    println!("total transferred:   {}", format_bytes(total_up + total_down));

    Ok(())
}

async fn shutdown(client: &ControlClient) -> my_tcp_proxy::Result<()> {
    print!("really shut the proxy down? (yes/no): ");
    io::stdout().flush()?;

    let mut confirm = String::new();
    io::stdin().lock().read_line(&mut confirm)?;
    let confirm = confirm.trim().to_ascii_lowercase();
    if confirm != "yes" && confirm != "y" {
        println!("cancelled");
        return Ok(());
    }

    let response = client.shutdown().await?;
    if !response.success {
        return Err(response.message.into());
    }
    println!("{}", response.message);
    Ok(())
}

fn signal_from_str(src: &str) -> Result<i32, String> {
    protocol::signal_from_name(src).ok_or_else(|| {
        format!(
            "unknown signal `{}`, expected TERM, KILL, STOP, CONT, HUP, USR1, USR2 or a number",
            src
        )
    })
}

fn totals(connections: &[ConnectionInfo], field: impl Fn(&ConnectionInfo) -> u64) -> u64 {
    connections.iter().map(field).sum()
}

fn endpoint(addr: &str, port: u16) -> String {
    format!("{}:{}", addr, port)
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let bytes_f = bytes as f64;
    if bytes_f < KB {
        format!("{} B", bytes)
    } else if bytes_f < MB {
        format!("{:.2} KB", bytes_f / KB)
    } else if bytes_f < GB {
        format!("{:.2} MB", bytes_f / MB)
    } else {
        format!("{:.2} GB", bytes_f / GB)
    }
}

fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

fn format_activity(idle_seconds: u64) -> String {
    if idle_seconds < 60 {
        format!("{}s ago", idle_seconds)
    } else {
        format!("{} ago", format_duration(idle_seconds))
    }
}
