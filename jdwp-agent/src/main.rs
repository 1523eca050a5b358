// JDWP Agent - debug a simulated runtime with any JDWP debugger
//
// Listens for (or attaches to) a debugger and serves a `DemoVm` through the
// jdwp-server session engine.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use jdwp_server::{JdwpOptions, JdwpServer};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod demo;

use demo::DemoVm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// JDWP agent serving a simulated multi-threaded debuggee
#[derive(Parser, Debug)]
#[command(name = "jdwp-agent")]
#[command(version)]
#[command(about, long_about = None)]
struct Cli {
    /// Agent option string, e.g. transport=dt_socket,server=y,suspend=n,address=*:8000
    #[arg(long, env = "JDWP_OPTIONS")]
    agentlib_options: Option<String>,

    /// Address to listen on or attach to (port, host:port or *:port)
    #[arg(long)]
    address: Option<String>,

    /// Attach to a listening debugger instead of waiting for one
    #[arg(long, default_value_t = false)]
    attach: bool,

    /// Hold the main thread at VM start until the debugger resumes it
    #[arg(long, default_value_t = false)]
    suspend: bool,

    /// Accept, attach and handshake timeout in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Number of worker threads in the demo program
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Pause between two bytecode indices, in milliseconds
    #[arg(long, default_value_t = 250)]
    tick_ms: u64,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    /// Option string first, individual flags on top
    fn options(&self) -> Result<JdwpOptions> {
        let mut options = match &self.agentlib_options {
            Some(raw) => JdwpOptions::parse(raw).with_context(|| format!("Invalid agent options '{}'", raw))?,
            None => JdwpOptions::default(),
        };

        if let Some(address) = &self.address {
            options
                .set_address(address)
                .with_context(|| format!("Invalid address '{}'", address))?;
        }
        if self.attach {
            options.server = false;
        }
        if self.suspend {
            options.suspend = true;
        }
        if let Some(timeout) = self.timeout {
            options.timeout = timeout;
        }
        if !options.server && options.port == 0 {
            anyhow::bail!("Attaching to a debugger requires --address");
        }
        Ok(options)
    }
}

fn init_logging(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("jdwp_server=info,jdwp_agent=info"))?;

    // stdout carries the listening address report only
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format).context("Failed to initialize logging")?;

    let options = cli.options()?;
    info!(
        "Starting JDWP agent with {}",
        serde_json::to_string(&options).context("Failed to serialize options")?
    );

    let vm = DemoVm::new(cli.workers, Duration::from_millis(cli.tick_ms));
    if !options.suspend {
        vm.start();
    }

    let server = JdwpServer::bind(options.clone())
        .await
        .with_context(|| format!("Failed to bind {}", options.address()))?;
    if let Some(port) = server.local_port() {
        println!("Listening for transport {} at address: {}", options.transport, port);
    }

    tokio::select! {
        result = serve(&server, &vm, options.suspend) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    vm.shutdown();
    info!("JDWP agent shutting down");
    Ok(())
}

/// Serve debuggers one at a time. Attach mode serves a single session.
async fn serve(server: &JdwpServer, vm: &std::sync::Arc<DemoVm>, suspend: bool) -> Result<()> {
    loop {
        let connection = match server.connect().await {
            Ok(connection) => connection,
            Err(e) if server.options().server => {
                error!("Debugger connection failed: {}", e);
                continue;
            }
            Err(e) => return Err(e).context("Failed to attach to debugger"),
        };

        let handle = server.serve(connection, vm.clone(), vm.clone());
        vm.attach(handle.dispatcher(), suspend);
        handle.closed().await;
        vm.detach();

        if !server.options().server {
            return Ok(());
        }
        info!("Waiting for the next debugger");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_option_string() {
        let cli = Cli::parse_from([
            "jdwp-agent",
            "--agentlib-options",
            "transport=dt_socket,server=y,suspend=n,address=8000",
            "--address",
            "*:9000",
            "--suspend",
        ]);
        let options = cli.options().unwrap();
        assert_eq!(options.host, "0.0.0.0");
        assert_eq!(options.port, 9000);
        assert!(options.suspend);
        assert!(options.server);
    }

    #[test]
    fn test_attach_needs_address() {
        let cli = Cli::parse_from(["jdwp-agent", "--attach"]);
        assert!(cli.options().is_err());

        let cli = Cli::parse_from(["jdwp-agent", "--attach", "--address", "localhost:5005"]);
        let options = cli.options().unwrap();
        assert!(!options.server);
        assert_eq!(options.address(), "localhost:5005");
    }

    #[test]
    fn test_bad_option_string_is_reported() {
        let cli = Cli::parse_from(["jdwp-agent", "--agentlib-options", "transport=dt_shmem"]);
        let err = cli.options().unwrap_err();
        assert!(format!("{:#}", err).contains("dt_shmem"));
    }
}
