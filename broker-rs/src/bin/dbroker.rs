//! dbroker - remote debugging connection broker
//!
//! Command-line entry point for both the listener and child sessions

use std::path::PathBuf;
use std::sync::Arc;

use broker_core::config::{BrokerOptions, ConfigFile, ServerConfig};
use broker_core::errors::Result;
use broker_core::session::PacketEngine;
use broker_core::{daemon, logging};
use clap::Parser;
use colored::Colorize;
use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "dbroker")]
#[command(version)]
#[command(about = "Remote debugging connection broker", long_about = None)]
struct Cli {
    /// Address to listen on: [host]:port, port, or unix://path
    #[arg(long, short = 'L', value_name = "ADDRESS")]
    listen: Option<String>,

    /// Keep accepting clients, one session process per connection
    #[arg(long)]
    server: bool,

    /// Added to every session port before it is reported to the client
    #[arg(long, short = 'p', value_name = "OFFSET")]
    port_offset: Option<u16>,

    /// Allow this session port (repeatable)
    #[arg(long = "session-port", short = 'P', value_name = "PORT")]
    session_ports: Vec<u16>,

    /// Lowest session port (inclusive)
    #[arg(long, short = 'm', value_name = "PORT")]
    min_session_port: Option<u16>,

    /// Highest session port (inclusive)
    #[arg(long, short = 'M', value_name = "PORT")]
    max_session_port: Option<u16>,

    /// Write the bound listen address to this file
    #[arg(long, short = 'f', value_name = "PATH")]
    socket_file: Option<PathBuf>,

    /// YAML config file; command-line flags take precedence
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long, short = 'l', value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Log filter directives, e.g. "broker_core=debug"
    #[arg(long, short = 'c', value_name = "CHANNELS")]
    log_channels: Option<String>,

    /// Debug-level logging when no channels are given
    #[arg(long, short = 'v')]
    verbose: bool,

    #[arg(long, hide = true)]
    child_session_fd: Option<String>,

    #[arg(long, hide = true)]
    session_id: Option<String>,

    /// Passed through to each session
    #[arg(last = true)]
    session_args: Vec<String>,
}

impl Cli {
    fn into_options(self) -> BrokerOptions {
        BrokerOptions {
            listen: self.listen,
            server: self.server,
            port_offset: self.port_offset,
            session_ports: self.session_ports,
            min_session_port: self.min_session_port,
            max_session_port: self.max_session_port,
            socket_file: self.socket_file,
            child_session_fd: self.child_session_fd,
            session_id: self.session_id,
            log_file: self.log_file,
            log_channels: self.log_channels,
            verbose: self.verbose,
            session_args: self.session_args,
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone();
    let mut options = cli.into_options();
    if let Some(path) = config_path {
        options = options.with_file_defaults(ConfigFile::load(path)?);
    }

    let config = ServerConfig::from_options(options)?;
    logging::init(&config.logging)?;

    let shutdown = Arc::new(Notify::new());
    let shutdown_clone = shutdown.clone();
    // SIGINT, SIGTERM and SIGHUP
    if let Err(e) = ctrlc::set_handler(move || {
        shutdown_clone.notify_one();
    }) {
        warn!(error = %e, "unable to install signal handler");
    }

    tokio::select! {
        result = daemon::run(&config, Arc::new(PacketEngine)) => result,
        _ = shutdown.notified() => {
            let role = if config.is_child() { "session" } else { "listener" };
            info!(pid = std::process::id(), role, "received termination signal, shutting down");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            e.exit_code()
        }
    };

    std::process::exit(code);
}
