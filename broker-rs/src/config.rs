/**
 * config.rs
 * Broker configuration: optional YAML file + command-line options
 *
 * File format (every key optional, camelCase):
 * ```yaml
 * listen: "*:1234"
 * server: true
 * portOffset: 0
 * minSessionPort: 12000
 * maxSessionPort: 12010
 * # or: sessionPorts: [12000, 12001]
 * socketFile: /tmp/dbroker.port
 * logFile: /var/log/dbroker.log
 * logChannels: "broker_core=debug"
 * ```
 *
 * Command-line values override file values. The result is validated once
 * into an immutable ServerConfig before anything is opened.
 */

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{BrokerError, Result};
use crate::handoff::HandoffToken;
use crate::logging::LogConfig;
use crate::net::ListenAddress;
use crate::port::{PortAllocator, PortRange};

/// Lowest port a session may be given
pub const LOW_PORT: u16 = 1024;
/// Highest port a session may be given
pub const HIGH_PORT: u16 = 49151;

/// Command-line flag names shared by the CLI and the child launcher
pub mod flags {
    pub const LISTEN: &str = "--listen";
    pub const PORT_OFFSET: &str = "--port-offset";
    pub const SESSION_PORT: &str = "--session-port";
    pub const MIN_SESSION_PORT: &str = "--min-session-port";
    pub const MAX_SESSION_PORT: &str = "--max-session-port";
    pub const CHILD_SESSION_FD: &str = "--child-session-fd";
    pub const SESSION_ID: &str = "--session-id";
    pub const LOG_FILE: &str = "--log-file";
    pub const LOG_CHANNELS: &str = "--log-channels";
}

/// Whether the listener loops and forks, or serves one client inline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    Server,
    SingleShot,
}

/// What this process is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Owns the listening socket
    Listener(ListenAddress),
    /// Spawned by a listener to serve one handed-off connection
    ChildSession(HandoffToken),
}

/// Session port pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortPoolConfig {
    Unrestricted,
    Explicit(Vec<u16>),
    Range(PortRange),
}

impl PortPoolConfig {
    /// Build the allocator this configuration describes
    pub fn build(&self) -> Result<PortAllocator> {
        match self {
            PortPoolConfig::Unrestricted => Ok(PortAllocator::new()),
            PortPoolConfig::Explicit(ports) => Ok(PortAllocator::from_ports(ports.iter().copied())),
            PortPoolConfig::Range(range) => PortAllocator::from_range(*range),
        }
    }
}

/// Broker config file (YAML)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ConfigFile {
    pub listen: Option<String>,
    pub server: Option<bool>,
    pub port_offset: Option<u16>,
    pub session_ports: Vec<u16>,
    pub min_session_port: Option<u16>,
    pub max_session_port: Option<u16>,
    pub socket_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log_channels: Option<String>,
}

impl ConfigFile {
    /// Load a config file
    ///
    /// # Errors
    /// Missing or unreadable files and malformed YAML are configuration errors.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("Failed to read config {}: {}", path.display(), e)))?;
        let file: ConfigFile = serde_yaml::from_str(&content)?;
        Ok(file)
    }
}

/// Raw, unvalidated options as given on the command line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrokerOptions {
    pub listen: Option<String>,
    pub server: bool,
    pub port_offset: Option<u16>,
    pub session_ports: Vec<u16>,
    pub min_session_port: Option<u16>,
    pub max_session_port: Option<u16>,
    pub socket_file: Option<PathBuf>,
    pub child_session_fd: Option<String>,
    pub session_id: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_channels: Option<String>,
    pub verbose: bool,
    pub session_args: Vec<String>,
}

impl BrokerOptions {
    /// Fill anything not given on the command line from `file`
    pub fn with_file_defaults(mut self, file: ConfigFile) -> Self {
        self.listen = self.listen.or(file.listen);
        self.server = self.server || file.server.unwrap_or(false);
        self.port_offset = self.port_offset.or(file.port_offset);
        // Port-pool forms are taken from one source only so a file range
        // never collides with ports given on the command line.
        if self.session_ports.is_empty() && self.min_session_port.is_none() && self.max_session_port.is_none() {
            self.session_ports = file.session_ports;
            self.min_session_port = file.min_session_port;
            self.max_session_port = file.max_session_port;
        }
        self.socket_file = self.socket_file.or(file.socket_file);
        self.log_file = self.log_file.or(file.log_file);
        self.log_channels = self.log_channels.or(file.log_channels);
        self
    }
}

/// Validated configuration, fixed for the life of the process
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub role: Role,
    pub mode: ServeMode,
    pub port_offset: u16,
    pub pool: PortPoolConfig,
    pub discovery_file: Option<PathBuf>,
    pub logging: LogConfig,
    pub session_id: Option<String>,
    pub session_args: Vec<String>,
}

fn check_user_port(what: &str, port: u16) -> Result<u16> {
    if !(LOW_PORT..=HIGH_PORT).contains(&port) {
        return Err(BrokerError::Config(format!(
            "{} {} is not in the valid user port range of {} - {}",
            what, port, LOW_PORT, HIGH_PORT
        )));
    }
    Ok(port)
}

impl ServerConfig {
    /// Validate raw options
    ///
    /// # Errors
    /// `BrokerError::Config` for out-of-range ports, an inverted or half-given
    /// range, explicit ports combined with a range, or a missing/ambiguous role.
    pub fn from_options(options: BrokerOptions) -> Result<Self> {
        let port_offset = match options.port_offset {
            None | Some(0) => 0,
            Some(offset) => check_user_port("port offset", offset)?,
        };

        for port in &options.session_ports {
            check_user_port("port number", *port)?;
        }
        if let Some(min) = options.min_session_port {
            check_user_port("port number", min)?;
        }
        if let Some(max) = options.max_session_port {
            check_user_port("port number", max)?;
        }

        let has_range = options.min_session_port.is_some() || options.max_session_port.is_some();
        let pool = if !options.session_ports.is_empty() {
            if has_range {
                return Err(BrokerError::Config(format!(
                    "{} cannot be combined with {}/{}",
                    flags::SESSION_PORT,
                    flags::MIN_SESSION_PORT,
                    flags::MAX_SESSION_PORT
                )));
            }
            let mut ports = options.session_ports.clone();
            ports.sort_unstable();
            ports.dedup();
            PortPoolConfig::Explicit(ports)
        } else {
            match (options.min_session_port, options.max_session_port) {
                (Some(min), Some(max)) if min <= max => PortPoolConfig::Range(PortRange { start: min, end: max }),
                (Some(min), Some(max)) => {
                    return Err(BrokerError::Config(format!(
                        "{} ({}) is greater than {} ({})",
                        flags::MIN_SESSION_PORT,
                        min,
                        flags::MAX_SESSION_PORT,
                        max
                    )))
                }
                (None, None) => PortPoolConfig::Unrestricted,
                _ => {
                    return Err(BrokerError::Config(format!(
                        "{} and {} must be given together",
                        flags::MIN_SESSION_PORT,
                        flags::MAX_SESSION_PORT
                    )))
                }
            }
        };

        let role = match (options.listen.as_deref(), options.child_session_fd.as_deref()) {
            (Some(_), Some(_)) => {
                return Err(BrokerError::Config(format!(
                    "ambiguous parameters {} and {}",
                    flags::LISTEN,
                    flags::CHILD_SESSION_FD
                )))
            }
            (Some(listen), None) => Role::Listener(listen.parse()?),
            (None, Some(token)) => {
                Role::ChildSession(token.parse().map_err(|e| BrokerError::Config(format!("{}", e)))?)
            }
            (None, None) => {
                return Err(BrokerError::Config(format!("no listen address given (use {})", flags::LISTEN)))
            }
        };

        Ok(ServerConfig {
            role,
            mode: if options.server { ServeMode::Server } else { ServeMode::SingleShot },
            port_offset,
            pool,
            discovery_file: options.socket_file,
            logging: LogConfig {
                file: options.log_file,
                channels: options.log_channels,
                verbose: options.verbose,
            },
            session_id: options.session_id,
            session_args: options.session_args,
        })
    }

    pub fn is_child(&self) -> bool {
        matches!(self.role, Role::ChildSession(_))
    }
}
