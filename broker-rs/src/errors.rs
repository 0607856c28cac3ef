//! Error types for the debug broker

use std::os::raw::c_int;
use std::path::PathBuf;
use thiserror::Error;

/// Exit code for an unexpected failure.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for invalid configuration (bad port range, conflicting flags).
pub const EXIT_CONFIG: i32 = 2;
/// Exit code when the listening socket cannot be created or bound.
pub const EXIT_LISTEN: i32 = 3;
/// Exit code when the discovery file cannot be written.
pub const EXIT_DISCOVERY_FILE: i32 = 4;
/// Exit code for a child session that could not recover its socket.
pub const EXIT_HANDOFF: i32 = 5;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No available session port for connection")]
    PortExhausted,

    #[error("Port error: {0}")]
    Port(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Handoff error: {0}")]
    Handoff(#[from] HandoffError),

    #[error("Failed to listen on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write socket id to {}: {source}", path.display())]
    DiscoveryFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Session error: {0}")]
    Session(String),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Failures moving a connected socket into a session process.
#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("invalid handoff token: {0:?}")]
    InvalidToken(String),

    #[error("descriptor {0} is not open")]
    InvalidHandle(c_int),

    #[error("descriptor {0} is not a socket")]
    NotASocket(c_int),

    #[error("descriptor {fd} has unsupported address family {family}")]
    UnsupportedFamily { fd: c_int, family: String },

    #[error("invalid pid {0}")]
    InvalidPid(u32),

    #[error("failed to release parent copy of the socket: {0}")]
    Complete(String),

    #[error("failed to recover inherited socket: {0}")]
    Recover(String),

    #[error("failed to duplicate socket: {0}")]
    Prepare(#[source] std::io::Error),

    #[error("socket handoff is not supported on this platform")]
    Unsupported,
}

impl BrokerError {
    /// Process exit code for this error when it ends the broker.
    pub fn exit_code(&self) -> i32 {
        match self {
            BrokerError::Config(_) | BrokerError::Yaml(_) => EXIT_CONFIG,
            BrokerError::Listen { .. } => EXIT_LISTEN,
            BrokerError::DiscoveryFile { .. } => EXIT_DISCOVERY_FILE,
            BrokerError::Handoff(_) => EXIT_HANDOFF,
            _ => EXIT_FAILURE,
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
