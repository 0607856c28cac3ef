//! # Debug Broker - connection broker for remote debugging
//!
//! Listens for debugger clients and gives each accepted connection its own
//! session process together with a debug-server port from a bounded pool.
//!
//! ## Core Principle
//!
//! **One connection, one process, one port**: the listener never runs a
//! session in server mode. It reserves a port, hands the connected socket to
//! a freshly launched copy of itself, and frees the port when that process
//! exits.
//!
//! ## Architecture
//!
//! ```text
//!   client ──connect──▶ ┌──────────────┐
//!                       │  listener    │  reserve port ─▶ PortAllocator
//!                       │  (server)    │
//!                       └──────┬───────┘
//!                 handoff token│ --child-session-fd N --session-port P
//!                              ▼
//!                       ┌──────────────┐
//!                       │ child session│  recover socket ─▶ SessionEngine
//!                       └──────────────┘
//!                              │ exit
//!                              ▼
//!                       reaper frees P
//! ```
//!
//! In single-shot mode the listener closes after the first client and runs
//! that session inline with the whole port pool.

pub mod config;
pub mod daemon;
pub mod discovery;
pub mod errors;
pub mod handoff;
pub mod logging;
pub mod net;
pub mod port;
pub mod session;

pub use config::{BrokerOptions, ConfigFile, PortPoolConfig, Role, ServeMode, ServerConfig};
pub use daemon::{run_child_session, BrokerServer, ChildArgs, Dispatch, LoopState, SessionSpawner};
pub use discovery::write_discovery_file;
pub use errors::{BrokerError, HandoffError, Result};
pub use handoff::{recover, HandoffToken, SharedSocket};
pub use logging::LogConfig;
pub use net::{Acceptor, Connection, ListenAddress};
pub use port::{PortAllocator, PortRange, PortState, ANY_PORT};
pub use session::{PacketEngine, SessionContext, SessionEngine};

/// Broker version, reported by `dbroker --version`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
