/**
 * server.rs
 * Listener loop: accept, reserve a port, hand the connection to a child
 *
 * Server mode loops forever and never runs a session itself. Single-shot
 * mode closes the listener after the first client and runs that session
 * inline with the whole port pool.
 */

use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::{Role, ServeMode, ServerConfig};
use crate::daemon::spawner::{ChildArgs, SessionSpawner};
use crate::discovery::write_discovery_file;
use crate::errors::{BrokerError, Result};
use crate::net::{Acceptor, Connection, DEFAULT_BACKLOG};
use crate::port::PortAllocator;
use crate::session::{new_session_id, run_session, SessionContext, SessionEngine};

/// Where the loop is, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Listening,
    Accepting,
    SpawningChild,
    RunningInline,
    Terminated,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Listening => "listening",
            LoopState::Accepting => "accepting",
            LoopState::SpawningChild => "spawning-child",
            LoopState::RunningInline => "running-inline",
            LoopState::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

/// What happened to one accepted connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to a session process owning `port`
    Spawned { port: u16, pid: u32 },
    /// Closed without a session
    Dropped { reason: String },
    /// Served in this process; the listener is gone
    Inline,
}

pub struct BrokerServer {
    acceptor: Option<Acceptor>,
    ports: Arc<PortAllocator>,
    spawner: SessionSpawner,
    engine: Arc<dyn SessionEngine>,
    mode: ServeMode,
    port_offset: u16,
    session_args: Vec<String>,
    state: LoopState,
}

impl BrokerServer {
    pub fn new(
        acceptor: Acceptor,
        ports: Arc<PortAllocator>,
        spawner: SessionSpawner,
        engine: Arc<dyn SessionEngine>,
    ) -> Self {
        Self {
            acceptor: Some(acceptor),
            ports,
            spawner,
            engine,
            mode: ServeMode::Server,
            port_offset: 0,
            session_args: Vec::new(),
            state: LoopState::Listening,
        }
    }

    pub fn mode(mut self, mode: ServeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn port_offset(mut self, offset: u16) -> Self {
        self.port_offset = offset;
        self
    }

    pub fn session_args(mut self, args: Vec<String>) -> Self {
        self.session_args = args;
        self
    }

    /// Open the listener described by `config` and publish its identity
    ///
    /// # Errors
    /// Configuration errors come first, before any socket is opened. Then
    /// `BrokerError::Listen` or `BrokerError::DiscoveryFile`.
    pub async fn bind(config: &ServerConfig, engine: Arc<dyn SessionEngine>) -> Result<Self> {
        let address = match &config.role {
            Role::Listener(address) => address,
            Role::ChildSession(_) => {
                return Err(BrokerError::Config("a child session does not listen".to_string()))
            }
        };
        let ports = Arc::new(config.pool.build()?);
        let spawner = SessionSpawner::current_exe(Arc::clone(&ports), ChildArgs::from_config(config))?;
        debug!(program = %spawner.program().display(), "session processes will run");

        let acceptor = Acceptor::listen(address, DEFAULT_BACKLOG).await?;
        if let Some(path) = &config.discovery_file {
            write_discovery_file(path, acceptor.local_identity())?;
        }

        Ok(Self::new(acceptor, ports, spawner, engine)
            .mode(config.mode)
            .port_offset(config.port_offset)
            .session_args(config.session_args.clone()))
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Bound listen identity, while the listener is open
    pub fn local_identity(&self) -> Option<&str> {
        self.acceptor.as_ref().map(|a| a.local_identity())
    }

    fn transition(&mut self, next: LoopState) {
        debug!(from = %self.state, to = %next, "loop state");
        self.state = next;
    }

    /// Accept and dispatch one connection
    ///
    /// # Errors
    /// Accept failures, and in single-shot mode the inline session's error.
    pub async fn serve_one(&mut self) -> Result<Dispatch> {
        let acceptor = self
            .acceptor
            .as_ref()
            .ok_or_else(|| BrokerError::Session("listener is closed".to_string()))?;
        self.state = LoopState::Accepting;
        let accepted = acceptor.accept().await;
        let conn = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                self.transition(LoopState::Listening);
                return Err(e);
            }
        };
        info!(peer = %conn.peer_identity(), "Connection established.");

        match self.mode {
            ServeMode::Server => {
                let dispatch = self.dispatch_to_child(conn);
                self.transition(LoopState::Listening);
                Ok(dispatch)
            }
            ServeMode::SingleShot => {
                // Later clients are refused rather than queued
                self.acceptor = None;
                self.transition(LoopState::RunningInline);
                let ctx = SessionContext::new(
                    new_session_id(),
                    Arc::clone(&self.ports),
                    self.port_offset,
                    self.session_args.clone(),
                );
                let result = run_session(Arc::clone(&self.engine), conn, ctx).await;
                self.transition(LoopState::Terminated);
                result.map(|_| Dispatch::Inline)
            }
        }
    }

    fn dispatch_to_child(&mut self, conn: Connection) -> Dispatch {
        let port = match self.ports.reserve_next_available() {
            Some(port) => port,
            None => {
                let reason = BrokerError::PortExhausted.to_string();
                warn!(peer = %conn.peer_identity(), "{} - dropping it", reason);
                debug!(pool = ?self.ports.snapshot(), "port table");
                return Dispatch::Dropped { reason };
            }
        };

        self.transition(LoopState::SpawningChild);
        match self.spawner.spawn(&conn, port) {
            Ok(pid) => Dispatch::Spawned { port, pid },
            Err(e) => {
                self.ports.release_port(port);
                error!(port, error = %e, "failed to launch session - dropping connection");
                Dispatch::Dropped { reason: e.to_string() }
            }
        }
    }

    /// Serve until the single-shot session ends or accepting fails
    pub async fn run(mut self) -> Result<()> {
        loop {
            match self.serve_one().await {
                Ok(Dispatch::Inline) => break,
                Ok(Dispatch::Spawned { .. }) | Ok(Dispatch::Dropped { .. }) => continue,
                Err(BrokerError::Io(e)) if is_transient(&e) => {
                    warn!(error = %e, "accept failed, continuing");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        info!("session finished, exiting");
        Ok(())
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
