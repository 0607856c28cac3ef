//! Session protocol engine seam
//!
//! The broker never speaks the debug protocol itself. Once it owns a
//! connected socket, inline or in a child, it hands that socket to a
//! [`SessionEngine`] and waits for the session to end.

pub mod packet;

use std::sync::Arc;

use tracing::Instrument;

use crate::errors::{BrokerError, Result};
use crate::net::Connection;
use crate::port::PortAllocator;

pub use packet::PacketEngine;

/// Everything a session needs besides its socket
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Correlation id shared by the broker and the session's logs
    pub session_id: String,
    /// Ports this session may hand out to debug servers it starts
    pub ports: Arc<PortAllocator>,
    /// Added to every port before it is reported to the client
    pub port_offset: u16,
    /// Arguments after `--`, opaque to the broker
    pub args: Vec<String>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, ports: Arc<PortAllocator>, port_offset: u16, args: Vec<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ports,
            port_offset,
            args,
        }
    }
}

/// Runs one session to completion over a connected socket
///
/// `run` blocks until the client disconnects or the session ends itself.
pub trait SessionEngine: Send + Sync {
    fn run(&self, conn: Connection, ctx: SessionContext) -> Result<()>;
}

impl<F> SessionEngine for F
where
    F: Fn(Connection, SessionContext) -> Result<()> + Send + Sync,
{
    fn run(&self, conn: Connection, ctx: SessionContext) -> Result<()> {
        self(conn, ctx)
    }
}

/// Fresh session id
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Run `engine` on a blocking worker and wait for the session to end
pub async fn run_session(engine: Arc<dyn SessionEngine>, conn: Connection, ctx: SessionContext) -> Result<()> {
    let span = tracing::info_span!("inline", session = %ctx.session_id);
    tokio::task::spawn_blocking(move || engine.run(conn, ctx))
        .instrument(span)
        .await
        .map_err(|e| BrokerError::Session(format!("session task failed: {}", e)))?
}
