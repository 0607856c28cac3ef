//! Child-session entry point

use std::sync::Arc;

use tracing::{error, info};

use crate::config::ServerConfig;
use crate::errors::Result;
use crate::handoff::{recover, HandoffToken};
use crate::session::{new_session_id, run_session, SessionContext, SessionEngine};

/// Recover the inherited socket and serve its session to completion
///
/// # Errors
/// `BrokerError::Handoff` if `token` does not name an inherited socket.
pub async fn run_child_session(token: HandoffToken, config: &ServerConfig, engine: Arc<dyn SessionEngine>) -> Result<()> {
    let conn = recover(&token).map_err(|e| {
        error!(token = %token, error = %e, "failed to recover handed-off connection");
        e
    })?;

    let ports = Arc::new(config.pool.build()?);
    let session_id = config.session_id.clone().unwrap_or_else(new_session_id);
    info!(
        pid = std::process::id(),
        session = %session_id,
        peer = %conn.peer_identity(),
        "session process started"
    );

    let ctx = SessionContext::new(session_id, ports, config.port_offset, config.session_args.clone());
    run_session(engine, conn, ctx).await
}
