// Daemon Module - listener loop, session launcher, and child entry point
//
// One binary plays both roles:
// 1. Listener: accepts clients and hands each one to a new session process
// 2. Child session: recovers the handed-off socket and runs the session

pub mod child;
pub mod server;
pub mod spawner;

use std::sync::Arc;

pub use child::run_child_session;
pub use server::{BrokerServer, Dispatch, LoopState};
pub use spawner::{ChildArgs, SessionSpawner};

use crate::config::{Role, ServerConfig};
use crate::errors::Result;
use crate::session::SessionEngine;

/// Run whichever role `config` selects until it finishes
pub async fn run(config: &ServerConfig, engine: Arc<dyn SessionEngine>) -> Result<()> {
    match &config.role {
        Role::ChildSession(token) => run_child_session(*token, config, engine).await,
        Role::Listener(_) => BrokerServer::bind(config, engine).await?.run().await,
    }
}
