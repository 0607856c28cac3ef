/**
 * spawner.rs
 * Launches one session process per accepted connection
 *
 * Ordering per connection:
 *   1. duplicate the socket (close-on-exec, so concurrent spawns never see it)
 *   2. launch the broker binary in child-session mode, inheriting the duplicate
 *   3. bind the reserved port to the new pid
 *   4. start the reaper task that frees the port when the pid exits
 *   5. close the parent's duplicate
 *
 * Binding happens before the reaper starts, so a child that exits at once
 * still has its port released.
 */

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::{flags, ServerConfig};
use crate::errors::{BrokerError, Result};
use crate::handoff::{HandoffToken, SharedSocket};
use crate::net::Connection;
use crate::port::{PortAllocator, ANY_PORT};
use crate::session::new_session_id;

/// Settings every child session inherits from the listener
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildArgs {
    pub port_offset: u16,
    pub log_file: Option<PathBuf>,
    pub log_channels: Option<String>,
    pub verbose: bool,
    pub session_args: Vec<String>,
}

impl ChildArgs {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            port_offset: config.port_offset,
            log_file: config.logging.file.clone(),
            log_channels: config.logging.channels.clone(),
            verbose: config.logging.verbose,
            session_args: config.session_args.clone(),
        }
    }

    /// Command line for a child serving `token` with session port `port`
    pub fn to_args(&self, token: HandoffToken, port: u16, session_id: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            flags::CHILD_SESSION_FD.into(),
            token.to_string().into(),
            flags::SESSION_ID.into(),
            session_id.into(),
        ];
        if port != ANY_PORT {
            args.push(flags::SESSION_PORT.into());
            args.push(port.to_string().into());
        }
        if self.port_offset > 0 {
            args.push(flags::PORT_OFFSET.into());
            args.push(self.port_offset.to_string().into());
        }
        if let Some(file) = &self.log_file {
            args.push(flags::LOG_FILE.into());
            args.push(file.as_os_str().to_owned());
        }
        if let Some(channels) = &self.log_channels {
            args.push(flags::LOG_CHANNELS.into());
            args.push(channels.into());
        }
        if self.verbose {
            args.push("--verbose".into());
        }
        args.push("--".into());
        args.extend(self.session_args.iter().map(OsString::from));
        args
    }
}

/// Launches session processes and tracks them until they exit
pub struct SessionSpawner {
    program: PathBuf,
    ports: Arc<PortAllocator>,
    child_args: ChildArgs,
}

impl SessionSpawner {
    pub fn new(program: impl Into<PathBuf>, ports: Arc<PortAllocator>, child_args: ChildArgs) -> Self {
        Self {
            program: program.into(),
            ports,
            child_args,
        }
    }

    /// Spawner that re-executes the running binary
    pub fn current_exe(ports: Arc<PortAllocator>, child_args: ChildArgs) -> Result<Self> {
        let current_exe = std::env::current_exe()
            .map_err(|e| BrokerError::Spawn(format!("Failed to get current executable path: {}", e)))?;
        // Resolve symlinks so children run the same binary even if the link changes
        let program = std::fs::canonicalize(&current_exe).unwrap_or(current_exe);
        Ok(Self::new(program, ports, child_args))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Hand `conn` to a new session process that owns `port`
    ///
    /// `port` must already be reserved. On success the port is bound to the
    /// returned pid and is freed automatically when that process exits. On
    /// failure the reservation is left to the caller.
    pub fn spawn(&self, conn: &Connection, port: u16) -> Result<u32> {
        let shared = SharedSocket::prepare(conn)?;
        let session_id = new_session_id();
        let args = self.child_args.to_args(shared.token(), port, &session_id);

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        // SAFETY: the hook only calls fcntl on a descriptor this process owns.
        unsafe {
            command.pre_exec(shared.inherit_in_child());
        }

        let mut child = command.spawn().map_err(|e| {
            BrokerError::Spawn(format!("Failed to launch {}: {}", self.program.display(), e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| BrokerError::Spawn("session process exited before it was tracked".to_string()))?;

        let bound = self.ports.bind(port, pid);

        let ports = Arc::clone(&self.ports);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(pid, %status, "session process exited"),
                Err(e) => warn!(pid, error = %e, "failed to wait for session process"),
            }
            if let Some(port) = ports.release_pid(pid) {
                info!(pid, port, "session ended, port released");
            }
        });

        if let Err(e) = bound {
            terminate(pid);
            return Err(e);
        }

        if let Err(e) = shared.complete(pid) {
            error!(pid, error = %e, "handoff failed, terminating session process");
            terminate(pid);
            return Err(e.into());
        }

        info!(pid, port, session = %session_id, "launched session process");
        Ok(pid)
    }
}

/// Send SIGTERM to a session process
#[cfg(unix)]
fn terminate(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> bool {
    warn!(pid, "SIGTERM not supported on this platform");
    false
}
