//! Socket handoff between the broker and a session process
//!
//! A connected socket moves into a child in three phases:
//!
//! 1. [`SharedSocket::prepare`] duplicates the socket in the parent. The
//!    duplicate keeps close-on-exec set so no unrelated child can inherit it.
//! 2. The spawner installs [`SharedSocket::inherit_in_child`] as a pre-exec
//!    hook, which clears close-on-exec in the forked child only, and passes
//!    [`SharedSocket::token`] on the child's command line.
//! 3. After launch, [`SharedSocket::complete`] closes the parent's duplicate.
//!    Inside the child, [`recover`] turns the token back into a
//!    [`Connection`](crate::net::Connection).
//!
//! If launch fails, dropping the `SharedSocket` closes the duplicate and the
//! parent still owns the original connection.

use std::fmt;
use std::str::FromStr;

use crate::errors::HandoffError;

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::{recover, SharedSocket};

/// Serialized socket handle passed to a session process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffToken(i32);

impl HandoffToken {
    pub fn new(raw: i32) -> Self {
        HandoffToken(raw)
    }

    pub fn raw(&self) -> i32 {
        self.0
    }
}

impl FromStr for HandoffToken {
    type Err = HandoffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<i32>() {
            Ok(raw) if raw >= 0 => Ok(HandoffToken(raw)),
            _ => Err(HandoffError::InvalidToken(s.to_string())),
        }
    }
}

impl fmt::Display for HandoffToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(not(unix))]
mod unsupported {
    use super::HandoffToken;
    use crate::errors::HandoffError;
    use crate::net::Connection;

    pub struct SharedSocket;

    impl SharedSocket {
        pub fn prepare(_conn: &Connection) -> Result<Self, HandoffError> {
            Err(HandoffError::Unsupported)
        }

        pub fn token(&self) -> HandoffToken {
            HandoffToken::new(-1)
        }

        pub fn complete(self, _child_pid: u32) -> Result<(), HandoffError> {
            Err(HandoffError::Unsupported)
        }
    }

    pub fn recover(_token: &HandoffToken) -> Result<Connection, HandoffError> {
        Err(HandoffError::Unsupported)
    }
}

#[cfg(not(unix))]
pub use unsupported::{recover, SharedSocket};
