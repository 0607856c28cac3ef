//! Unix implementation: descriptor inheritance across exec

use std::io;
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{getsockname, AddressFamily, SockaddrLike, SockaddrStorage};
use tracing::debug;

use super::HandoffToken;
use crate::errors::HandoffError;
use crate::net::Connection;

/// Parent-side duplicate of a connection awaiting handoff
#[derive(Debug)]
pub struct SharedSocket {
    fd: OwnedFd,
}

impl SharedSocket {
    /// Duplicate `conn` for transfer to a process that does not exist yet
    pub fn prepare(conn: &Connection) -> Result<Self, HandoffError> {
        let fd = conn.as_fd().try_clone_to_owned().map_err(HandoffError::Prepare)?;
        Ok(Self { fd })
    }

    /// Token to pass to the child on its command line
    pub fn token(&self) -> HandoffToken {
        HandoffToken::new(self.raw())
    }

    fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Pre-exec hook making the duplicate inheritable in the forked child
    ///
    /// Runs between fork and exec, so it only calls fcntl.
    pub fn inherit_in_child(&self) -> impl FnMut() -> io::Result<()> + Send + Sync + 'static {
        let fd = self.raw();
        move || {
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))
                .map(drop)
                .map_err(io::Error::from)
        }
    }

    /// Close the parent's duplicate once `child_pid` holds its own copy
    pub fn complete(self, child_pid: u32) -> Result<(), HandoffError> {
        if child_pid == 0 {
            return Err(HandoffError::InvalidPid(child_pid));
        }
        let fd = self.fd.into_raw_fd();
        nix::unistd::close(fd).map_err(|e| HandoffError::Complete(format!("close({}): {}", fd, e)))?;
        debug!(fd, child_pid, "handed socket to child");
        Ok(())
    }
}

fn recover_failed(fd: RawFd, errno: Errno) -> HandoffError {
    HandoffError::Recover(format!("fcntl({}): {}", fd, errno))
}

/// Rebuild a connection from an inherited descriptor
///
/// Takes ownership of the descriptor named by `token`. It is marked
/// close-on-exec again so it does not leak into processes the session starts.
pub fn recover(token: &HandoffToken) -> Result<Connection, HandoffError> {
    let fd = token.raw();

    match fcntl(fd, FcntlArg::F_GETFD) {
        Ok(_) => {}
        Err(Errno::EBADF) => return Err(HandoffError::InvalidHandle(fd)),
        Err(e) => return Err(recover_failed(fd, e)),
    }

    let local: SockaddrStorage = getsockname(fd).map_err(|e| match e {
        Errno::ENOTSOCK => HandoffError::NotASocket(fd),
        _ => HandoffError::InvalidHandle(fd),
    })?;

    // SAFETY: the descriptor is open, is a socket, and was passed to this
    // process for its exclusive use; nothing else in the process owns it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| recover_failed(fd, e))?;

    match local.family() {
        Some(AddressFamily::Inet) | Some(AddressFamily::Inet6) => Ok(Connection::Tcp(TcpStream::from(owned))),
        Some(AddressFamily::Unix) => Ok(Connection::Unix(UnixStream::from(owned))),
        other => Err(HandoffError::UnsupportedFamily {
            fd,
            family: format!("{:?}", other),
        }),
    }
}
