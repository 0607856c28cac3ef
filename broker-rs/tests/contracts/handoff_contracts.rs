// Socket Handoff Contract Tests
//
// These tests verify INVARIANTS of moving a connected socket into a session
// process. A broken handoff either leaks descriptors into unrelated children
// or leaves a client talking to nobody.

#![cfg(unix)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::net::UnixStream;

use broker_core::errors::HandoffError;
use broker_core::handoff::{recover, HandoffToken, SharedSocket};
use broker_core::net::Connection;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};

fn tcp_pair() -> (Connection, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (Connection::Tcp(server), client)
}

fn is_cloexec(fd: i32) -> bool {
    let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
    FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC)
}

/// WHY: The prepared duplicate is close-on-exec until the target child forks
/// REASON: Sessions are launched concurrently from one listener
/// BREAKS: Every child would inherit every other client's socket
/// SACRIFICES: If this fails, a client's connection outlives its own session
#[test]
fn prepared_socket_is_not_inheritable_by_default() {
    let (conn, _client) = tcp_pair();
    let shared = SharedSocket::prepare(&conn).unwrap();

    assert!(is_cloexec(shared.token().raw()));
    assert_ne!(shared.token().raw(), conn.as_raw_fd());
}

/// WHY: The token is the only thing a child needs to find its socket
/// REASON: The token travels on the child's command line as plain text
/// BREAKS: Children cannot recover the connection
/// SACRIFICES: If this fails, every spawned session exits immediately
#[test]
fn token_round_trips_through_text() {
    let (conn, _client) = tcp_pair();
    let shared = SharedSocket::prepare(&conn).unwrap();
    let token = shared.token();

    let parsed: HandoffToken = token.to_string().parse().unwrap();
    assert_eq!(parsed, token);
}

/// WHY: The recovered connection is the same connection the client opened
/// REASON: The client never reconnects; the child continues the conversation
/// BREAKS: Client sees its connection reset after the handoff
/// SACRIFICES: If this fails, server mode serves no one
#[test]
fn recovered_connection_talks_to_original_client() {
    let (conn, mut client) = tcp_pair();
    let peer = conn.peer_identity();

    // Simulate a child: the raw descriptor is all that crosses the exec
    let duplicate = match &conn {
        Connection::Tcp(stream) => stream.try_clone().unwrap().into_raw_fd(),
        _ => unreachable!(),
    };
    drop(conn);

    let mut recovered = recover(&HandoffToken::new(duplicate)).unwrap();
    assert_eq!(recovered.peer_identity(), peer);

    client.write_all(b"$?#3f").unwrap();
    let mut buf = [0u8; 5];
    recovered.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"$?#3f");
}

/// WHY: A recovered socket goes back to close-on-exec
/// REASON: Sessions launch debug servers of their own
/// BREAKS: Debug servers hold the client socket open after the session ends
/// SACRIFICES: If this fails, clients hang instead of seeing a disconnect
#[test]
fn recovered_socket_is_not_leaked_to_grandchildren() {
    let (a, _b) = UnixStream::pair().unwrap();
    let fd = a.into_raw_fd();
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).unwrap();

    let _recovered = recover(&HandoffToken::new(fd)).unwrap();
    assert!(is_cloexec(fd));
}

/// WHY: A bad token is reported, not trusted
/// REASON: The descriptor number may name nothing or a non-socket
/// BREAKS: A child would read from a file it was never meant to own
/// SACRIFICES: If this fails, handoff errors surface as protocol garbage
#[test]
fn bad_tokens_are_rejected() {
    assert!(matches!(
        recover(&HandoffToken::new(1 << 20)),
        Err(HandoffError::InvalidHandle(_))
    ));

    let file = tempfile::tempfile().unwrap();
    assert!(matches!(
        recover(&HandoffToken::new(file.as_raw_fd())),
        Err(HandoffError::NotASocket(_))
    ));

    assert!(matches!("-4".parse::<HandoffToken>(), Err(HandoffError::InvalidToken(_))));
}

/// WHY: Completing a handoff requires a real child pid
/// REASON: pid 0 means the launch never produced a process
/// BREAKS: Parent closes its copy with nobody holding the other end
/// SACRIFICES: If this fails, failed launches silently drop clients
#[test]
fn complete_rejects_pid_zero() {
    let (conn, _client) = tcp_pair();
    let shared = SharedSocket::prepare(&conn).unwrap();

    assert!(matches!(shared.complete(0), Err(HandoffError::InvalidPid(0))));
}
