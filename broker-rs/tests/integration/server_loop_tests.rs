//! Integration tests for the listener loop
//!
//! These start the real `dbroker` binary and talk to it over TCP and unix
//! sockets the way a debugger client would.

use std::fs;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use broker_core::session::packet::{encode_packet, read_frame, Frame};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(10);

/// Kills the broker when a test ends, pass or fail
struct Broker {
    child: Child,
}

impl Broker {
    fn start(args: &[&str]) -> Self {
        let child = Command::new(env!("CARGO_BIN_EXE_dbroker"))
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to start dbroker");
        Broker { child }
    }

    fn wait_exit(&mut self) -> ExitStatus {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            assert!(Instant::now() < deadline, "dbroker did not exit");
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn wait_for_discovery(path: &Path) -> String {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if let Ok(content) = fs::read_to_string(path) {
            if !content.is_empty() {
                return content;
            }
        }
        assert!(Instant::now() < deadline, "discovery file never appeared");
        thread::sleep(Duration::from_millis(20));
    }
}

fn connect(address: &str) -> TcpStream {
    let stream = TcpStream::connect(address).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream
}

/// Send one packet and return the reply payload
///
/// `None` when the broker closed the connection instead of answering.
fn exchange<S: Read + Write>(stream: &mut S, payload: &str) -> Option<String> {
    if stream.write_all(&encode_packet(payload)).is_err() {
        return None;
    }
    loop {
        match read_frame(stream) {
            Ok(Some(Frame::Packet { payload, valid })) => {
                assert!(valid, "bad checksum on {:?}", payload);
                stream.write_all(b"+").ok();
                return Some(payload);
            }
            Ok(Some(_)) => continue,
            Ok(None) => return None,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                panic!("no reply to {:?}", payload)
            }
            Err(_) => return None,
        }
    }
}

#[test]
fn test_server_mode_assigns_each_client_its_own_port() {
    let dir = TempDir::new().unwrap();
    let discovery = dir.path().join("port");
    let _broker = Broker::start(&[
        "--server",
        "--listen",
        "127.0.0.1:0",
        "--socket-file",
        discovery.to_str().unwrap(),
        "--session-port",
        "9000",
        "--session-port",
        "9001",
    ]);
    let address = wait_for_discovery(&discovery);

    let mut first = connect(&address);
    assert_eq!(exchange(&mut first, "qLaunchGDBServer;host:test;").as_deref(), Some("port:9000;"));

    let mut second = connect(&address);
    assert_eq!(exchange(&mut second, "qLaunchGDBServer;host:test;").as_deref(), Some("port:9001;"));

    // Pool exhausted: the third client is accepted and dropped
    let mut third = connect(&address);
    assert_eq!(exchange(&mut third, "qLaunchGDBServer;host:test;"), None);

    // Ending the first session frees 9000 for the next client
    assert_eq!(exchange(&mut first, "D").as_deref(), Some("OK"));
    drop(first);

    let deadline = Instant::now() + TIMEOUT;
    loop {
        let mut next = connect(&address);
        if let Some(reply) = exchange(&mut next, "qLaunchGDBServer;host:test;") {
            assert_eq!(reply, "port:9000;");
            break;
        }
        assert!(Instant::now() < deadline, "port 9000 was never released");
        thread::sleep(Duration::from_millis(100));
    }

    drop(second);
}

#[test]
fn test_server_mode_applies_port_offset() {
    let dir = TempDir::new().unwrap();
    let discovery = dir.path().join("port");
    let _broker = Broker::start(&[
        "--server",
        "--listen",
        "127.0.0.1:0",
        "--socket-file",
        discovery.to_str().unwrap(),
        "--min-session-port",
        "12000",
        "--max-session-port",
        "12001",
        "--port-offset",
        "2000",
    ]);
    let address = wait_for_discovery(&discovery);

    let mut client = connect(&address);
    assert_eq!(exchange(&mut client, "qLaunchGDBServer").as_deref(), Some("port:14000;"));
    // A session owns exactly one port
    assert_eq!(exchange(&mut client, "qLaunchGDBServer").as_deref(), Some("E01"));
}

#[test]
fn test_single_shot_serves_one_client_with_whole_pool() {
    let dir = TempDir::new().unwrap();
    let discovery = dir.path().join("port");
    let mut broker = Broker::start(&[
        "--listen",
        "127.0.0.1:0",
        "--socket-file",
        discovery.to_str().unwrap(),
        "--session-port",
        "9000",
        "--session-port",
        "9001",
    ]);
    let address = wait_for_discovery(&discovery);

    let mut client = connect(&address);
    assert_eq!(exchange(&mut client, "qLaunchGDBServer").as_deref(), Some("port:9000;"));
    assert_eq!(exchange(&mut client, "qLaunchGDBServer").as_deref(), Some("port:9001;"));

    // The listener closed after the first accept
    assert!(TcpStream::connect(&address).is_err());

    assert_eq!(exchange(&mut client, "D").as_deref(), Some("OK"));
    let status = broker.wait_exit();
    assert_eq!(status.code(), Some(0));
}

#[test]
fn test_discovery_file_holds_bound_address() {
    let dir = TempDir::new().unwrap();
    let discovery = dir.path().join("nested").join("port");
    let _broker = Broker::start(&["--server", "--listen", "127.0.0.1:0", "--socket-file", discovery.to_str().unwrap()]);

    let content = wait_for_discovery(&discovery);
    let addr: std::net::SocketAddr = content.parse().unwrap();

    assert!(addr.ip().is_loopback());
    assert_ne!(addr.port(), 0);
    assert!(TcpStream::connect(addr).is_ok());
}

#[cfg(unix)]
#[test]
fn test_unix_socket_listener_hands_off_connections() {
    use std::os::unix::net::UnixStream;

    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("broker.sock");
    let discovery = dir.path().join("socket-id");
    let listen = format!("unix://{}", socket.display());
    let _broker = Broker::start(&["--server", "--listen", &listen, "--socket-file", discovery.to_str().unwrap()]);

    assert_eq!(wait_for_discovery(&discovery), socket.display().to_string());

    let mut client = UnixStream::connect(&socket).unwrap();
    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    // No pool configured: the debug server picks its own port
    assert_eq!(exchange(&mut client, "qLaunchGDBServer").as_deref(), Some("port:0;"));
    assert_eq!(exchange(&mut client, "D").as_deref(), Some("OK"));
}
