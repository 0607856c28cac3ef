//! CLI tests: argument validation, exit codes, config files and signals

use std::fs;
use std::net::TcpListener;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use broker_core::errors::{EXIT_CONFIG, EXIT_DISCOVERY_FILE, EXIT_LISTEN};
use tempfile::TempDir;

fn dbroker(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dbroker"))
        .args(args)
        .stdin(Stdio::null())
        .output()
        .expect("failed to run dbroker")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_version() {
    let output = dbroker(&["--version"]);

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_missing_listen_address() {
    let output = dbroker(&[]);

    assert_eq!(output.status.code(), Some(EXIT_CONFIG));
    assert!(stderr(&output).contains("no listen address"));
}

#[test]
fn test_inverted_port_range() {
    let output = dbroker(&[
        "--listen",
        "127.0.0.1:0",
        "--min-session-port",
        "9010",
        "--max-session-port",
        "9000",
    ]);

    assert_eq!(output.status.code(), Some(EXIT_CONFIG));
    assert!(stderr(&output).contains("is greater than"));
}

#[test]
fn test_port_outside_user_range() {
    let output = dbroker(&["--listen", "127.0.0.1:0", "--session-port", "80"]);

    assert_eq!(output.status.code(), Some(EXIT_CONFIG));
    assert!(stderr(&output).contains("1024 - 49151"));
}

#[test]
fn test_explicit_ports_and_range_conflict() {
    let output = dbroker(&[
        "--listen",
        "127.0.0.1:0",
        "-P",
        "9000",
        "-m",
        "9001",
        "-M",
        "9002",
    ]);

    assert_eq!(output.status.code(), Some(EXIT_CONFIG));
}

#[test]
fn test_listen_and_child_fd_are_ambiguous() {
    let output = dbroker(&["--listen", "127.0.0.1:0", "--child-session-fd", "3"]);

    assert_eq!(output.status.code(), Some(EXIT_CONFIG));
    assert!(stderr(&output).contains("ambiguous"));
}

#[test]
fn test_malformed_listen_address() {
    let output = dbroker(&["--listen", "fe80::1:1234"]);

    assert_eq!(output.status.code(), Some(EXIT_CONFIG));
}

#[test]
fn test_busy_listen_port() {
    let holder = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = holder.local_addr().unwrap().to_string();

    let output = dbroker(&["--server", "--listen", &address]);

    assert_eq!(output.status.code(), Some(EXIT_LISTEN));
}

#[test]
fn test_unwritable_discovery_file() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("file");
    fs::write(&blocker, "not a directory").unwrap();
    let discovery = blocker.join("port");

    let output = dbroker(&["--server", "--listen", "127.0.0.1:0", "--socket-file", discovery.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(EXIT_DISCOVERY_FILE));
}

#[test]
fn test_config_file_with_unknown_key() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("broker.yaml");
    fs::write(&config, "listen: \"127.0.0.1:0\"\nsessionPortz: [9000]\n").unwrap();

    let output = dbroker(&["--config", config.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(EXIT_CONFIG));
}

#[test]
fn test_config_file_values_are_validated() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("broker.yaml");
    fs::write(&config, "listen: \"127.0.0.1:0\"\nminSessionPort: 9010\nmaxSessionPort: 9000\n").unwrap();

    let output = dbroker(&["--config", config.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(EXIT_CONFIG));
    assert!(stderr(&output).contains("is greater than"));
}

#[cfg(unix)]
#[test]
fn test_sigterm_shuts_down_cleanly() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let dir = TempDir::new().unwrap();
    let discovery = dir.path().join("port");
    let mut broker = Command::new(env!("CARGO_BIN_EXE_dbroker"))
        .args(["--server", "--listen", "127.0.0.1:0", "--socket-file", discovery.to_str().unwrap()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !discovery.exists() {
        assert!(Instant::now() < deadline, "broker never started listening");
        thread::sleep(Duration::from_millis(20));
    }

    kill(Pid::from_raw(broker.id() as i32), Signal::SIGTERM).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = broker.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            let _ = broker.kill();
            panic!("broker ignored SIGTERM");
        }
        thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(status.code(), Some(0));
}
