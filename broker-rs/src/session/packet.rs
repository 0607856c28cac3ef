//! Reference session engine
//!
//! Minimal gdb-remote framing: enough for a client to connect, learn which
//! debug-server port its session owns, and detach. Everything else gets the
//! empty "unsupported" reply.

use std::io::{self, BufReader, Read, Write};

use tracing::{debug, info, info_span, warn};

use super::{SessionContext, SessionEngine};
use crate::errors::Result;
use crate::net::Connection;
use crate::port::ANY_PORT;

const INTERRUPT: u8 = 0x03;

/// One unit read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Nack,
    Interrupt,
    Packet { payload: String, valid: bool },
}

/// What the engine does after a packet
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Send(String),
    SendAndEnd(String),
    End,
}

/// Modulo-256 sum of the payload bytes
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Encode `payload` as `$payload#cs`
pub fn encode_packet(payload: &str) -> Vec<u8> {
    format!("${}#{:02x}", payload, checksum(payload.as_bytes())).into_bytes()
}

fn read_byte<R: Read>(reader: &mut R) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Read the next frame, skipping line noise. `None` at end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Frame>> {
    loop {
        let byte = match read_byte(reader)? {
            Some(b) => b,
            None => return Ok(None),
        };
        match byte {
            b'+' => return Ok(Some(Frame::Ack)),
            b'-' => return Ok(Some(Frame::Nack)),
            INTERRUPT => return Ok(Some(Frame::Interrupt)),
            b'$' => break,
            _ => continue,
        }
    }

    let mut payload = Vec::new();
    loop {
        match read_byte(reader)? {
            Some(b'#') => break,
            Some(b) => payload.push(b),
            None => return Ok(None),
        }
    }

    let mut digits = [0u8; 2];
    for digit in digits.iter_mut() {
        *digit = match read_byte(reader)? {
            Some(b) => b,
            None => return Ok(None),
        };
    }

    let expected = std::str::from_utf8(&digits)
        .ok()
        .and_then(|hex| u8::from_str_radix(hex, 16).ok());
    let valid = expected == Some(checksum(&payload));

    Ok(Some(Frame::Packet {
        payload: String::from_utf8_lossy(&payload).into_owned(),
        valid,
    }))
}

fn respond(payload: &str, ctx: &SessionContext) -> Reply {
    if payload.starts_with("qLaunchGDBServer") {
        return match ctx.ports.reserve_next_available() {
            Some(ANY_PORT) => Reply::Send(format!("port:{};", ANY_PORT)),
            Some(port) => match port.checked_add(ctx.port_offset) {
                Some(presented) => Reply::Send(format!("port:{};", presented)),
                None => {
                    ctx.ports.release_port(port);
                    Reply::Send("E02".to_string())
                }
            },
            None => Reply::Send("E01".to_string()),
        };
    }

    match payload {
        "k" => Reply::End,
        p if p == "D" || p.starts_with("D;") => Reply::SendAndEnd("OK".to_string()),
        _ => Reply::Send(String::new()),
    }
}

/// Built-in engine used by the `dbroker` binary
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketEngine;

impl SessionEngine for PacketEngine {
    fn run(&self, conn: Connection, ctx: SessionContext) -> Result<()> {
        let span = info_span!("session", id = %ctx.session_id);
        let _enter = span.enter();

        let peer = conn.peer_identity();
        info!(%peer, args = ?ctx.args, "session started");

        let mut reader = BufReader::new(conn.try_clone()?);
        let mut writer = conn;

        while let Some(frame) = read_frame(&mut reader)? {
            let (payload, valid) = match frame {
                Frame::Packet { payload, valid } => (payload, valid),
                Frame::Nack => {
                    warn!("client rejected last packet");
                    continue;
                }
                Frame::Ack | Frame::Interrupt => continue,
            };

            if !valid {
                debug!(%payload, "bad checksum");
                writer.write_all(b"-")?;
                continue;
            }
            writer.write_all(b"+")?;
            debug!(%payload, "packet");

            match respond(&payload, &ctx) {
                Reply::Send(response) => writer.write_all(&encode_packet(&response))?,
                Reply::SendAndEnd(response) => {
                    writer.write_all(&encode_packet(&response))?;
                    break;
                }
                Reply::End => break,
            }
            writer.flush()?;
        }

        writer.flush().ok();
        writer.shutdown();
        info!(%peer, "Disconnected.");
        Ok(())
    }
}
