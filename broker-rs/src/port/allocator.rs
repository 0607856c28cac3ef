/**
 * allocator.rs
 * Session port pool shared by the accept path and child reapers
 *
 * Every candidate port is in exactly one state:
 * - Free: available to the next connection
 * - Reserved: handed out to an in-flight spawn, no pid yet
 * - Bound(pid): owned by a live session process
 *
 * Transitions:
 * - Free -> Reserved        reserve_next_available()
 * - Reserved -> Bound(pid)  bind(port, pid)
 * - Bound(pid) -> Free      release_pid(pid), driven by child exit
 * - Reserved/Bound -> Free  release_port(port), spawn rollback
 *
 * An allocator with no candidate ports is unrestricted: every reservation
 * yields ANY_PORT and the session lets the OS pick.
 */

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use crate::errors::{BrokerError, Result};

/// Port value meaning "no fixed port, let the OS choose".
pub const ANY_PORT: u16 = 0;

/// Allocation state of a single candidate port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Free,
    Reserved,
    Bound(u32),
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Free => write!(f, "free"),
            PortState::Reserved => write!(f, "reserved"),
            PortState::Bound(pid) => write!(f, "bound to pid {}", pid),
        }
    }
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// Check if port is within this range
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Thread-safe registry of session ports
///
/// All mutation goes through one mutex. The lock is never held across
/// blocking calls, so reapers and the accept path only contend for the
/// duration of a table update.
#[derive(Debug, Default)]
pub struct PortAllocator {
    table: Mutex<BTreeMap<u16, PortState>>,
}

impl PortAllocator {
    /// Create an unrestricted allocator (no candidate ports)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator over an inclusive range
    pub fn from_range(range: PortRange) -> Result<Self> {
        if range.start == ANY_PORT || range.is_empty() {
            return Err(BrokerError::Config(format!(
                "invalid session port range {}-{}",
                range.start, range.end
            )));
        }
        Ok(Self::from_ports(range.start..=range.end))
    }

    /// Create an allocator from an explicit allow-list
    pub fn from_ports<I: IntoIterator<Item = u16>>(ports: I) -> Self {
        let allocator = Self::new();
        for port in ports {
            allocator.allow(port);
        }
        allocator
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u16, PortState>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit one more port into the Free set
    ///
    /// Re-allowing a port that is already known leaves its state untouched.
    pub fn allow(&self, port: u16) {
        if port == ANY_PORT {
            return;
        }
        self.lock().entry(port).or_insert(PortState::Free);
    }

    /// True when no candidate ports were configured
    pub fn is_unrestricted(&self) -> bool {
        self.lock().is_empty()
    }

    /// Reserve the lowest Free port
    ///
    /// # Returns
    /// The reserved port, `ANY_PORT` for an unrestricted allocator, or
    /// `None` when every candidate is Reserved or Bound.
    pub fn reserve_next_available(&self) -> Option<u16> {
        let mut table = self.lock();
        if table.is_empty() {
            return Some(ANY_PORT);
        }

        let port = table
            .iter()
            .find(|(_, state)| **state == PortState::Free)
            .map(|(port, _)| *port)?;
        table.insert(port, PortState::Reserved);
        trace!(port, "reserved session port");
        Some(port)
    }

    /// Confirm a reservation now that the owning process is known
    ///
    /// # Errors
    /// Returns an error if `port` is unknown or not currently Reserved.
    pub fn bind(&self, port: u16, pid: u32) -> Result<()> {
        if port == ANY_PORT {
            return Ok(());
        }

        let mut table = self.lock();
        match table.get_mut(&port) {
            Some(state @ PortState::Reserved) => {
                *state = PortState::Bound(pid);
                debug!(port, pid, "bound session port");
                Ok(())
            }
            Some(state) => Err(BrokerError::Port(format!(
                "cannot bind port {} to pid {}: port is {}",
                port, pid, state
            ))),
            None => Err(BrokerError::Port(format!(
                "cannot bind port {} to pid {}: port is not in the pool",
                port, pid
            ))),
        }
    }

    /// Free the port owned by `pid`
    ///
    /// Idempotent: an unknown pid, or one already released, is a no-op.
    ///
    /// # Returns
    /// The freed port, if `pid` owned one
    pub fn release_pid(&self, pid: u32) -> Option<u16> {
        let mut table = self.lock();
        let port = table
            .iter()
            .find(|(_, state)| **state == PortState::Bound(pid))
            .map(|(port, _)| *port)?;
        table.insert(port, PortState::Free);
        debug!(port, pid, "released session port");
        Some(port)
    }

    /// Free a port directly, used to roll back a failed spawn
    ///
    /// # Returns
    /// true if the port was Reserved or Bound and is now Free
    pub fn release_port(&self, port: u16) -> bool {
        let mut table = self.lock();
        match table.get_mut(&port) {
            Some(PortState::Free) | None => false,
            Some(state) => {
                if let PortState::Bound(pid) = *state {
                    warn!(port, pid, "releasing port still bound to a process");
                }
                *state = PortState::Free;
                debug!(port, "rolled back session port");
                true
            }
        }
    }

    /// Current state of a candidate port
    pub fn state(&self, port: u16) -> Option<PortState> {
        self.lock().get(&port).copied()
    }

    /// Port currently bound to `pid`, if any
    pub fn port_for_pid(&self, pid: u32) -> Option<u16> {
        self.lock()
            .iter()
            .find(|(_, state)| **state == PortState::Bound(pid))
            .map(|(port, _)| *port)
    }

    /// Copy of the whole table, ordered by port
    pub fn snapshot(&self) -> Vec<(u16, PortState)> {
        self.lock().iter().map(|(port, state)| (*port, *state)).collect()
    }

    /// Number of Free candidate ports
    pub fn free_count(&self) -> usize {
        self.lock().values().filter(|s| **s == PortState::Free).count()
    }

    /// Number of candidate ports
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
