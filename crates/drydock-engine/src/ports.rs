//! Host-port allocator.
//!
//! Ports are handed out from a configured range. A reservation set keeps
//! concurrent deploys from racing each other; binding a listener right
//! before reserving keeps us from racing processes outside our control.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

/// Errors from the port allocator.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free ports available in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
}

/// Allocates host ports for new containers.
pub struct PortAllocator {
    start: u16,
    end: u16,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Allocator over the half-open range `[start, end)`.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve a free port.
    ///
    /// Each candidate is re-verified against the OS listener table by
    /// binding it just before reservation, so a port grabbed by an
    /// unmanaged process since the last scan is skipped.
    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        for port in self.start..self.end {
            if reserved.contains(&port) {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", port)).is_err() {
                continue;
            }
            // The verification listener is dropped here; the reservation
            // keeps other deploys off the port until the container binds it.
            reserved.insert(port);
            debug!(port, "port allocated");
            return Ok(port);
        }
        Err(PortError::Exhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Return a port to the pool. No-op if it was not reserved.
    pub fn release(&self, port: u16) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        if reserved.remove(&port) {
            debug!(port, "port released");
        }
    }

    /// Mark a port reserved without verification (process-restart
    /// recovery: the port is already bound by a tracked container).
    pub fn mark_reserved(&self, port: u16) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        reserved.insert(port);
    }
}
