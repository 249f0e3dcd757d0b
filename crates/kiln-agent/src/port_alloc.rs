use std::{
    collections::BTreeSet,
    io::ErrorKind,
    net::TcpListener,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::error::{Result, SupervisorError};

/// Hands out TCP ports and remembers which ones are held by live servers.
///
/// The bind probe and the insertion into the reservation set happen under the
/// same lock, so two concurrent callers can never both observe a port as free.
#[derive(Clone, Debug)]
pub struct PortAllocator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    bind_host: String,
    reserved: Mutex<BTreeSet<u16>>,
}

impl Inner {
    fn reserved(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A reserved port. Dropping the lease makes the port allocatable again.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    inner: Arc<Inner>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.inner.reserved().remove(&self.port);
        tracing::debug!(port = self.port, "port released");
    }
}

enum Probe {
    Free,
    InUse,
    Failed(std::io::Error),
}

fn probe(host: &str, port: u16) -> Probe {
    match TcpListener::bind((host, port)) {
        Ok(l) => {
            l.set_nonblocking(true).ok();
            Probe::Free
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => Probe::InUse,
        Err(e) => Probe::Failed(e),
    }
}

impl PortAllocator {
    pub fn new(bind_host: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                bind_host: bind_host.into(),
                reserved: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    /// Reserve the first free port at or above `preferred_start`, probing at most `max_probes` ports.
    pub fn allocate(&self, preferred_start: u16, max_probes: u16) -> Result<PortLease> {
        let start = preferred_start.max(1);
        let end = start.saturating_add(max_probes.max(1) - 1);

        let mut reserved = self.inner.reserved();
        for port in start..=end {
            if reserved.contains(&port) {
                continue;
            }
            match probe(&self.inner.bind_host, port) {
                Probe::Free => {
                    reserved.insert(port);
                    tracing::debug!(port, "port reserved");
                    return Ok(PortLease {
                        port,
                        inner: self.inner.clone(),
                    });
                }
                Probe::InUse => {}
                Probe::Failed(e) => {
                    tracing::debug!(port, error = %e, "port probe failed, skipping");
                }
            }
        }

        Err(SupervisorError::NoPortAvailable { start, end })
    }

    /// Reserve exactly `port`, e.g. the one recorded when the server was created.
    pub fn reserve(&self, port: u16) -> Result<PortLease> {
        let mut reserved = self.inner.reserved();
        if reserved.contains(&port) {
            return Err(SupervisorError::PortInUse { port });
        }
        match probe(&self.inner.bind_host, port) {
            Probe::Free => {}
            Probe::InUse => return Err(SupervisorError::PortInUse { port }),
            Probe::Failed(e) => return Err(SupervisorError::Io(e)),
        }
        reserved.insert(port);
        Ok(PortLease {
            port,
            inner: self.inner.clone(),
        })
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.inner.reserved().contains(&port)
    }

    pub fn reserved_ports(&self) -> Vec<u16> {
        self.inner.reserved().iter().copied().collect()
    }
}
