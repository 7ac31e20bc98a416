//! Fixed-capacity registry of accepted connections.
//!
//! The acceptor is the only writer that adds entries. A worker only reads
//! the slot it was spawned for and releases that slot on exit. All access
//! goes through the slab mutex.

use slab::Slab;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::debug;

/// A registered connection.
#[derive(Debug)]
pub struct ConnectionDescriptor {
    /// Socket shared with the worker, used to unblock it on shutdown.
    stream: Arc<TcpStream>,
    /// File descriptor of the accepted socket.
    fd: RawFd,
    /// Remote address.
    peer: SocketAddr,
    /// Thread servicing this connection, once spawned.
    worker: Option<JoinHandle<()>>,
}

impl ConnectionDescriptor {
    pub fn new(stream: Arc<TcpStream>, peer: SocketAddr) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            stream,
            fd,
            peer,
            worker: None,
        }
    }
}

/// Read-only view of a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub index: usize,
    pub fd: RawFd,
    pub peer: SocketAddr,
    pub has_worker: bool,
}

/// Registry errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    CapacityExceeded { capacity: usize },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::CapacityExceeded { capacity } => {
                write!(f, "registry full (capacity {})", capacity)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Registry of live connections backed by a slab.
///
/// Never holds more than `capacity` entries. Freed slots are reused, most
/// recently freed first; with no releases indices run 0, 1, 2, ...
#[derive(Debug)]
pub struct ConnectionRegistry {
    slots: Mutex<Slab<ConnectionDescriptor>>,
    capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slab::with_capacity(capacity)),
            capacity,
        }
    }

    // A worker that panicked while holding the lock leaves the slab intact,
    // so a poisoned mutex is still usable.
    fn lock(&self) -> MutexGuard<'_, Slab<ConnectionDescriptor>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a connection, returning its slot index.
    pub fn register(&self, descriptor: ConnectionDescriptor) -> Result<usize, RegistryError> {
        let mut slots = self.lock();
        if slots.len() >= self.capacity {
            return Err(RegistryError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        Ok(slots.insert(descriptor))
    }

    pub fn get(&self, index: usize) -> Option<ConnectionInfo> {
        self.lock().get(index).map(|d| ConnectionInfo {
            index,
            fd: d.fd,
            peer: d.peer,
            has_worker: d.worker.is_some(),
        })
    }

    /// Record the worker thread for a slot.
    ///
    /// If the worker already finished and released the slot, the handle is
    /// handed back to the caller.
    pub fn attach_worker(&self, index: usize, worker: JoinHandle<()>) -> Option<JoinHandle<()>> {
        match self.lock().get_mut(index) {
            Some(descriptor) => {
                descriptor.worker = Some(worker);
                None
            }
            None => Some(worker),
        }
    }

    /// Free a slot and shut down its socket.
    ///
    /// The socket is closed once the worker drops its share of the handle.
    pub fn release(&self, index: usize) -> Option<ConnectionDescriptor> {
        let descriptor = self.lock().try_remove(index)?;
        let _ = descriptor.stream.shutdown(Shutdown::Both);
        debug!(conn = index, fd = descriptor.fd, "Slot released");
        Some(descriptor)
    }

    /// Shut down every registered socket so blocked reads return.
    pub fn shutdown_all(&self) -> usize {
        let slots = self.lock();
        for (index, descriptor) in slots.iter() {
            if let Err(e) = descriptor.stream.shutdown(Shutdown::Both) {
                debug!(conn = index, error = %e, "Socket shutdown failed");
            }
        }
        slots.len()
    }

    /// Take every attached worker handle, leaving the slots in place.
    pub fn drain_workers(&self) -> Vec<(usize, JoinHandle<()>)> {
        self.lock()
            .iter_mut()
            .filter_map(|(index, d)| d.worker.take().map(|w| (index, w)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
