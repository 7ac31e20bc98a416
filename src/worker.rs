//! Per-connection receive loop.
//!
//! Each accepted connection gets its own OS thread. The thread blocks on
//! reads of up to `READ_BUFFER_SIZE` bytes and logs every chunk as text and
//! as a hex dump. Nothing is ever written back to the peer.

use crate::hexdump::{log_hex_dump, HEX_DUMP_PREFIX};
use crate::registry::ConnectionRegistry;
use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Maximum bytes taken from the socket per read.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Transient read errors tolerated back to back before the worker gives up.
const MAX_CONSECUTIVE_READ_ERRORS: usize = 16;

const BEGIN_MARKER: &str = "----------------BEGIN RECEIVED DATA----------------";
const END_MARKER: &str = "-----------------END RECEIVED DATA----------------";

/// Why a worker loop ended.
#[derive(Debug)]
pub enum WorkerExit {
    /// Peer closed its side (zero-length read).
    PeerClosed,
    /// Socket was shut down by the server during shutdown.
    Shutdown,
    /// Unrecoverable read error.
    Failed(io::Error),
}

/// State handed to a connection thread at spawn time.
///
/// Everything is owned by value so each thread sees exactly the slot it was
/// launched for.
pub struct Worker {
    index: usize,
    stream: Arc<TcpStream>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        index: usize,
        stream: Arc<TcpStream>,
        registry: Arc<ConnectionRegistry>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            index,
            stream,
            registry,
            shutdown,
        }
    }

    /// Launch the receive loop on a dedicated thread named `conn-<index>`.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("conn-{}", self.index))
            .spawn(move || self.run())
    }

    fn run(self) {
        if let Some(slot) = self.registry.get(self.index) {
            debug!(
                conn = slot.index,
                fd = slot.fd,
                peer = %slot.peer,
                attached = slot.has_worker,
                "Worker started"
            );
        }

        let mut reader: &TcpStream = &self.stream;
        match serve(self.index, &mut reader, &self.shutdown) {
            WorkerExit::PeerClosed => {
                info!(conn = self.index, "Connection {} closed by peer", self.index);
            }
            WorkerExit::Shutdown => {
                info!(conn = self.index, "Connection {} closed for shutdown", self.index);
            }
            WorkerExit::Failed(e) => {
                error!(
                    conn = self.index,
                    error = %e,
                    "Connection {} terminated on read error",
                    self.index
                );
            }
        }

        // Shuts the socket down; it closes when our share is dropped with `self`.
        self.registry.release(self.index);
    }
}

/// Run the receive loop until the peer closes or a fatal error occurs.
pub fn serve<R: Read>(index: usize, reader: &mut R, shutdown: &AtomicBool) -> WorkerExit {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut consecutive_errors = 0;

    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                if shutdown.load(Ordering::Acquire) {
                    return WorkerExit::Shutdown;
                }
                return WorkerExit::PeerClosed;
            }
            Ok(n) => {
                consecutive_errors = 0;
                let data = &buf[..n];
                debug!(conn = index, bytes = n, "Received data");
                info!("{}", received_block(data));
                log_hex_dump(HEX_DUMP_PREFIX, data);
            }
            Err(e) if is_transient(&e) => {
                consecutive_errors += 1;
                warn!(
                    conn = index,
                    error = %e,
                    attempt = consecutive_errors,
                    "Read failed, retrying"
                );
                if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    return WorkerExit::Failed(e);
                }
            }
            Err(e) => return WorkerExit::Failed(e),
        }
    }
}

/// Errors worth retrying the read for.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Text form of received bytes.
///
/// Output stops at the first NUL byte, so data after an embedded NUL only
/// shows up in the hex dump. Invalid UTF-8 is replaced.
pub fn received_text(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// The delimited block logged for each read.
pub fn received_block(buf: &[u8]) -> String {
    format!("{}\n{}\n{}", BEGIN_MARKER, received_text(buf), END_MARKER)
}
