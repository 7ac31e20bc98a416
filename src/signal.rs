//! Signal handling for graceful shutdown.
//!
//! SIGINT and SIGTERM stop the acceptor and drain connection workers. A
//! second signal exits immediately.

use crate::server::ShutdownHandle;
use tracing::{info, warn};

/// Install a handler that triggers `shutdown` on SIGINT or SIGTERM.
pub fn install_signal_handler(shutdown: ShutdownHandle) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        if shutdown.is_shutdown() {
            warn!("Received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        info!("Received shutdown signal, initiating graceful shutdown...");
        shutdown.shutdown();
    })
}
