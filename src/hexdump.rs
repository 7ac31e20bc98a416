//! Hex dump rendering for received data.
//!
//! Each byte becomes two uppercase hex digits. The rendered line is bounded
//! by a fixed output cap; input that would exceed it is refused rather than
//! truncated.

use std::fmt::Write;
use tracing::{info, warn};

/// Prefix used for every hex dump line written by connection workers.
pub const HEX_DUMP_PREFIX: &str = "Start HEX DUMP: ";

/// Maximum size of a rendered hex dump, including prefix and terminator.
pub const HEX_DUMP_CAP: usize = 4096;

/// Hex dump rendering errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HexDumpError {
    /// The rendered output would not fit in `HEX_DUMP_CAP` bytes.
    TooLarge { required: usize, cap: usize },
}

impl std::fmt::Display for HexDumpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexDumpError::TooLarge { required, cap } => {
                write!(f, "size too large ({} > {})", required, cap)
            }
        }
    }
}

impl std::error::Error for HexDumpError {}

/// Render `buf` as `prefix` followed by uppercase hex pairs and a newline.
///
/// Refuses when `prefix.len() + 2 * buf.len() + 2` exceeds `HEX_DUMP_CAP`.
pub fn hex_dump(prefix: &str, buf: &[u8]) -> Result<String, HexDumpError> {
    let required = prefix.len() + buf.len() * 2 + 2;
    if required > HEX_DUMP_CAP {
        return Err(HexDumpError::TooLarge {
            required,
            cap: HEX_DUMP_CAP,
        });
    }

    let mut out = String::with_capacity(required);
    out.push_str(prefix);
    for byte in buf {
        // Writing into a String cannot fail
        let _ = write!(out, "{:02X}", byte);
    }
    out.push('\n');
    Ok(out)
}

/// Write a hex dump of `buf` to the log, or a refusal notice if it is too large.
pub fn log_hex_dump(prefix: &str, buf: &[u8]) {
    match hex_dump(prefix, buf) {
        Ok(line) => info!("{}", line.trim_end_matches('\n')),
        Err(e) => warn!(bytes = buf.len(), "hex dump refused: {}", e),
    }
}
