//! Error types for the sequencer command bus.
//!
//! A single `ComError` enum covers the four failure classes the bus can
//! produce:
//!
//! - **Validation**: a command constructor rejected its arguments before
//!   anything touched the wire. Local to the caller, never fatal.
//! - **Protocol**: an incoming line that no pending request and no known
//!   preamble pattern claims. Logged by the reader; the bus keeps running.
//! - **Timeout**: a reply did not arrive within the command deadline. The
//!   associated waiters are evicted and the error names the command.
//! - **Transport**: the link itself failed or was closed. Fatal for that
//!   bus; every blocked caller is failed and the owner must reconnect.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the bus error type.
pub type ComResult<T> = std::result::Result<T, ComError>;

#[derive(Error, Debug)]
pub enum ComError {
    #[error("invalid argument for {cmd}: {reason}")]
    InvalidArgument { cmd: &'static str, reason: String },

    #[error("[{instrument}] unexpected response: {raw:?}")]
    InvalidResponse {
        instrument: &'static str,
        raw: String,
    },

    #[error("[{instrument}] timeout after {timeout:?} from {cmd:?}")]
    Timeout {
        instrument: &'static str,
        cmd: String,
        timeout: Duration,
    },

    #[error("[{instrument}] link closed")]
    LinkClosed { instrument: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    #[cfg(feature = "serial")]
    Serial(#[from] tokio_serial::Error),

    #[error("cannot encode {0:?} as 8-bit text")]
    Encoding(char),
}
