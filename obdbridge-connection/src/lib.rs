//! Transport-agnostic byte-stream connection abstraction.
//!
//! Every backend — serial/RFCOMM stream, BLE, or the in-memory mock used by
//! tests — implements the same [`Connection`] trait. The ELM327 protocol
//! terminates every response with the prompt byte `>` (0x3E), so
//! [`Connection::read_until`] is the fundamental primitive the higher layers
//! are built on; no backend may buffer bytes across calls in a way that
//! hides the prompt from a subsequent `read_until`.

mod mock;
mod stream;

pub use mock::{Matcher, MockConnection};
pub use stream::{StreamConnection, DEFAULT_RFCOMM_BAUD, DEFAULT_SERIAL_BAUD};

use std::fmt;
use std::time::Duration;

/// The prompt byte ELM327 adapters emit to indicate readiness for the next
/// command.
pub const PROMPT_BYTE: u8 = b'>';

/// Errors a [`Connection`] implementation can return.
#[derive(Debug)]
pub enum ConnError {
    /// The underlying read/write failed; the connection is typically
    /// unusable afterwards.
    Io(std::io::Error),
    /// `read_until` exceeded its deadline. Recoverable with
    /// [`Connection::flush_input`] followed by a fresh command.
    Timeout,
    /// The operation was attempted on a closed connection.
    NotOpen,
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::NotOpen => write!(f, "connection is not open"),
        }
    }
}

impl std::error::Error for ConnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Timeout | Self::NotOpen => None,
        }
    }
}

impl From<std::io::Error> for ConnError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::WouldBlock
        {
            Self::Timeout
        } else {
            Self::Io(e)
        }
    }
}

/// A byte-stream connection to an ELM327-class adapter.
///
/// Implementors: serial/RFCOMM ([`StreamConnection`]), BLE
/// (`obdbridge-ble::BleConnection`), and the in-memory
/// [`MockConnection`] used by tests.
pub trait Connection: Send {
    /// Acquire the underlying resource. Idempotent: calling `open` on an
    /// already-open connection succeeds without side effects.
    fn open(&mut self) -> Result<(), ConnError>;

    /// Release the underlying resource. Idempotent.
    fn close(&mut self) -> Result<(), ConnError>;

    /// Write exactly `bytes.len()` bytes, or fail with [`ConnError::Io`].
    fn write(&mut self, bytes: &[u8]) -> Result<(), ConnError>;

    /// Return up to `n` bytes. May return fewer on timeout, but must not
    /// return an empty vector without an error unless `n == 0`.
    fn read(&mut self, n: usize) -> Result<Vec<u8>, ConnError>;

    /// Accumulate bytes until `terminator` appears or `timeout` elapses.
    /// Returns everything up to and including the terminator. On timeout,
    /// fails with [`ConnError::Timeout`] and returns no partial data.
    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, ConnError>;

    /// Discard any buffered but unread bytes.
    fn flush_input(&mut self) -> Result<(), ConnError>;

    /// Whether the connection is currently open.
    fn is_open(&self) -> bool;
}

impl<T: Connection + ?Sized> Connection for Box<T> {
    fn open(&mut self) -> Result<(), ConnError> {
        (**self).open()
    }

    fn close(&mut self) -> Result<(), ConnError> {
        (**self).close()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ConnError> {
        (**self).write(bytes)
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>, ConnError> {
        (**self).read(n)
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, ConnError> {
        (**self).read_until(terminator, timeout)
    }

    fn flush_input(&mut self) -> Result<(), ConnError> {
        (**self).flush_input()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_would_block_maps_to_timeout() {
        let io_err = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        assert!(matches!(ConnError::from(io_err), ConnError::Timeout));
    }

    #[test]
    fn io_error_other_kind_maps_to_io() {
        let io_err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(ConnError::from(io_err), ConnError::Io(_)));
    }
}
