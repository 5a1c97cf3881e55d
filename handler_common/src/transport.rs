//! Transport interface consumed by the protocol engine.
//!
//! A transport moves complete ASCII lines to and from one handler and
//! reports out-of-band interrupt bytes (GPIB SRQ status bytes or an
//! equivalent). Every call blocks up to the given timeout; there is no
//! background I/O.

use std::time::Duration;
use thiserror::Error;

/// Error types for transport operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No reply arrived within the timeout.
    #[error("Transport timeout")]
    Timeout,

    /// Low-level I/O failure.
    #[error("Transport I/O error: {0}")]
    Io(String),

    /// The link was closed by the peer.
    #[error("Transport closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout,
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::Io(e.to_string()),
        }
    }
}

/// Synchronous line transport to one handler.
///
/// # Contract
///
/// | Operation | Blocks | Returns |
/// |-----------|--------|---------|
/// | `send` | until written | `Ok(())` or I/O error |
/// | `receive` | up to `timeout` | one line without terminator, or `Timeout` |
/// | `poll_interrupt` | up to `timeout` | `Some(code)` if a signal was pending |
pub trait Transport: Send {
    /// Short identifier for logs (e.g. "serial", "scripted").
    fn name(&self) -> &'static str;

    /// Send one complete command line. The line terminator is included.
    fn send(&mut self, command: &str) -> Result<(), TransportError>;

    /// Receive one line. The terminator is stripped.
    fn receive(&mut self, timeout: Duration) -> Result<String, TransportError>;

    /// Wait for an out-of-band interrupt byte.
    fn poll_interrupt(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn send(&mut self, command: &str) -> Result<(), TransportError> {
        (**self).send(command)
    }

    fn receive(&mut self, timeout: Duration) -> Result<String, TransportError> {
        (**self).receive(timeout)
    }

    fn poll_interrupt(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        (**self).poll_interrupt(timeout)
    }
}
