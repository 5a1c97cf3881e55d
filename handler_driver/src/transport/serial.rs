//! RS-232 line transport.
//!
//! Serial handlers have no interrupt line; `poll_interrupt` only sleeps for
//! the timeout so callers keep their pacing.

use handler_common::transport::{Transport, TransportError};
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::termios::{self, BaudRate, ControlFlags, SetArg};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Longest line accepted before the buffer is considered garbage.
const MAX_LINE: usize = 4096;

fn baud_rate(baud: u32) -> Result<BaudRate, TransportError> {
    Ok(match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        other => return Err(TransportError::Io(format!("unsupported baud rate {other}"))),
    })
}

fn nix_err(e: nix::Error) -> TransportError {
    TransportError::Io(e.to_string())
}

/// Raw 8N1 serial line.
pub struct SerialTransport {
    port: File,
    buffer: Vec<u8>,
}

impl SerialTransport {
    /// Open `path` in raw mode at `baud`.
    ///
    /// # Errors
    /// `TransportError::Io` if the device cannot be opened or configured.
    pub fn open(path: impl AsRef<Path>, baud: u32) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let speed = baud_rate(baud)?;
        let port = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NOCTTY.bits())
            .open(path)?;

        let mut tio = termios::tcgetattr(port.as_fd()).map_err(nix_err)?;
        termios::cfmakeraw(&mut tio);
        termios::cfsetspeed(&mut tio, speed).map_err(nix_err)?;
        tio.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
        tio.control_flags &= !(ControlFlags::CSTOPB | ControlFlags::PARENB);
        termios::tcsetattr(port.as_fd(), SetArg::TCSANOW, &tio).map_err(nix_err)?;

        debug!(device = %path.display(), baud, "Serial port open");
        Ok(Self {
            port,
            buffer: Vec::with_capacity(256),
        })
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=end).collect();
        let text = String::from_utf8_lossy(&line);
        Some(text.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Wait up to `timeout` for readable data.
    fn wait_readable(&self, timeout: Duration) -> Result<bool, TransportError> {
        let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.port.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, PollTimeout::from(ms)).map_err(nix_err)?;
        Ok(ready > 0)
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn send(&mut self, command: &str) -> Result<(), TransportError> {
        trace!(command = command.trim_end(), "Serial send");
        self.port.write_all(command.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<String, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.take_line() {
                trace!(reply = %line, "Serial receive");
                return Ok(line);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || !self.wait_readable(left)? {
                if Instant::now() >= deadline {
                    return Err(TransportError::Timeout);
                }
                continue;
            }
            let mut chunk = [0u8; 256];
            let n = self.port.read(&mut chunk)?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
            if self.buffer.len() > MAX_LINE {
                self.buffer.clear();
                return Err(TransportError::Io("reply line too long".to_string()));
            }
        }
    }

    fn poll_interrupt(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        std::thread::sleep(timeout);
        Ok(None)
    }
}
