// Byte-level transport owning the serial line.
//
// The protocol layer only needs whole-buffer writes, bounded-timeout
// reads and an input-buffer clear, so the serial port sits behind a
// small trait and tests substitute a scripted in-memory transport.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};

use crate::error::{BusError, Result};

/// Default serial configuration for the servo chain.
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

pub trait Transport {
    /// Write the whole buffer or fail.
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    /// Returns 0 when nothing arrived before the deadline.
    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Discard any unread input. Recovery step after a cancelled or
    /// desynchronized transaction.
    fn clear_input(&mut self) -> Result<()>;

    fn baud_rate(&self) -> u32;
}

/// Transport over a real serial line via `serialport`.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    baud_rate: u32,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()
            .map_err(|source| BusError::PortUnavailable {
                port: path.to_string(),
                source,
            })?;

        Ok(Self { port, baud_rate })
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes).map_err(BusError::TxFailure)?;
        self.port.flush().map_err(BusError::TxFailure)?;
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| BusError::Io(std::io::Error::other(e)))?;

        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(BusError::Io(e)),
        }
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| BusError::Io(std::io::Error::other(e)))?;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

/// Scripted transport for tests: reads pop queued chunks, writes are
/// recorded. An empty queue behaves like a read deadline expiring.
#[cfg(test)]
pub(crate) struct MockTransport {
    pub written: Vec<Vec<u8>>,
    pub incoming: std::collections::VecDeque<Vec<u8>>,
    baud_rate: u32,
}

#[cfg(test)]
impl MockTransport {
    pub fn new() -> Self {
        Self {
            written: Vec::new(),
            incoming: std::collections::VecDeque::new(),
            baud_rate: DEFAULT_BAUDRATE,
        }
    }

    pub fn queue(&mut self, bytes: &[u8]) {
        self.incoming.push_back(bytes.to_vec());
    }
}

#[cfg(test)]
impl Transport for MockTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.written.push(bytes.to_vec());
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        match self.incoming.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.incoming.push_front(chunk[n..].to_vec());
                }
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn clear_input(&mut self) -> Result<()> {
        self.incoming.clear();
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}
