use crate::{ConnError, Connection};
use log::{debug, info, warn};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Default baud rate for a direct USB/serial ELM327 dongle.
pub const DEFAULT_SERIAL_BAUD: u32 = 38_400;

/// Default baud rate for an RFCOMM (Bluetooth SPP) virtual serial port.
pub const DEFAULT_RFCOMM_BAUD: u32 = 115_200;

/// Size of each individual read attempt while polling for a terminator.
const POLL_CHUNK: usize = 64;

/// Serial/RFCOMM byte-stream connection.
///
/// Covers both a directly-wired USB ELM327 dongle and a Bluetooth-SPP
/// adapter bound to a virtual serial port by the OS — both show up as the
/// same kind of path (`/dev/ttyUSB0`, `COM4`, `/dev/rfcomm0`, ...) and are
/// indistinguishable once opened.
pub struct StreamConnection {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl StreamConnection {
    /// Build a connection for `path` at `baud_rate`. Does not open the port;
    /// call [`Connection::open`] first.
    #[must_use]
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            port: None,
        }
    }
}

impl Connection for StreamConnection {
    fn open(&mut self) -> Result<(), ConnError> {
        if self.port.is_some() {
            return Ok(());
        }
        info!("opening serial connection to {} at {}", self.path, self.baud_rate);
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| ConnError::Io(std::io::Error::other(e)))?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConnError> {
        if self.port.take().is_some() {
            debug!("closed serial connection to {}", self.path);
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ConnError> {
        let port = self.port.as_mut().ok_or(ConnError::NotOpen)?;
        port.write_all(bytes)?;
        debug!("wrote {} bytes to {}", bytes.len(), self.path);
        Ok(())
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>, ConnError> {
        let port = self.port.as_mut().ok_or(ConnError::NotOpen)?;
        let mut buf = vec![0u8; n];
        match port.read(&mut buf) {
            Ok(got) => {
                buf.truncate(got);
                Ok(buf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(ConnError::Io(e)),
        }
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, ConnError> {
        let port = self.port.as_mut().ok_or(ConnError::NotOpen)?;
        let deadline = Instant::now() + timeout;
        let mut buf = Vec::new();
        let mut chunk = [0u8; POLL_CHUNK];

        loop {
            if Instant::now() >= deadline {
                warn!("read_until timed out on {} after {} bytes", self.path, buf.len());
                return Err(ConnError::Timeout);
            }
            match port.read(&mut chunk) {
                Ok(0) => continue,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.iter().position(|&b| b == terminator) {
                        buf.truncate(pos + 1);
                        return Ok(buf);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(ConnError::Io(e)),
            }
        }
    }

    fn flush_input(&mut self) -> Result<(), ConnError> {
        let port = self.port.as_mut().ok_or(ConnError::NotOpen)?;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| ConnError::Io(std::io::Error::other(e)))
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_open_errors_before_open_is_called() {
        let mut conn = StreamConnection::new("/dev/null-placeholder", DEFAULT_SERIAL_BAUD);
        assert!(!conn.is_open());
        assert!(matches!(conn.write(b"ATZ\r"), Err(ConnError::NotOpen)));
        assert!(matches!(
            conn.read_until(b'>', Duration::from_millis(10)),
            Err(ConnError::NotOpen)
        ));
    }
}
