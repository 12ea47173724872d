//! Byte-level serial transport.
//!
//! One open call configures the line (8N1, fixed baud); after that the only
//! runtime knob is the per-read timeout. Both peers (autopilot and ISBD
//! transceiver) are driven through the same [`Transport`] trait so the
//! protocol layers can be exercised against scripted fakes in tests.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;

use crate::error::SerialError;

/// Baud rates the gateway accepts for either serial peer.
pub const SUPPORTED_BAUD_RATES: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

/// Blocking byte transport with per-call read deadlines.
pub trait Transport {
    /// Read a single byte, waiting at most `timeout`.
    ///
    /// Returns `SerialError::Timeout` when the deadline expires with no data.
    fn read_byte(&mut self, timeout: Duration) -> Result<u8, SerialError>;

    /// Write the whole buffer. Short writes are errors.
    fn send(&mut self, bytes: &[u8]) -> Result<(), SerialError>;
}

/// A tty-backed [`Transport`].
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    path: String,
}

impl SerialTransport {
    /// Open `path` at `baud`, 8 data bits, no parity, one stop bit.
    pub fn open(path: &str, baud: u32) -> Result<Self, SerialError> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|source| SerialError::Open {
                path: path.to_string(),
                source,
            })?;

        Ok(Self {
            port,
            path: path.to_string(),
        })
    }

    /// The device path this transport was opened on.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Transport for SerialTransport {
    fn read_byte(&mut self, timeout: Duration) -> Result<u8, SerialError> {
        // serialport rejects a zero timeout on some platforms; clamp up.
        let timeout = timeout.max(Duration::from_millis(1));
        self.port
            .set_timeout(timeout)
            .map_err(|e| SerialError::Io(e.into()))?;

        let mut byte = [0u8; 1];
        match self.port.read_exact(&mut byte) {
            Ok(()) => Ok(byte[0]),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Err(SerialError::Timeout { timeout })
            }
            Err(e) => Err(SerialError::Io(e)),
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        let written = self.port.write(bytes)?;
        if written != bytes.len() {
            return Err(SerialError::ShortWrite {
                written,
                expected: bytes.len(),
            });
        }
        self.port.flush()?;
        Ok(())
    }
}

/// Filter `candidates` down to the devices that actually open at `baud`.
///
/// Used for serial auto-detection; the caller decides which peer answers on
/// which device.
pub fn enumerate(candidates: &[String], baud: u32) -> Vec<String> {
    candidates
        .iter()
        .filter(|path| SerialTransport::open(path, baud).is_ok())
        .cloned()
        .collect()
}

/// All serial devices the operating system knows about.
pub fn system_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            log::warn!("unable to list serial ports: {e}");
            Vec::new()
        }
    }
}
