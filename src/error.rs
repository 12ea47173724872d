use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors from the byte-level serial transport.
#[derive(Debug, Error)]
pub enum SerialError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to open serial device '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },

    #[error("read timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("short write ({written} of {expected} bytes)")]
    ShortWrite { written: usize, expected: usize },
}

impl SerialError {
    /// True for the bounded-wait expiry case; everything else is a real fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SerialError::Timeout { .. })
    }
}

/// Errors from the MAVLink link layer.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error("no complete frame within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("no HEARTBEAT received from autopilot")]
    NoHeartbeat,
}

impl LinkError {
    pub fn is_timeout(&self) -> bool {
        match self {
            LinkError::Timeout { .. } => true,
            LinkError::Serial(e) => e.is_timeout(),
            LinkError::NoHeartbeat => false,
        }
    }
}

/// Errors from the ISBD transceiver driver.
#[derive(Debug, Error)]
pub enum SbdError {
    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error("modem did not respond within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("modem rejected command '{command}': {response}")]
    Command { command: String, response: String },

    #[error("SBD session failed with MO status {mo_status}")]
    Session { mo_status: u16 },

    #[error("MO payload of {len} bytes exceeds the {max}-byte SBD limit")]
    MoTooLarge { len: usize, max: usize },

    #[error("MT payload checksum mismatch (expected 0x{expected:04X}, computed 0x{computed:04X})")]
    Checksum { expected: u16, computed: u16 },

    #[error("unparseable modem response: {0}")]
    Response(String),
}

/// Errors from configuration validation. Fatal at init (exit code 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported baud rate {0} (supported: 9600, 19200, 38400, 57600, 115200)")]
    BadBaud(u32),

    #[error("report period must be positive")]
    BadReportPeriod,

    #[error("empty candidate serial device list")]
    NoCandidates,
}
