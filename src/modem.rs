//! Iridium SBD transceiver interface.
//!
//! The session orchestrator only ever sees [`SbdTransceiver`]: one atomic
//! "upload a blob, maybe download a blob" primitive plus mailbox and status
//! queries. [`IsbdModem`] implements it with the 9602/RockBLOCK AT command
//! set over a serial transport.

use std::time::{Duration, Instant};

use log::debug;

use crate::error::SbdError;
use crate::serial::Transport;

/// Largest mobile-originated (uplink) payload the service accepts.
pub const ISBD_MAX_MO_MSG_SIZE: usize = 340;
/// Largest mobile-terminated (downlink) payload the service delivers.
pub const ISBD_MAX_MT_MSG_SIZE: usize = 270;

/// Response deadline for ordinary AT commands.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Response deadline for `AT+SBDIX`, which blocks through the satellite
/// handshake.
const SESSION_TIMEOUT: Duration = Duration::from_secs(60);
/// Probe attempts when opening the modem.
const PROBE_RETRIES: usize = 3;

/// Snapshot of the modem's extended status (`AT+SBDSX`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SbdStatus {
    pub mo_flag: bool,
    pub momsn: u16,
    pub mt_flag: bool,
    pub mtmsn: u16,
    /// Set when the gateway has messages queued for us in orbit.
    pub ring_alert: bool,
    pub waiting: u16,
}

/// What the session orchestrator requires of a satellite transceiver.
pub trait SbdTransceiver {
    /// Run one SBD session: upload `mo` (possibly empty) and download at
    /// most one queued MT payload.
    fn send_receive(&mut self, mo: &[u8]) -> Result<Option<Vec<u8>>, SbdError>;

    /// Messages still queued on the gateway side, as reported by the most
    /// recent exchange.
    fn mailbox_depth(&self) -> u16;

    /// Poll the modem's extended status registers.
    fn status_extended(&mut self) -> Result<SbdStatus, SbdError>;
}

/// AT-command driver for an Iridium 9602-class transceiver.
pub struct IsbdModem<T: Transport> {
    io: T,
    queued: u16,
}

impl<T: Transport> IsbdModem<T> {
    pub fn new(io: T) -> Self {
        Self { io, queued: 0 }
    }

    /// Probe the modem (`AT`) and disable command echo (`ATE0`).
    pub fn probe(&mut self) -> Result<(), SbdError> {
        let mut last = None;
        for _ in 0..PROBE_RETRIES {
            match self.command("AT", RESPONSE_TIMEOUT) {
                Ok(_) => {
                    self.command("ATE0", RESPONSE_TIMEOUT)?;
                    return Ok(());
                }
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or(SbdError::Timeout {
            timeout: RESPONSE_TIMEOUT,
        }))
    }

    /// Open the modem: construct and probe in one step.
    pub fn open(io: T) -> Result<Self, SbdError> {
        let mut modem = Self::new(io);
        modem.probe()?;
        Ok(modem)
    }

    /// Send one command line and collect response lines until `OK`.
    fn command(&mut self, cmd: &str, timeout: Duration) -> Result<Vec<String>, SbdError> {
        let mut line = String::with_capacity(cmd.len() + 1);
        line.push_str(cmd);
        line.push('\r');
        self.io.send(line.as_bytes())?;

        let deadline = Instant::now() + timeout;
        let mut lines = Vec::new();
        loop {
            let response = self.read_line(deadline)?;
            if response.is_empty() || response == cmd {
                continue;
            }
            match response.as_str() {
                "OK" => return Ok(lines),
                "ERROR" => {
                    return Err(SbdError::Command {
                        command: cmd.to_string(),
                        response,
                    })
                }
                _ => lines.push(response),
            }
        }
    }

    /// Read one CR/LF-terminated line, bounded by `deadline`.
    fn read_line(&mut self, deadline: Instant) -> Result<String, SbdError> {
        let mut line = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SbdError::Timeout {
                    timeout: Duration::ZERO,
                });
            }
            match self.io.read_byte(remaining) {
                Ok(b'\n') => return Ok(line.trim().to_string()),
                Ok(b'\r') => {}
                Ok(byte) => line.push(byte as char),
                Err(e) if e.is_timeout() => {
                    return Err(SbdError::Timeout { timeout: remaining })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_exact(&mut self, buf: &mut [u8], deadline: Instant) -> Result<(), SbdError> {
        for slot in buf {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SbdError::Timeout {
                    timeout: Duration::ZERO,
                });
            }
            *slot = self.io.read_byte(remaining)?;
        }
        Ok(())
    }

    /// `AT+SBDWB`: load the MO buffer with `payload`.
    fn write_mo(&mut self, payload: &[u8]) -> Result<(), SbdError> {
        let cmd = format!("AT+SBDWB={}", payload.len());
        self.io.send(format!("{cmd}\r").as_bytes())?;

        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        loop {
            let line = self.read_line(deadline)?;
            if line.is_empty() || line == cmd {
                continue;
            }
            if line == "READY" {
                break;
            }
            return Err(SbdError::Command {
                command: cmd,
                response: line,
            });
        }

        let checksum = payload
            .iter()
            .fold(0u16, |sum, &b| sum.wrapping_add(u16::from(b)));
        let mut framed = Vec::with_capacity(payload.len() + 2);
        framed.extend_from_slice(payload);
        framed.extend_from_slice(&checksum.to_be_bytes());
        self.io.send(&framed)?;

        // Result code (0 = stored), then OK.
        let mut status = None;
        loop {
            let line = self.read_line(deadline)?;
            if line.is_empty() {
                continue;
            }
            if line == "OK" {
                break;
            }
            status = Some(line);
        }
        match status.as_deref() {
            Some("0") => Ok(()),
            other => Err(SbdError::Command {
                command: cmd,
                response: other.unwrap_or("").to_string(),
            }),
        }
    }

    /// `AT+SBDRB`: pull the MT buffer (2-byte length, payload, 2-byte
    /// summation checksum).
    fn read_mt(&mut self) -> Result<Vec<u8>, SbdError> {
        self.io.send(b"AT+SBDRB\r")?;
        let deadline = Instant::now() + RESPONSE_TIMEOUT;

        let mut len_bytes = [0u8; 2];
        self.read_exact(&mut len_bytes, deadline)?;
        let len = usize::from(u16::from_be_bytes(len_bytes));
        if len > ISBD_MAX_MT_MSG_SIZE {
            return Err(SbdError::Response(format!(
                "MT length {len} exceeds the {ISBD_MAX_MT_MSG_SIZE}-byte SBD limit"
            )));
        }

        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload, deadline)?;

        let mut checksum_bytes = [0u8; 2];
        self.read_exact(&mut checksum_bytes, deadline)?;
        let expected = u16::from_be_bytes(checksum_bytes);
        let computed = payload
            .iter()
            .fold(0u16, |sum, &b| sum.wrapping_add(u16::from(b)));
        if expected != computed {
            return Err(SbdError::Checksum { expected, computed });
        }

        // Trailing OK after the binary block.
        loop {
            let line = self.read_line(deadline)?;
            if line == "OK" {
                break;
            }
        }
        Ok(payload)
    }

    /// Parse the numeric fields of a `+PREFIX: a, b, c, ...` response line.
    fn numeric_fields(lines: &[String], prefix: &str) -> Result<Vec<u16>, SbdError> {
        let line = lines
            .iter()
            .find_map(|l| l.strip_prefix(prefix))
            .ok_or_else(|| SbdError::Response(format!("missing {prefix} response")))?;
        line.split(',')
            .map(|field| {
                field
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| SbdError::Response(format!("bad field '{field}' in {prefix}")))
            })
            .collect()
    }
}

impl<T: Transport> SbdTransceiver for IsbdModem<T> {
    fn send_receive(&mut self, mo: &[u8]) -> Result<Option<Vec<u8>>, SbdError> {
        if mo.len() > ISBD_MAX_MO_MSG_SIZE {
            return Err(SbdError::MoTooLarge {
                len: mo.len(),
                max: ISBD_MAX_MO_MSG_SIZE,
            });
        }

        if mo.is_empty() {
            // Nothing to say this round; clear any stale MO buffer.
            self.command("AT+SBDD0", RESPONSE_TIMEOUT)?;
        } else {
            self.write_mo(mo)?;
        }

        let lines = self.command("AT+SBDIX", SESSION_TIMEOUT)?;
        let fields = Self::numeric_fields(&lines, "+SBDIX:")?;
        if fields.len() < 6 {
            return Err(SbdError::Response(format!(
                "+SBDIX returned {} fields",
                fields.len()
            )));
        }
        let (mo_status, mt_status, mt_queued) = (fields[0], fields[2], fields[5]);
        self.queued = mt_queued;
        debug!("SBDIX: mo_status={mo_status} mt_status={mt_status} queued={mt_queued}");

        if mo_status > 4 {
            return Err(SbdError::Session { mo_status });
        }
        if mt_status == 1 {
            return Ok(Some(self.read_mt()?));
        }
        Ok(None)
    }

    fn mailbox_depth(&self) -> u16 {
        self.queued
    }

    fn status_extended(&mut self) -> Result<SbdStatus, SbdError> {
        let lines = self.command("AT+SBDSX", RESPONSE_TIMEOUT)?;
        let fields = Self::numeric_fields(&lines, "+SBDSX:")?;
        if fields.len() < 6 {
            return Err(SbdError::Response(format!(
                "+SBDSX returned {} fields",
                fields.len()
            )));
        }
        let status = SbdStatus {
            mo_flag: fields[0] != 0,
            momsn: fields[1],
            mt_flag: fields[2] != 0,
            mtmsn: fields[3],
            ring_alert: fields[4] != 0,
            waiting: fields[5],
        };
        self.queued = status.waiting;
        Ok(status)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
