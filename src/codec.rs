//! MAVLink frame assembly and disassembly.
//!
//! Wire formats (v1 / v2):
//! ```text
//! FE LEN SEQ SYS COMP MSGID PAYLOAD... CRC_LO CRC_HI
//! FD LEN INCOMPAT COMPAT SEQ SYS COMP MSGID[3] PAYLOAD... CRC_LO CRC_HI [SIG*13]
//! ```
//!
//! The payload tables, CRC seeds, and message structs come from the `mavlink`
//! crate; this module owns the byte-at-a-time framing so that partial frames
//! survive across timed reads. Feed bytes with [`Parser::feed`]; frames that
//! fail the checksum or decode are dropped and the parser resynchronizes on
//! the next start byte.

use mavlink::common::MavMessage;
use mavlink::{calculate_crc, MavHeader, MavlinkVersion, Message, MAV_STX, MAV_STX_V2};

/// Signature bit in the MAVLink v2 incompatibility flags.
const MAVLINK_IFLAG_SIGNED: u8 = 0x01;
/// Length of a MAVLink v2 signature trailer.
const SIGNATURE_LEN: usize = 13;

/// Serialize one message into a complete wire frame.
pub fn encode(version: MavlinkVersion, header: MavHeader, msg: &MavMessage) -> Vec<u8> {
    let mut frame = Vec::with_capacity(mavlink::MAX_FRAME_SIZE);
    // Writing into a Vec cannot fail; the Result is an artifact of the
    // generic Write bound.
    if let Err(e) = mavlink::write_versioned_msg(&mut frame, version, header, msg) {
        log::debug!("frame serialization failed: {e}");
    }
    frame
}

/// Decode the first complete frame found in `bytes`, if any.
///
/// Used for MT buffers pulled out of the satellite modem, which hold at most
/// one message.
pub fn decode_first(bytes: &[u8]) -> Option<(MavHeader, MavMessage)> {
    let mut parser = Parser::new();
    bytes.iter().find_map(|&b| parser.feed(b))
}

enum Attempt {
    /// Not enough bytes buffered to judge the frame yet.
    NeedMore,
    /// Leading bytes cannot be a valid frame; resynchronize.
    Resync,
    /// A full frame spanning `consumed` bytes; `None` if it failed to decode.
    Done(Option<(MavHeader, MavMessage)>, usize),
}

/// Incremental MAVLink parser. Accepts interleaved v1 and v2 frames.
pub struct Parser {
    buf: Vec<u8>,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(mavlink::MAX_FRAME_SIZE),
        }
    }

    /// Feed one byte from the stream; returns a message when the byte
    /// completes a valid frame.
    pub fn feed(&mut self, byte: u8) -> Option<(MavHeader, MavMessage)> {
        if self.buf.is_empty() && byte != MAV_STX && byte != MAV_STX_V2 {
            return None;
        }
        self.buf.push(byte);

        loop {
            match self.attempt() {
                Attempt::NeedMore => return None,
                Attempt::Resync => self.resync(),
                Attempt::Done(decoded, consumed) => {
                    self.buf.drain(..consumed);
                    if decoded.is_some() {
                        return decoded;
                    }
                    // A frame was consumed but not decodable (unknown id);
                    // keep scanning whatever follows it.
                    if self.buf.is_empty() {
                        return None;
                    }
                }
            }
        }
    }

    fn attempt(&self) -> Attempt {
        match self.buf.first() {
            Some(&MAV_STX_V2) => self.attempt_v2(),
            Some(&MAV_STX) => self.attempt_v1(),
            Some(_) => Attempt::Resync,
            None => Attempt::NeedMore,
        }
    }

    fn attempt_v2(&self) -> Attempt {
        if self.buf.len() < 3 {
            return Attempt::NeedMore;
        }
        let len = self.buf[1] as usize;
        let signed = self.buf[2] & MAVLINK_IFLAG_SIGNED != 0;
        let total = 12 + len + if signed { SIGNATURE_LEN } else { 0 };
        if self.buf.len() < total {
            return Attempt::NeedMore;
        }

        let msgid = u32::from_le_bytes([self.buf[7], self.buf[8], self.buf[9], 0]);
        let crc_offset = 10 + len;
        let received =
            u16::from_le_bytes([self.buf[crc_offset], self.buf[crc_offset + 1]]);
        let computed =
            calculate_crc(&self.buf[1..crc_offset], MavMessage::extra_crc(msgid));
        if received != computed {
            return Attempt::Resync;
        }

        let header = MavHeader {
            sequence: self.buf[4],
            system_id: self.buf[5],
            component_id: self.buf[6],
        };
        let decoded =
            MavMessage::parse(MavlinkVersion::V2, msgid, &self.buf[10..crc_offset])
                .ok()
                .map(|msg| (header, msg));
        Attempt::Done(decoded, total)
    }

    fn attempt_v1(&self) -> Attempt {
        if self.buf.len() < 2 {
            return Attempt::NeedMore;
        }
        let len = self.buf[1] as usize;
        let total = 8 + len;
        if self.buf.len() < total {
            return Attempt::NeedMore;
        }

        let msgid = u32::from(self.buf[5]);
        let crc_offset = 6 + len;
        let received =
            u16::from_le_bytes([self.buf[crc_offset], self.buf[crc_offset + 1]]);
        let computed =
            calculate_crc(&self.buf[1..crc_offset], MavMessage::extra_crc(msgid));
        if received != computed {
            return Attempt::Resync;
        }

        let header = MavHeader {
            sequence: self.buf[2],
            system_id: self.buf[3],
            component_id: self.buf[4],
        };
        let decoded =
            MavMessage::parse(MavlinkVersion::V1, msgid, &self.buf[6..crc_offset])
                .ok()
                .map(|msg| (header, msg));
        Attempt::Done(decoded, total)
    }

    /// Drop the current start byte and skip ahead to the next one.
    fn resync(&mut self) {
        let next = self.buf[1..]
            .iter()
            .position(|&b| b == MAV_STX || b == MAV_STX_V2)
            .map(|p| p + 1)
            .unwrap_or(self.buf.len());
        self.buf.drain(..next);
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
