//! MAVLink protocol layer over a serial transport.
//!
//! Wraps a [`Transport`] with timed whole-frame receive, frame send, the
//! initial identity handshake, and `send_and_ack`, the request/response
//! primitive that either relays a real acknowledgement or fabricates a
//! failure ack so the remote peer never hangs waiting.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mavlink::common::{
    MavAutopilot, MavCmd, MavMessage, MavMissionResult, MavResult, MavType,
    COMMAND_ACK_DATA, COMMAND_LONG_DATA, MISSION_ACK_DATA, PARAM_VALUE_DATA,
};
use mavlink::{MavHeader, MavlinkVersion};

use crate::codec::{self, Parser};
use crate::error::LinkError;
use crate::serial::Transport;

/// System/component ids the gateway stamps on frames it fabricates on the
/// autopilot's behalf.
pub const ARDUPILOT_SYSTEM_ID: u8 = 1;
pub const ARDUPILOT_COMPONENT_ID: u8 = 1;

/// System/component ids for frames the gateway originates itself.
pub const GCS_SYSTEM_ID: u8 = 255;
pub const GCS_COMPONENT_ID: u8 = 1;

/// Retry budget for one request toward the autopilot.
pub const SEND_RETRIES: usize = 5;
/// Receive attempts per send before the next send retry.
pub const RECEIVE_RETRIES: usize = 10;
/// Pause between receive attempts.
pub const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// How long one receive attempt waits for an acknowledgement frame.
const ACK_TIMEOUT: Duration = Duration::from_secs(1);
/// How long the handshake listens for the first autopilot HEARTBEAT.
const HEARTBEAT_WINDOW: Duration = Duration::from_secs(1);

/// Autopilot firmware version unpacked from `AUTOPILOT_VERSION.flight_sw_version`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    /// Release type byte (dev/alpha/beta/rc/official), kept raw.
    pub variant: u8,
}

impl FirmwareVersion {
    pub fn from_raw(raw: u32) -> Self {
        Self {
            major: (raw >> 24) as u8,
            minor: (raw >> 16) as u8,
            patch: (raw >> 8) as u8,
            variant: raw as u8,
        }
    }

    pub fn is_known(&self) -> bool {
        *self != Self::default()
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_known() {
            write!(f, "{}.{}.{}/{}", self.major, self.minor, self.patch, self.variant)
        } else {
            write!(f, "unknown")
        }
    }
}

/// Identity captured once during the init handshake; immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutopilotIdentity {
    pub vendor: MavAutopilot,
    pub vehicle_type: MavType,
    pub sys_id: u8,
    pub firmware: FirmwareVersion,
}

impl Default for AutopilotIdentity {
    fn default() -> Self {
        Self {
            vendor: MavAutopilot::MAV_AUTOPILOT_INVALID,
            vehicle_type: MavType::MAV_TYPE_GENERIC,
            sys_id: 0,
            firmware: FirmwareVersion::default(),
        }
    }
}

/// MAVLink link over one serial device.
pub struct MavLink<T: Transport> {
    io: T,
    parser: Parser,
    version: MavlinkVersion,
    /// Outbound sequence counter for gateway-originated and synthesized
    /// frames; wraps at 256. Real autopilot frames carry their own.
    seq: u8,
}

impl<T: Transport> MavLink<T> {
    pub fn new(io: T) -> Self {
        Self {
            io,
            parser: Parser::new(),
            version: MavlinkVersion::V2,
            seq: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn io_ref(&self) -> &T {
        &self.io
    }

    /// Next outbound sequence number (strictly increasing mod 256 for the
    /// process lifetime).
    pub fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    /// Header for frames fabricated on the autopilot's behalf.
    pub fn ardupilot_header(&mut self) -> MavHeader {
        MavHeader {
            system_id: ARDUPILOT_SYSTEM_ID,
            component_id: ARDUPILOT_COMPONENT_ID,
            sequence: self.next_seq(),
        }
    }

    /// Header for frames the gateway originates itself.
    pub fn gcs_header(&mut self) -> MavHeader {
        MavHeader {
            system_id: GCS_SYSTEM_ID,
            component_id: GCS_COMPONENT_ID,
            sequence: self.next_seq(),
        }
    }

    /// Wait up to `timeout` for the next complete frame.
    ///
    /// Partial frames persist in the parser across calls, so a frame split
    /// over two timed reads is not lost.
    pub fn receive(&mut self, timeout: Duration) -> Result<(MavHeader, MavMessage), LinkError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LinkError::Timeout { timeout });
            }
            match self.io.read_byte(remaining) {
                Ok(byte) => {
                    if let Some(frame) = self.parser.feed(byte) {
                        return Ok(frame);
                    }
                }
                Err(e) if e.is_timeout() => return Err(LinkError::Timeout { timeout }),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Encode and write one frame.
    pub fn send(&mut self, header: MavHeader, msg: &MavMessage) -> Result<(), LinkError> {
        let frame = codec::encode(self.version, header, msg);
        self.io.send(&frame)?;
        Ok(())
    }

    /// Initial handshake: capture a HEARTBEAT, then request capabilities and
    /// parse the AUTOPILOT_VERSION reply.
    ///
    /// GCS-forwarded heartbeats (`MAV_AUTOPILOT_INVALID`) are ignored. If no
    /// heartbeat arrives at all the handshake fails; if the version request
    /// goes unanswered a partial identity with a zeroed firmware version is
    /// returned.
    pub fn request_identity(&mut self) -> Result<AutopilotIdentity, LinkError> {
        let mut identity: Option<AutopilotIdentity> = None;

        let deadline = Instant::now() + HEARTBEAT_WINDOW;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.receive(remaining) {
                Ok((header, MavMessage::HEARTBEAT(hb)))
                    if hb.autopilot != MavAutopilot::MAV_AUTOPILOT_INVALID =>
                {
                    identity = Some(AutopilotIdentity {
                        vendor: hb.autopilot,
                        vehicle_type: hb.mavtype,
                        sys_id: header.system_id,
                        firmware: FirmwareVersion::default(),
                    });
                    break;
                }
                Ok(_) => continue,
                Err(e) if e.is_timeout() => break,
                Err(e) => return Err(e),
            }
        }

        let mut identity = identity.ok_or(LinkError::NoHeartbeat)?;

        for attempt in 0..SEND_RETRIES {
            let request = MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
                command: MavCmd::MAV_CMD_REQUEST_AUTOPILOT_CAPABILITIES,
                target_system: ARDUPILOT_SYSTEM_ID,
                target_component: ARDUPILOT_COMPONENT_ID,
                confirmation: attempt as u8,
                param1: 1.0,
                ..Default::default()
            });
            let header = self.gcs_header();
            if let Err(e) = self.send(header, &request) {
                warn!("failed to send capabilities request: {e}");
            } else {
                for _ in 0..RECEIVE_RETRIES {
                    if let Ok((header, MavMessage::AUTOPILOT_VERSION(version))) =
                        self.receive(ACK_TIMEOUT)
                    {
                        identity.sys_id = header.system_id;
                        identity.firmware = FirmwareVersion::from_raw(version.flight_sw_version);
                        return Ok(identity);
                    }
                }
            }
            thread::sleep(RECEIVE_RETRY_DELAY);
        }

        info!("AUTOPILOT_VERSION not received; firmware version unknown");
        Ok(identity)
    }

    /// Send a frame toward the autopilot and wait for the acknowledgement
    /// its kind expects.
    ///
    /// Returns the acknowledgement re-encoded under the autopilot ids (the
    /// inbound frame's CRC binds it to its origin ids, so it cannot be
    /// forwarded unchanged), a synthesized failure ack after the retry
    /// budget runs out, or `None` for send-only message kinds.
    pub fn send_and_ack(&mut self, header: MavHeader, msg: &MavMessage) -> Option<MavMessage> {
        let rule = AckRule::classify(header, msg);

        for _ in 0..SEND_RETRIES {
            match self.send(header, msg) {
                Ok(()) => {
                    if matches!(rule, AckRule::SendOnly) {
                        return None;
                    }
                    if let Some(ack) = self.receive_ack(&rule) {
                        debug!("ACK received from autopilot");
                        return Some(ack);
                    }
                }
                Err(e) => warn!("failed to send message to autopilot: {e}"),
            }
        }

        warn!("no acknowledgement from autopilot; synthesizing failure ack");
        rule.failed()
    }

    fn receive_ack(&mut self, rule: &AckRule) -> Option<MavMessage> {
        for _ in 0..RECEIVE_RETRIES {
            if let Ok((_, reply)) = self.receive(ACK_TIMEOUT) {
                if let Some(ack) = rule.rebuild(&reply) {
                    return Some(ack);
                }
            }
            thread::sleep(RECEIVE_RETRY_DELAY);
        }
        None
    }
}

/// Per-request acknowledgement rules, keyed by the request's message kind.
///
/// `rebuild` turns a matching reply into the ack forwarded over the
/// satellite link; `failed` fabricates the ack used when the retry budget is
/// exhausted.
#[derive(Debug, Clone)]
enum AckRule {
    /// COMMAND_LONG / COMMAND_INT — expects COMMAND_ACK.
    Command { command: MavCmd },
    /// MISSION_ITEM — expects MISSION_ACK or MISSION_REQUEST.
    MissionItem { sys: u8, comp: u8 },
    /// PARAM_SET — expects PARAM_VALUE; the ack echoes the request.
    ParamSet {
        param_id: [u8; 16],
        value: f32,
        ptype: mavlink::common::MavParamType,
    },
    /// Everything else — no acknowledgement protocol.
    SendOnly,
}

impl AckRule {
    fn classify(header: MavHeader, msg: &MavMessage) -> Self {
        match msg {
            MavMessage::COMMAND_LONG(cmd) => AckRule::Command { command: cmd.command },
            MavMessage::COMMAND_INT(cmd) => AckRule::Command { command: cmd.command },
            MavMessage::MISSION_ITEM(_) => AckRule::MissionItem {
                sys: header.system_id,
                comp: header.component_id,
            },
            MavMessage::PARAM_SET(set) => AckRule::ParamSet {
                param_id: set.param_id,
                value: set.param_value,
                ptype: set.param_type,
            },
            _ => AckRule::SendOnly,
        }
    }

    /// Rebuild the ack from a matching autopilot reply; `None` if the reply
    /// is not the kind this request expects.
    fn rebuild(&self, reply: &MavMessage) -> Option<MavMessage> {
        match (self, reply) {
            (AckRule::Command { .. }, MavMessage::COMMAND_ACK(ack)) => {
                Some(MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
                    command: ack.command,
                    result: ack.result,
                    ..Default::default()
                }))
            }
            (AckRule::MissionItem { sys, comp }, MavMessage::MISSION_ACK(ack)) => {
                Some(MavMessage::MISSION_ACK(MISSION_ACK_DATA {
                    target_system: *sys,
                    target_component: *comp,
                    mavtype: ack.mavtype,
                    ..Default::default()
                }))
            }
            // The autopilot asking for the next item means this one landed.
            (AckRule::MissionItem { sys, comp }, MavMessage::MISSION_REQUEST(_)) => {
                Some(MavMessage::MISSION_ACK(MISSION_ACK_DATA {
                    target_system: *sys,
                    target_component: *comp,
                    mavtype: MavMissionResult::MAV_MISSION_ACCEPTED,
                    ..Default::default()
                }))
            }
            (AckRule::ParamSet { .. }, MavMessage::PARAM_VALUE(_)) => self.param_echo(),
            _ => None,
        }
    }

    /// The ack fabricated when no matching reply ever arrived.
    fn failed(&self) -> Option<MavMessage> {
        match self {
            AckRule::Command { command } => {
                Some(MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
                    command: *command,
                    result: MavResult::MAV_RESULT_FAILED,
                    ..Default::default()
                }))
            }
            AckRule::MissionItem { sys, comp } => {
                Some(MavMessage::MISSION_ACK(MISSION_ACK_DATA {
                    target_system: *sys,
                    target_component: *comp,
                    mavtype: MavMissionResult::MAV_MISSION_ERROR,
                    ..Default::default()
                }))
            }
            // "We tried": echo the requested value whether or not it stuck.
            AckRule::ParamSet { .. } => self.param_echo(),
            AckRule::SendOnly => None,
        }
    }

    fn param_echo(&self) -> Option<MavMessage> {
        if let AckRule::ParamSet { param_id, value, ptype } = self {
            Some(MavMessage::PARAM_VALUE(PARAM_VALUE_DATA {
                param_value: *value,
                param_count: 0,
                param_index: 0,
                param_id: *param_id,
                param_type: *ptype,
            }))
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeTransport;
    use mavlink::common::{
        HEARTBEAT_DATA, MavParamType, AUTOPILOT_VERSION_DATA, COMMAND_INT_DATA,
        MISSION_ITEM_DATA, PARAM_SET_DATA, REQUEST_DATA_STREAM_DATA,
    };

    fn autopilot_header(seq: u8) -> MavHeader {
        MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: seq,
        }
    }

    fn gcs_header(seq: u8) -> MavHeader {
        MavHeader {
            system_id: 255,
            component_id: 190,
            sequence: seq,
        }
    }

    fn heartbeat(autopilot: MavAutopilot) -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_FIXED_WING,
            autopilot,
            base_mode: mavlink::common::MavModeFlag::empty(),
            system_status: mavlink::common::MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    fn wire(header: MavHeader, msg: &MavMessage) -> Vec<u8> {
        codec::encode(MavlinkVersion::V2, header, msg)
    }

    #[test]
    fn receive_returns_first_complete_frame() {
        let mut io = FakeTransport::default();
        io.push_rx(&wire(autopilot_header(7), &heartbeat(MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA)));
        let mut link = MavLink::new(io);

        let (header, msg) = link.receive(Duration::from_millis(100)).unwrap();
        assert_eq!(header.sequence, 7);
        assert!(matches!(msg, MavMessage::HEARTBEAT(_)));
    }

    #[test]
    fn receive_times_out_on_silence() {
        let mut link = MavLink::new(FakeTransport::default());
        let err = link.receive(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn seq_is_strictly_monotonic_mod_256() {
        let mut link = MavLink::new(FakeTransport::default());
        link.seq = 250;
        let seqs: Vec<u8> = (0..10).map(|_| link.next_seq()).collect();
        for pair in seqs.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1));
        }
    }

    #[test]
    fn command_ack_carries_original_command() {
        let mut io = FakeTransport::default();
        let reply = MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
            command: MavCmd::MAV_CMD_DO_SET_MODE,
            result: MavResult::MAV_RESULT_ACCEPTED,
            ..Default::default()
        });
        io.push_rx(&wire(autopilot_header(0), &reply));
        let mut link = MavLink::new(io);

        let request = MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            command: MavCmd::MAV_CMD_DO_SET_MODE,
            target_system: 1,
            target_component: 1,
            param1: 1.0,
            ..Default::default()
        });
        let ack = link.send_and_ack(gcs_header(0), &request).unwrap();
        match ack {
            MavMessage::COMMAND_ACK(ack) => {
                assert_eq!(ack.command, MavCmd::MAV_CMD_DO_SET_MODE);
                assert_eq!(ack.result, MavResult::MAV_RESULT_ACCEPTED);
            }
            other => panic!("unexpected ack {other:?}"),
        }
    }

    #[test]
    fn command_int_exhaustion_synthesizes_failed_ack() {
        let mut link = MavLink::new(FakeTransport::default());
        let request = MavMessage::COMMAND_INT(COMMAND_INT_DATA {
            command: MavCmd::MAV_CMD_DO_SET_HOME,
            ..Default::default()
        });
        let ack = link.send_and_ack(gcs_header(0), &request).unwrap();
        match ack {
            MavMessage::COMMAND_ACK(ack) => {
                assert_eq!(ack.command, MavCmd::MAV_CMD_DO_SET_HOME);
                assert_eq!(ack.result, MavResult::MAV_RESULT_FAILED);
            }
            other => panic!("unexpected ack {other:?}"),
        }
    }

    #[test]
    fn mission_item_ack_targets_requesting_peer() {
        let mut io = FakeTransport::default();
        let reply = MavMessage::MISSION_ACK(MISSION_ACK_DATA {
            target_system: 255,
            target_component: 190,
            mavtype: MavMissionResult::MAV_MISSION_ACCEPTED,
            ..Default::default()
        });
        io.push_rx(&wire(autopilot_header(0), &reply));
        let mut link = MavLink::new(io);

        let item = MavMessage::MISSION_ITEM(MISSION_ITEM_DATA {
            seq: 2,
            ..Default::default()
        });
        let ack = link.send_and_ack(gcs_header(9), &item).unwrap();
        match ack {
            MavMessage::MISSION_ACK(ack) => {
                assert_eq!(ack.target_system, 255);
                assert_eq!(ack.target_component, 190);
                assert_eq!(ack.mavtype, MavMissionResult::MAV_MISSION_ACCEPTED);
            }
            other => panic!("unexpected ack {other:?}"),
        }
    }

    #[test]
    fn mission_item_timeout_synthesizes_error_ack() {
        let mut link = MavLink::new(FakeTransport::default());
        let item = MavMessage::MISSION_ITEM(MISSION_ITEM_DATA {
            seq: 0,
            ..Default::default()
        });
        let ack = link.send_and_ack(gcs_header(1), &item).unwrap();
        match ack {
            MavMessage::MISSION_ACK(ack) => {
                assert_eq!(ack.mavtype, MavMissionResult::MAV_MISSION_ERROR);
            }
            other => panic!("unexpected ack {other:?}"),
        }
    }

    #[test]
    fn param_set_echoes_requested_value_even_on_timeout() {
        let mut link = MavLink::new(FakeTransport::default());
        let mut param_id = [0u8; 16];
        param_id[..4].copy_from_slice(b"RATE");
        let set = MavMessage::PARAM_SET(PARAM_SET_DATA {
            param_value: 4.5,
            target_system: 1,
            target_component: 1,
            param_id,
            param_type: MavParamType::MAV_PARAM_TYPE_REAL32,
        });
        let ack = link.send_and_ack(gcs_header(2), &set).unwrap();
        match ack {
            MavMessage::PARAM_VALUE(pv) => {
                assert_eq!(pv.param_id, param_id);
                assert_eq!(pv.param_value, 4.5);
                assert_eq!(pv.param_count, 0);
                assert_eq!(pv.param_index, 0);
            }
            other => panic!("unexpected ack {other:?}"),
        }
    }

    #[test]
    fn send_only_kinds_get_no_ack() {
        let mut io = FakeTransport::default();
        io.push_rx(&wire(autopilot_header(0), &heartbeat(MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA)));
        let mut link = MavLink::new(io);

        let stream = MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
            target_system: 1,
            target_component: 1,
            req_stream_id: 0,
            req_message_rate: 2,
            start_stop: 1,
        });
        assert!(link.send_and_ack(gcs_header(3), &stream).is_none());
    }

    #[test]
    fn identity_handshake_full() {
        let mut io = FakeTransport::default();
        // GCS echo first; must be filtered out.
        io.push_rx(&wire(gcs_header(0), &heartbeat(MavAutopilot::MAV_AUTOPILOT_INVALID)));
        io.push_rx(&wire(autopilot_header(1), &heartbeat(MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA)));
        io.push_rx(&wire(
            autopilot_header(2),
            &MavMessage::AUTOPILOT_VERSION(AUTOPILOT_VERSION_DATA {
                flight_sw_version: 0x0403_06FF,
                ..Default::default()
            }),
        ));
        let mut link = MavLink::new(io);

        let identity = link.request_identity().unwrap();
        assert_eq!(identity.vendor, MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA);
        assert_eq!(identity.vehicle_type, MavType::MAV_TYPE_FIXED_WING);
        assert_eq!(identity.sys_id, 1);
        assert_eq!(
            identity.firmware,
            FirmwareVersion { major: 4, minor: 3, patch: 6, variant: 255 }
        );
        assert_eq!(identity.firmware.to_string(), "4.3.6/255");
    }

    #[test]
    fn identity_handshake_partial_without_version() {
        let mut io = FakeTransport::default();
        io.push_rx(&wire(autopilot_header(0), &heartbeat(MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA)));
        let mut link = MavLink::new(io);

        let identity = link.request_identity().unwrap();
        assert_eq!(identity.sys_id, 1);
        assert!(!identity.firmware.is_known());
        assert_eq!(identity.firmware.to_string(), "unknown");
    }

    #[test]
    fn identity_handshake_fails_without_heartbeat() {
        let mut link = MavLink::new(FakeTransport::default());
        assert!(matches!(link.request_identity(), Err(LinkError::NoHeartbeat)));
    }
}
