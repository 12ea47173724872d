//! ISBD session orchestration.
//!
//! The perpetual gateway loop: request telemetry streams, fold inbound
//! traffic into the high-latency summary, poll the modem, and when a ring
//! alert arrives or the report period elapses, run one half-duplex SBD
//! session that uploads the summary and drains whatever the ground station
//! queued in orbit (commands, parameter writes, mission uploads).

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mavlink::common::{
    MavDataStream, MavMessage, MavMissionResult, MISSION_ACK_DATA, MISSION_COUNT_DATA,
    PARAM_VALUE_DATA, REQUEST_DATA_STREAM_DATA,
};
use mavlink::{MavHeader, MavlinkVersion};

use crate::codec;
use crate::link::{MavLink, ARDUPILOT_COMPONENT_ID, ARDUPILOT_SYSTEM_ID, SEND_RETRIES};
use crate::modem::SbdTransceiver;
use crate::report::HighLatencyReport;
use crate::serial::Transport;

/// Parameter the ground station writes to change the reporting interval.
pub const REPORT_PERIOD_PARAM: &str = "HL_REPORT_PERIOD";

/// Largest mission the gateway can buffer during an upload.
pub const MAX_MISSION_COUNT: usize = 30;

/// Data streams requested from the autopilot each loop iteration, with their
/// rates in Hz.
const STREAM_REQUESTS: [(MavDataStream, u16); 5] = [
    (MavDataStream::MAV_DATA_STREAM_EXTRA1, 2),
    (MavDataStream::MAV_DATA_STREAM_EXTRA2, 3),
    (MavDataStream::MAV_DATA_STREAM_EXTENDED_STATUS, 2),
    (MavDataStream::MAV_DATA_STREAM_POSITION, 2),
    (MavDataStream::MAV_DATA_STREAM_RAW_CONTROLLER, 2),
];

/// Telemetry receive attempts per loop iteration.
const TELEMETRY_POLLS: usize = 100;
/// Timeout of one telemetry receive attempt; also paces the loop.
const TELEMETRY_POLL_TIMEOUT: Duration = Duration::from_millis(10);
/// Pause between consecutive sends toward the autopilot.
const INTER_SEND_DELAY: Duration = Duration::from_millis(10);
/// Back-off after a failed modem round-trip during mission collection.
const MODEM_RETRY_DELAY: Duration = Duration::from_secs(5);

/// The gateway's main state: one autopilot link, one satellite modem, the
/// rolling telemetry summary, and the report schedule.
pub struct RadioRoom<T: Transport, M: SbdTransceiver> {
    link: MavLink<T>,
    modem: M,
    report: HighLatencyReport,
    /// Mutable at runtime via a ground-issued PARAM_SET; single-threaded, so
    /// no synchronization.
    report_period: Duration,
    last_report: Instant,
}

impl<T: Transport, M: SbdTransceiver> RadioRoom<T, M> {
    pub fn new(link: MavLink<T>, modem: M, report_period: Duration) -> Self {
        Self {
            link,
            modem,
            report: HighLatencyReport::new(),
            report_period,
            last_report: Instant::now(),
        }
    }

    /// Current reporting interval (may have been changed from the ground).
    pub fn report_period(&self) -> Duration {
        self.report_period
    }

    /// Run the gateway forever. Every fault inside a tick has a local
    /// recovery; nothing propagates out of the loop.
    pub fn run(&mut self) -> ! {
        loop {
            self.tick();
        }
    }

    /// One iteration of the periodic loop (≈ 1 Hz under quiet serial links).
    pub fn tick(&mut self) {
        self.request_data_streams();
        self.poll_telemetry();

        let ring_alert = match self.modem.status_extended() {
            Ok(status) => {
                debug!(
                    "SBDSX: ring_alert={} waiting={}",
                    status.ring_alert, status.waiting
                );
                status.ring_alert
            }
            Err(e) => {
                info!("SBDSX failed: {e}");
                false
            }
        };

        if ring_alert || self.last_report.elapsed() > self.report_period {
            let header = self.link.ardupilot_header();
            let (header, summary) = self.report.encode(header);
            self.isbd_session(Some((header, summary)));
            self.last_report = Instant::now();
        }
    }

    fn request_data_streams(&mut self) {
        for (stream, rate) in STREAM_REQUESTS {
            let request = MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
                target_system: ARDUPILOT_SYSTEM_ID,
                target_component: ARDUPILOT_COMPONENT_ID,
                req_stream_id: stream as u8,
                req_message_rate: rate,
                start_stop: 1,
            });
            let header = self.link.gcs_header();
            if let Err(e) = self.link.send(header, &request) {
                warn!("failed to send stream request to autopilot: {e}");
            }
            thread::sleep(INTER_SEND_DELAY);
        }
    }

    fn poll_telemetry(&mut self) {
        for _ in 0..TELEMETRY_POLLS {
            match self.link.receive(TELEMETRY_POLL_TIMEOUT) {
                Ok((_, msg)) => self.report.update(&msg),
                Err(e) if e.is_timeout() => {}
                Err(e) => {
                    warn!("autopilot receive failed: {e}");
                    break;
                }
            }
        }
    }

    /// One half-duplex SBD session: exchange until the outbound slot is
    /// empty and the orbit-side queue is drained. A failed exchange keeps
    /// the MO frame for the next round; after `SEND_RETRIES` consecutive
    /// failures the session is abandoned and the main loop will retry later.
    fn isbd_session(&mut self, mo: Option<(MavHeader, MavMessage)>) {
        debug!("ISBD session started");
        let mut mo = mo;
        let mut failures = 0;

        loop {
            let mut ack_this_round = false;
            let mo_bytes = mo
                .as_ref()
                .map(|(header, msg)| codec::encode(MavlinkVersion::V2, *header, msg))
                .unwrap_or_default();

            match self.modem.send_receive(&mo_bytes) {
                Ok(mt) => {
                    failures = 0;
                    mo = None;
                    if let Some(bytes) = mt {
                        match codec::decode_first(&bytes) {
                            Some((header, msg)) => {
                                mo = self.dispatch(header, msg);
                                ack_this_round = mo.is_some();
                            }
                            None => debug!("undecodable MT payload ({} bytes)", bytes.len()),
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    info!("SBD exchange failed: {e}");
                    if failures >= SEND_RETRIES {
                        warn!("abandoning ISBD session after {failures} failed exchanges");
                        break;
                    }
                }
            }

            if self.modem.mailbox_depth() == 0 && !ack_this_round {
                break;
            }
        }
        debug!("ISBD session ended");
    }

    /// Route one MT message; the returned frame is the next MO upload.
    fn dispatch(
        &mut self,
        header: MavHeader,
        msg: MavMessage,
    ) -> Option<(MavHeader, MavMessage)> {
        match msg {
            MavMessage::PARAM_SET(ref set) if param_matches(&set.param_id, REPORT_PERIOD_PARAM) => {
                let secs = set.param_value;
                if secs.is_finite() && secs >= 0.0 {
                    self.report_period = Duration::from_secs_f64(f64::from(secs));
                    info!("report period set to {:?}", self.report_period);
                }
                let echo = MavMessage::PARAM_VALUE(PARAM_VALUE_DATA {
                    param_value: set.param_value,
                    param_count: 0,
                    param_index: 0,
                    param_id: set.param_id,
                    param_type: set.param_type,
                });
                Some((self.link.ardupilot_header(), echo))
            }
            MavMessage::MISSION_COUNT(count) => {
                let ack = self.receive_mission(header, &count);
                Some((self.link.ardupilot_header(), ack))
            }
            other => match self.link.send_and_ack(header, &other) {
                Some(ack) => Some((self.link.ardupilot_header(), ack)),
                None => None,
            },
        }
    }

    /// Mission-upload sub-protocol: buffer the announced items from orbit,
    /// then replay the whole transfer toward the autopilot. The autopilot's
    /// final MISSION_ACK is authoritative.
    fn receive_mission(&mut self, origin: MavHeader, count: &MISSION_COUNT_DATA) -> MavMessage {
        let total = count.count as usize;
        debug!("MISSION_COUNT received: {total} items");

        if total > MAX_MISSION_COUNT {
            info!("mission of {total} items exceeds the {MAX_MISSION_COUNT}-item buffer");
            return mission_ack(origin, MavMissionResult::MAV_MISSION_NO_SPACE);
        }

        let mut items: Vec<(MavHeader, MavMessage)> = Vec::with_capacity(total);
        for _ in 0..total * SEND_RETRIES {
            if items.len() == total {
                break;
            }
            match self.modem.send_receive(&[]) {
                Ok(Some(bytes)) => {
                    if let Some((header, item @ MavMessage::MISSION_ITEM(_))) =
                        codec::decode_first(&bytes)
                    {
                        debug!("MISSION_ITEM {} received", items.len());
                        items.push((header, item));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    info!("SBD exchange failed during mission collection: {e}");
                    thread::sleep(MODEM_RETRY_DELAY);
                }
            }
        }
        if items.len() != total {
            info!("mission upload incomplete: {}/{total} items received", items.len());
            return mission_ack(origin, MavMissionResult::MAV_MISSION_ERROR);
        }

        for _ in 0..SEND_RETRIES {
            if self
                .link
                .send(origin, &MavMessage::MISSION_COUNT(count.clone()))
                .is_ok()
            {
                break;
            }
            thread::sleep(INTER_SEND_DELAY);
        }

        let mut final_ack = mission_ack(origin, MavMissionResult::MAV_MISSION_ERROR);
        for (header, item) in items {
            if let Some(ack) = self.link.send_and_ack(header, &item) {
                final_ack = ack;
            }
            thread::sleep(INTER_SEND_DELAY);
        }

        match &final_ack {
            MavMessage::MISSION_ACK(ack)
                if ack.mavtype == MavMissionResult::MAV_MISSION_ACCEPTED =>
            {
                debug!("mission accepted by autopilot")
            }
            _ => debug!("mission not accepted by autopilot"),
        }
        final_ack
    }
}

fn mission_ack(origin: MavHeader, result: MavMissionResult) -> MavMessage {
    MavMessage::MISSION_ACK(MISSION_ACK_DATA {
        target_system: origin.system_id,
        target_component: origin.component_id,
        mavtype: result,
        ..Default::default()
    })
}

/// Compare a NUL-padded 16-byte parameter id against `name`.
fn param_matches(id: &[u8; 16], name: &str) -> bool {
    let id = id.split(|&b| b == 0).next().unwrap_or(&[]);
    id == name.as_bytes()
}

/// Build a NUL-padded 16-byte parameter id from a string.
pub fn param_id(name: &str) -> [u8; 16] {
    let mut id = [0u8; 16];
    let len = name.len().min(16);
    id[..len].copy_from_slice(&name.as_bytes()[..len]);
    id
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
