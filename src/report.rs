//! High-latency telemetry summary.
//!
//! [`HighLatencyReport`] folds the autopilot's telemetry stream into one
//! fixed-schema `HIGH_LATENCY` record with last-write-wins semantics per
//! field. Every field has a well-defined zero value, so the summary can be
//! encoded at any moment — including before any telemetry has arrived.

use mavlink::common::{
    MavAutopilot, MavMessage, MavSysStatusSensor, HIGH_LATENCY_DATA, SYS_STATUS_DATA,
};
use mavlink::MavHeader;

/// Failsafe bits reported in `HIGH_LATENCY.failsafe`, set when the matching
/// sensor is enabled but unhealthy in SYS_STATUS.
const FAILSAFE_GPS: u8 = 1 << 0;
const FAILSAFE_BATTERY: u8 = 1 << 1;
const FAILSAFE_RC: u8 = 1 << 2;

/// Stateful reducer from telemetry messages to one HIGH_LATENCY summary.
pub struct HighLatencyReport {
    summary: HIGH_LATENCY_DATA,
    /// Battery figures SYS_STATUS carries but the summary schema does not;
    /// kept for operator logging.
    voltage_mv: u16,
    current_ca: i16,
}

impl HighLatencyReport {
    pub fn new() -> Self {
        Self {
            summary: HIGH_LATENCY_DATA::default(),
            voltage_mv: 0,
            current_ca: 0,
        }
    }

    /// Fold one telemetry message into the summary. Messages that carry no
    /// summarized field are ignored.
    pub fn update(&mut self, msg: &MavMessage) {
        let s = &mut self.summary;
        match msg {
            MavMessage::HEARTBEAT(hb) => {
                // GCS echoes forwarded by a telemetry radio carry INVALID.
                if hb.autopilot != MavAutopilot::MAV_AUTOPILOT_INVALID {
                    s.base_mode = hb.base_mode;
                    s.custom_mode = hb.custom_mode;
                }
            }
            MavMessage::SYS_STATUS(status) => {
                s.battery_remaining = status.battery_remaining.max(0) as u8;
                s.failsafe = failsafe_bits(status);
                self.voltage_mv = status.voltage_battery;
                self.current_ca = status.current_battery;
            }
            MavMessage::ATTITUDE(att) => {
                s.roll = centidegrees(att.roll);
                s.pitch = centidegrees(att.pitch);
                s.heading = heading_centidegrees(att.yaw);
            }
            MavMessage::GLOBAL_POSITION_INT(pos) => {
                s.latitude = pos.lat;
                s.longitude = pos.lon;
                s.altitude_amsl = (pos.alt / 1000).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
                if pos.hdg != u16::MAX {
                    s.heading = pos.hdg;
                }
            }
            MavMessage::GPS_RAW_INT(gps) => {
                s.gps_fix_type = gps.fix_type;
                s.gps_nsat = gps.satellites_visible;
            }
            MavMessage::VFR_HUD(hud) => {
                s.airspeed = hud.airspeed.clamp(0.0, u8::MAX as f32) as u8;
                s.groundspeed = hud.groundspeed.clamp(0.0, u8::MAX as f32) as u8;
                s.throttle = hud.throttle.min(100) as i8;
                s.climb_rate = hud.climb.clamp(i8::MIN as f32, i8::MAX as f32) as i8;
            }
            MavMessage::NAV_CONTROLLER_OUTPUT(nav) => {
                s.wp_distance = nav.wp_dist;
                s.heading_sp = nav.nav_bearing.saturating_mul(100);
            }
            MavMessage::MISSION_CURRENT(current) => {
                s.wp_num = current.seq.min(u8::MAX as u16) as u8;
            }
            MavMessage::SCALED_PRESSURE(pressure) => {
                s.temperature =
                    (pressure.temperature / 100).clamp(i8::MIN as i16, i8::MAX as i16) as i8;
            }
            _ => {}
        }
    }

    /// Encode the current snapshot as a HIGH_LATENCY frame under `header`.
    /// Never blocks; safe to call at any time.
    pub fn encode(&self, header: MavHeader) -> (MavHeader, MavMessage) {
        (header, MavMessage::HIGH_LATENCY(self.summary.clone()))
    }

    /// Battery voltage in millivolts, as last seen in SYS_STATUS.
    pub fn battery_voltage_mv(&self) -> u16 {
        self.voltage_mv
    }

    /// Battery current in centiamps, as last seen in SYS_STATUS.
    pub fn battery_current_ca(&self) -> i16 {
        self.current_ca
    }
}

impl Default for HighLatencyReport {
    fn default() -> Self {
        Self::new()
    }
}

/// radians → centidegrees, saturating.
fn centidegrees(rad: f32) -> i16 {
    (rad.to_degrees() * 100.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// radians → centidegrees normalized to [0, 36000).
fn heading_centidegrees(rad: f32) -> u16 {
    let deg = rad.to_degrees().rem_euclid(360.0);
    ((deg * 100.0).round() as u32 % 36_000) as u16
}

fn failsafe_bits(status: &SYS_STATUS_DATA) -> u8 {
    let mut bits = 0;
    let tracked = [
        (FAILSAFE_GPS, MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_GPS),
        (FAILSAFE_BATTERY, MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_BATTERY),
        (FAILSAFE_RC, MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_RC_RECEIVER),
    ];
    for (bit, sensor) in tracked {
        if status.onboard_control_sensors_enabled.contains(sensor)
            && !status.onboard_control_sensors_health.contains(sensor)
        {
            bits |= bit;
        }
    }
    bits
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
