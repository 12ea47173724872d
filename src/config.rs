//! Gateway configuration.
//!
//! A passive record assembled from the command line at startup. Read-only
//! for the process lifetime with one exception: `report_period` may be
//! rewritten by a ground-issued `PARAM_SET` (see the session dispatcher).

use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;
use crate::serial::SUPPORTED_BAUD_RATES;

pub const DEFAULT_MAVLINK_SERIAL: &str = "/dev/ttyUSB0";
pub const DEFAULT_ISBD_SERIAL: &str = "/dev/ttyUSB1";
pub const DEFAULT_CANDIDATE_SERIALS: &str =
    "/dev/ttyUSB0,/dev/ttyUSB1,/dev/ttyUSB2,/dev/ttyS0,/dev/ttyAMA0";
pub const DEFAULT_MAVLINK_BAUD: u32 = 57_600;
pub const DEFAULT_ISBD_BAUD: u32 = 19_200;
pub const DEFAULT_REPORT_PERIOD_SECS: u64 = 300;

/// Command-line options; each one overrides its built-in default.
#[derive(Debug, Parser)]
#[command(
    name = "radioroom",
    about = "Iridium SBD telemetry gateway for MAVLink autopilots"
)]
pub struct Cli {
    /// Serial device of the autopilot link.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_MAVLINK_SERIAL)]
    pub mavlink_serial: String,

    /// Baud rate of the autopilot link.
    #[arg(long, value_name = "BAUD", default_value_t = DEFAULT_MAVLINK_BAUD)]
    pub mavlink_baud: u32,

    /// Serial device of the ISBD transceiver.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_ISBD_SERIAL)]
    pub isbd_serial: String,

    /// Baud rate of the ISBD transceiver link.
    #[arg(long, value_name = "BAUD", default_value_t = DEFAULT_ISBD_BAUD)]
    pub isbd_baud: u32,

    /// Probe the candidate device list for peers that do not answer on
    /// their configured devices.
    #[arg(long)]
    pub auto_detect: bool,

    /// Comma-separated list of candidate serial devices.
    #[arg(long, value_name = "LIST", default_value = DEFAULT_CANDIDATE_SERIALS)]
    pub serials: String,

    /// Summary report period in seconds.
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_REPORT_PERIOD_SECS)]
    pub report_period: u64,
}

/// Validated configuration record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mavlink_serial: String,
    pub mavlink_baud: u32,
    pub isbd_serial: String,
    pub isbd_baud: u32,
    pub auto_detect_serials: bool,
    pub candidate_serials: Vec<String>,
    pub report_period: Duration,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        for baud in [cli.mavlink_baud, cli.isbd_baud] {
            if !SUPPORTED_BAUD_RATES.contains(&baud) {
                return Err(ConfigError::BadBaud(baud));
            }
        }
        if cli.report_period == 0 {
            return Err(ConfigError::BadReportPeriod);
        }

        let candidate_serials: Vec<String> = cli
            .serials
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if cli.auto_detect && candidate_serials.is_empty() {
            return Err(ConfigError::NoCandidates);
        }

        Ok(Self {
            mavlink_serial: cli.mavlink_serial.clone(),
            mavlink_baud: cli.mavlink_baud,
            isbd_serial: cli.isbd_serial.clone(),
            isbd_baud: cli.isbd_baud,
            auto_detect_serials: cli.auto_detect,
            candidate_serials,
            report_period: Duration::from_secs(cli.report_period),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["radioroom"];
        argv.extend(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn defaults_match_the_documented_record() {
        let config = Config::from_cli(&parse(&[])).unwrap();
        assert_eq!(config.mavlink_serial, "/dev/ttyUSB0");
        assert_eq!(config.mavlink_baud, 57_600);
        assert_eq!(config.isbd_serial, "/dev/ttyUSB1");
        assert_eq!(config.isbd_baud, 19_200);
        assert!(!config.auto_detect_serials);
        assert_eq!(config.candidate_serials.len(), 5);
        assert_eq!(config.report_period, Duration::from_secs(300));
    }

    #[test]
    fn options_override_defaults() {
        let config = Config::from_cli(&parse(&[
            "--mavlink-serial",
            "/dev/ttyAMA0",
            "--isbd-serial",
            "/dev/ttyS0",
            "--auto-detect",
            "--serials",
            "/dev/ttyS0, /dev/ttyS1",
            "--report-period",
            "60",
        ]))
        .unwrap();
        assert_eq!(config.mavlink_serial, "/dev/ttyAMA0");
        assert_eq!(config.isbd_serial, "/dev/ttyS0");
        assert!(config.auto_detect_serials);
        assert_eq!(config.candidate_serials, vec!["/dev/ttyS0", "/dev/ttyS1"]);
        assert_eq!(config.report_period, Duration::from_secs(60));
    }

    #[test]
    fn unsupported_baud_is_rejected() {
        let result = Config::from_cli(&parse(&["--mavlink-baud", "14400"]));
        assert!(matches!(result, Err(ConfigError::BadBaud(14_400))));
    }

    #[test]
    fn zero_report_period_is_rejected() {
        let result = Config::from_cli(&parse(&["--report-period", "0"]));
        assert!(matches!(result, Err(ConfigError::BadReportPeriod)));
    }

    #[test]
    fn empty_candidate_list_with_auto_detect_is_rejected() {
        let result = Config::from_cli(&parse(&["--auto-detect", "--serials", " , "]));
        assert!(matches!(result, Err(ConfigError::NoCandidates)));
    }
}
