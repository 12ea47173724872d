//! Gateway daemon: wire the autopilot link and the ISBD modem together and
//! run the reporting loop forever.
//!
//! Exit codes: 1 invalid configuration, 2 unrecoverable initialization
//! failure. A silent autopilot or modem is *not* fatal — the loop runs and
//! reports zeroed summaries so the operator sees a silent vehicle rather
//! than a dead gateway.

use std::process;

use clap::Parser;
use log::{error, info, warn};

use radioroom::config::{Cli, Config};
use radioroom::link::{AutopilotIdentity, MavLink};
use radioroom::modem::IsbdModem;
use radioroom::serial::{self, SerialTransport};
use radioroom::session::RadioRoom;

const LOG_IDENTITY: &str = "radioroom";
const EXIT_BAD_CONFIG: i32 = 1;
const EXIT_INIT_FAILURE: i32 = 2;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = syslog::init(
        syslog::Facility::LOG_USER,
        log::LevelFilter::Debug,
        Some(LOG_IDENTITY),
    ) {
        eprintln!("syslog unavailable: {e}");
    }
    info!("radioroom started");

    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            eprintln!("invalid configuration: {e}");
            process::exit(EXIT_BAD_CONFIG);
        }
    };

    let candidates = if config.auto_detect_serials {
        let mut paths = config.candidate_serials.clone();
        for port in serial::system_ports() {
            if !paths.contains(&port) {
                paths.push(port);
            }
        }
        serial::enumerate(&paths, config.mavlink_baud)
    } else {
        Vec::new()
    };

    let (link, identity, autopilot_path) = connect_autopilot(&config, &candidates);
    match identity {
        Some(identity) => info!(
            "autopilot at '{autopilot_path}': vendor {:?}, vehicle type {:?}, system id {}, firmware version {}",
            identity.vendor, identity.vehicle_type, identity.sys_id, identity.firmware
        ),
        None => warn!("autopilot not responding; continuing with zeroed identity"),
    }

    let modem = connect_modem(&config, &candidates, &autopilot_path);

    info!("report period: {:?}", config.report_period);
    let mut room = RadioRoom::new(link, modem, config.report_period);
    room.run();
}

/// Connect the autopilot link: the configured device first, then any
/// remaining auto-detection candidates. A device counts as the autopilot
/// when the identity handshake sees a heartbeat.
fn connect_autopilot(
    config: &Config,
    candidates: &[String],
) -> (MavLink<SerialTransport>, Option<AutopilotIdentity>, String) {
    for path in device_order(&config.mavlink_serial, candidates, None) {
        let transport = match SerialTransport::open(&path, config.mavlink_baud) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };
        let mut link = MavLink::new(transport);
        match link.request_identity() {
            Ok(identity) => return (link, Some(identity), path),
            Err(e) => info!("no autopilot at '{path}': {e}"),
        }
    }

    // Peer absent: fall back to the configured device without a handshake.
    match SerialTransport::open(&config.mavlink_serial, config.mavlink_baud) {
        Ok(transport) => (
            MavLink::new(transport),
            None,
            config.mavlink_serial.clone(),
        ),
        Err(e) => {
            error!("cannot open autopilot serial device: {e}");
            process::exit(EXIT_INIT_FAILURE);
        }
    }
}

/// Connect the ISBD modem on whatever device answers an AT probe, excluding
/// the device the autopilot claimed.
fn connect_modem(
    config: &Config,
    candidates: &[String],
    autopilot_path: &str,
) -> IsbdModem<SerialTransport> {
    let mut isbd_serial = config.isbd_serial.clone();
    if isbd_serial == autopilot_path {
        if let Some(fallback) = candidates.iter().find(|p| p.as_str() != autopilot_path) {
            warn!(
                "autopilot detected at '{autopilot_path}', which was assigned to the ISBD transceiver; using '{fallback}' instead"
            );
            isbd_serial = fallback.clone();
        }
    }

    for path in device_order(&isbd_serial, candidates, Some(autopilot_path)) {
        let transport = match SerialTransport::open(&path, config.isbd_baud) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };
        let mut modem = IsbdModem::new(transport);
        match modem.probe() {
            Ok(()) => {
                info!("ISBD transceiver at '{path}'");
                return modem;
            }
            Err(e) => info!("no ISBD transceiver at '{path}': {e}"),
        }
    }

    // Modem absent: keep the configured device; SBDSX failures will be
    // logged every loop iteration until it answers.
    match SerialTransport::open(&isbd_serial, config.isbd_baud) {
        Ok(transport) => {
            warn!("ISBD transceiver not responding; continuing");
            IsbdModem::new(transport)
        }
        Err(e) => {
            error!("cannot open ISBD serial device: {e}");
            process::exit(EXIT_INIT_FAILURE);
        }
    }
}

/// Configured device first, then the remaining candidates, minus `exclude`.
fn device_order(configured: &str, candidates: &[String], exclude: Option<&str>) -> Vec<String> {
    let mut order = vec![configured.to_string()];
    order.extend(
        candidates
            .iter()
            .filter(|p| p.as_str() != configured && Some(p.as_str()) != exclude)
            .cloned(),
    );
    order.retain(|p| Some(p.as_str()) != exclude);
    order
}
