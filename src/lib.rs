pub mod codec;
pub mod config;
pub mod error;
pub mod link;
pub mod modem;
pub mod report;
pub mod serial;
pub mod session;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{Cli, Config};
pub use error::{ConfigError, LinkError, SbdError, SerialError};
pub use link::{AutopilotIdentity, FirmwareVersion, MavLink};
pub use modem::{IsbdModem, SbdStatus, SbdTransceiver};
pub use report::HighLatencyReport;
pub use serial::{SerialTransport, Transport};
pub use session::RadioRoom;
