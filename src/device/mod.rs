//! Device abstraction consumed by the executor.
//!
//! Physical transports (SSH/Telnet drivers) live outside this crate; the
//! executor only sees the [`Device`] trait. Two stand-ins ship here:
//! [`scripted::ScriptedDevice`] replays canned responses for dry runs and
//! tests, [`process::ProcessDevice`] drives a local shell as a pseudo
//! test PC.
//!
//! `expect` patterns are regular expressions (`regex` crate) in both
//! shipped implementations; that is the documented dialect of this
//! boundary. A device's buffer advances monotonically: output consumed by
//! a successful `expect` is never matched again.

pub mod process;
pub mod scripted;

use std::time::Duration;

use async_trait::async_trait;

use crate::config::DeviceConfig;

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors surfaced by device transports.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The transport to the device is gone.
    ///
    /// Fatal for the run unless the device's keep-running flag is set.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A command could not be delivered.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The expect pattern is not a valid regex.
    #[error("Invalid expect pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: Box<regex::Error>,
    },

    /// I/O error talking to the transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single device session, owned exclusively by one executor per run.
#[async_trait]
pub trait Device: Send {
    /// The section name this device answers to.
    fn name(&self) -> &str;

    /// Delivers one command line to the device.
    async fn send(&mut self, text: &str) -> DeviceResult<()>;

    /// Waits until `pattern` matches the unread buffer or `timeout`
    /// elapses. A zero timeout checks the current buffer exactly once.
    ///
    /// On a match the buffer advances past the matched text. Returns the
    /// output seen (matched portion, or the unread buffer on timeout).
    async fn expect(&mut self, pattern: &str, timeout: Duration) -> DeviceResult<(bool, String)>;

    /// Snapshot of the unread buffer. Does not advance the read position.
    fn get_buffer(&self) -> String;

    /// Re-establishes the session after a connection loss. Optional;
    /// the default does nothing.
    async fn force_login(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    /// Turns device-level runtime errors into recorded failures instead
    /// of fatal halts.
    fn set_keep_running(&mut self, _keep: bool) {}

    fn keep_running(&self) -> bool {
        false
    }
}

/// Builds a device stand-in from its config entry.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// use fosrun::config::{DeviceConfig, ScriptedDeviceConfig};
/// use fosrun::device::build_device;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let config = DeviceConfig::Scripted(ScriptedDeviceConfig::default());
/// let device = build_device("FGT1", &config, Duration::from_millis(250)).await?;
/// assert_eq!(device.name(), "FGT1");
/// # Ok(())
/// # }
/// ```
pub async fn build_device(
    name: &str,
    config: &DeviceConfig,
    expect_poll: Duration,
) -> DeviceResult<Box<dyn Device>> {
    match config {
        DeviceConfig::Scripted(cfg) => {
            let mut dev = scripted::ScriptedDevice::new(name, cfg)?;
            dev.set_keep_running(cfg.keep_running);
            Ok(Box::new(dev))
        }
        DeviceConfig::Process(cfg) => {
            let mut dev = process::ProcessDevice::spawn(name, cfg, expect_poll).await?;
            dev.set_keep_running(cfg.keep_running);
            Ok(Box::new(dev))
        }
    }
}
