use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of the serial link and the timing of the stage driver.
///
/// Every field has a default so an empty YAML document is a valid config.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Serial port name. `None` scans all ports for the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Substring expected in the reply to the identification probe.
    #[serde(default = "default_device_signature")]
    pub device_signature: String,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_validation_timeout_ms")]
    pub validation_timeout_ms: u64,
    /// Cadence of the motion-completion poll.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Cadence of the background position/limit refresh.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// Time the controller needs to come back after `RESET`.
    #[serde(default = "default_reset_settle_ms")]
    pub reset_settle_ms: u64,
    /// Receive buffer size above which unframed input is discarded.
    #[serde(default = "default_max_buffer_len")]
    pub max_buffer_len: usize,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_device_signature() -> String {
    "MS2000".into()
}

fn default_command_timeout_ms() -> u64 {
    2000
}

fn default_validation_timeout_ms() -> u64 {
    1500
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_refresh_interval_ms() -> u64 {
    200
}

fn default_reset_settle_ms() -> u64 {
    1500
}

fn default_max_buffer_len() -> usize {
    4096
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            device_signature: default_device_signature(),
            command_timeout_ms: default_command_timeout_ms(),
            validation_timeout_ms: default_validation_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            refresh_interval_ms: default_refresh_interval_ms(),
            reset_settle_ms: default_reset_settle_ms(),
            max_buffer_len: default_max_buffer_len(),
        }
    }
}

impl StageConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }
}
