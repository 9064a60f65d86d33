//! Command-line and environment configuration.
//!
//! Every option can come from a flag or an environment variable; the flag
//! wins. Options are validated once at startup and then passed down by value,
//! nothing here is global.

use crate::mac_address::MacAddress;
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// Default MQTT topic prefix.
pub const DEFAULT_BASE_TOPIC: &str = "homeassistant/2jciebl-bu-ble";

#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Comma-separated BLE device addresses to listen for.
    /// Format: -a AA:BB:CC:DD:EE:FF,11:22:33:44:55:66
    #[arg(
        short,
        long,
        env = "BLE_ADDRESSES",
        value_delimiter = ',',
        value_parser = parse_address,
        required = true,
        value_name = "ADDRESSES"
    )]
    pub addresses: Vec<MacAddress>,

    #[command(flatten)]
    pub mqtt: MqttSettings,

    /// Base MQTT topic; each device publishes to <topic>/<address>.
    #[arg(short = 't', long = "mqtt-topic", env = "MQTT_TOPIC", default_value = DEFAULT_BASE_TOPIC)]
    pub base_topic: String,

    /// Bluetooth adapter index (0 for hci0).
    #[arg(short = 'd', long = "adapter", env = "BT_DEV_ID", default_value_t = 0)]
    pub adapter: u16,

    /// Warn when no HCI event arrives for this many seconds (0 disables).
    #[arg(long = "watchdog", env = "WATCHDOG_SECS", default_value_t = 60)]
    pub watchdog_secs: u64,

    /// Verbose output, log every discarded frame
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Bridge sensor broadcasts to MQTT (the default).
    Run,
    /// Print Home Assistant sensor configuration for the addresses and exit.
    HaConfig,
}

/// MQTT broker connection settings.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    /// MQTT broker host
    #[arg(short = 'H', long = "mqtt-host", env = "MQTT_SERVER", default_value = "localhost")]
    pub host: String,

    /// MQTT broker port
    #[arg(short = 'p', long = "mqtt-port", env = "MQTT_PORT", default_value_t = 1883)]
    pub port: u16,

    /// MQTT username
    #[arg(short = 'u', long = "mqtt-user", env = "MQTT_USERNAME")]
    pub username: Option<String>,

    /// MQTT password
    #[arg(short = 'P', long = "mqtt-pass", env = "MQTT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// MQTT client identifier
    #[arg(long = "mqtt-client-id", env = "MQTT_CLIENT_ID", default_value = "omron-env-mqtt")]
    pub client_id: String,
}

impl MqttSettings {
    /// Username and password, when both are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        }
    }
}

/// Configuration rejected at startup.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("MQTT username given without a password")]
    MissingPassword,
    #[error("MQTT password given without a username")]
    MissingUsername,
    #[error("MQTT base topic must not be empty")]
    EmptyTopic,
    #[error("no device addresses given")]
    NoAddresses,
}

impl Options {
    /// Check the combinations clap cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.mqtt.username, &self.mqtt.password) {
            (Some(_), None) => return Err(ConfigError::MissingPassword),
            (None, Some(_)) => return Err(ConfigError::MissingUsername),
            _ => {}
        }
        if self.base_topic.trim_matches('/').is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if self.addresses.is_empty() {
            return Err(ConfigError::NoAddresses);
        }
        Ok(())
    }

    /// Configured addresses with duplicates removed.
    pub fn watched_devices(&self) -> BTreeSet<MacAddress> {
        self.addresses.iter().copied().collect()
    }

    pub fn watchdog(&self) -> Option<Duration> {
        (self.watchdog_secs > 0).then(|| Duration::from_secs(self.watchdog_secs))
    }
}

/// Parse one entry of the address list.
pub fn parse_address(src: &str) -> Result<MacAddress, String> {
    src.trim()
        .parse()
        .map_err(|e| format!("'{}': {}", src.trim(), e))
}
