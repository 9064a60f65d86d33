//! `omron-env-mqtt` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup,
//! signal handling and process exit codes. The session logic lives in
//! [`crate::app`] where it can be tested deterministically with an injected
//! radio and publisher.

pub mod app;
pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod ha_config;
pub mod mac_address;
pub mod publisher;
pub mod reading;
pub mod scanner;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use app::{RunError, SessionConfig, SessionStats, run, run_session};
pub use config::{ConfigError, MqttSettings, Options};
pub use decoder::{DecodeError, Variant, classify, decode};
pub use dispatcher::{Dispatch, Dispatcher};
pub use mac_address::MacAddress;
pub use publisher::{MqttPublisher, Publish, PublishError, publish_reading, topic_for};
pub use reading::{BlReading, BuReading, FixedPoint, Reading, SensorData};
pub use scanner::{FrameResult, Radio, RawAdvertisement, ScanError};
