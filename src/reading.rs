//! Decoded sensor readings.
//!
//! Values are kept as scaled integers so that the published telemetry carries
//! exactly the precision the sensor reports.

use serde::{Serialize, Serializer};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A decimal value stored as `raw / 10^scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedPoint {
    raw: u32,
    scale: u8,
}

impl FixedPoint {
    pub const fn new(raw: u32, scale: u8) -> Self {
        Self { raw, scale }
    }
}

impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.raw);
        }
        let divisor = 10u64.pow(u32::from(self.scale));
        let raw = u64::from(self.raw);
        write!(
            f,
            "{}.{:0width$}",
            raw / divisor,
            raw % divisor,
            width = usize::from(self.scale)
        )
    }
}

impl Serialize for FixedPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn as_string<T: fmt::Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Reading broadcast by a 2JCIE-BU (USB type) sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuReading {
    pub company_id: String,
    /// Celsius, 2 decimals
    pub temperature: FixedPoint,
    /// Percent, 2 decimals
    pub relative_humidity: FixedPoint,
    /// Lux
    #[serde(serialize_with = "as_string")]
    pub ambient_light: u16,
    /// hPa, 3 decimals
    pub barometric_pressure: FixedPoint,
    /// dB, 2 decimals
    pub sound_noise: FixedPoint,
    /// ppb
    #[serde(serialize_with = "as_string")]
    pub etvoc: u16,
    /// ppm
    #[serde(serialize_with = "as_string")]
    pub eco2: u16,
}

/// Reading broadcast by a 2JCIE-BL (battery type) sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlReading {
    pub company_id: String,
    /// Wraps after 255
    #[serde(serialize_with = "as_string")]
    pub sequence_number: u8,
    pub temperature: FixedPoint,
    pub relative_humidity: FixedPoint,
    #[serde(serialize_with = "as_string")]
    pub ambient_light: u16,
    pub uv_index: FixedPoint,
    /// hPa, 1 decimal
    pub pressure: FixedPoint,
    pub sound_noise: FixedPoint,
    pub discomfort_index: FixedPoint,
    /// Celsius, 2 decimals
    pub heat_stroke: FixedPoint,
    /// mV as broadcast (single byte)
    #[serde(serialize_with = "as_string")]
    pub battery_voltage: u8,
}

/// Variant-specific sensor values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SensorData {
    Bu(BuReading),
    Bl(BlReading),
}

impl SensorData {
    /// Short hardware name, used in log lines.
    pub fn model(&self) -> &'static str {
        match self {
            SensorData::Bu(_) => "2JCIE-BU",
            SensorData::Bl(_) => "2JCIE-BL",
        }
    }
}

/// A decoded reading together with the moment it was captured.
///
/// Serializes to the flat document published over MQTT: `time` followed by
/// every field of the variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Capture time in seconds since the Unix epoch
    #[serde(rename = "time")]
    pub captured_at: u64,
    #[serde(flatten)]
    pub data: SensorData,
}

impl Reading {
    pub fn new(data: SensorData, captured_at: SystemTime) -> Self {
        let captured_at = captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self { captured_at, data }
    }
}
