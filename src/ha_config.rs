//! Home Assistant MQTT sensor definitions for watched devices.

use crate::mac_address::MacAddress;
use crate::publisher::topic_for;
use std::fmt;

/// One published field exposed as a Home Assistant sensor.
struct SensorField {
    name: &'static str,
    /// Suffix of the sensor's `unique_id`
    id: &'static str,
    /// Key in the published JSON document
    key: &'static str,
    unit: &'static str,
    device_class: Option<&'static str>,
}

const SENSOR_FIELDS: &[SensorField] = &[
    SensorField {
        name: "Temperature",
        id: "temperature",
        key: "temperature",
        unit: "°C",
        device_class: Some("temperature"),
    },
    SensorField {
        name: "Humidity",
        id: "humidity",
        key: "relative_humidity",
        unit: "%",
        device_class: Some("humidity"),
    },
    SensorField {
        name: "Ambient Light",
        id: "ambient_light",
        key: "ambient_light",
        unit: "lx",
        device_class: Some("illuminance"),
    },
    SensorField {
        name: "UV Index",
        id: "uv_index",
        key: "uv_index",
        unit: "UV Index",
        device_class: None,
    },
    SensorField {
        name: "Barometric Pressure",
        id: "barometric_pressure",
        key: "pressure",
        unit: "hPa",
        device_class: Some("pressure"),
    },
    SensorField {
        name: "Sound Noise",
        id: "sound_noise",
        key: "sound_noise",
        unit: "dB",
        device_class: None,
    },
    SensorField {
        name: "Discomfort Index",
        id: "discomfort_index",
        key: "discomfort_index",
        unit: "DI",
        device_class: None,
    },
    SensorField {
        name: "Heat Stroke",
        id: "heat_stroke",
        key: "heat_stroke",
        unit: "°C",
        device_class: None,
    },
    SensorField {
        name: "Battery Voltage",
        id: "battery_voltage",
        key: "battery_voltage",
        unit: "mV",
        device_class: Some("battery"),
    },
];

/// Render a `sensor:` block per address, reading from the topics the bridge
/// publishes to under `base_topic`.
pub fn render<'a>(addresses: impl IntoIterator<Item = &'a MacAddress>, base_topic: &str) -> String {
    addresses
        .into_iter()
        .map(|address| DeviceSensors { address, base_topic }.to_string())
        .collect()
}

/// The sensor definitions of one device.
struct DeviceSensors<'a> {
    address: &'a MacAddress,
    base_topic: &'a str,
}

fn fmt_field(
    field: &SensorField,
    address: &MacAddress,
    state_topic: &str,
    fmt: &mut fmt::Formatter,
) -> fmt::Result {
    writeln!(fmt, "  - name: \"{} {}\"", field.name, address)?;
    writeln!(
        fmt,
        "    unique_id: \"ble_sensor_{}_{}\"",
        field.id,
        address.topic_segment()
    )?;
    writeln!(fmt, "    state_topic: \"{}\"", state_topic)?;
    writeln!(fmt, "    unit_of_measurement: \"{}\"", field.unit)?;
    writeln!(fmt, "    value_template: \"{{{{ value_json.{} }}}}\"", field.key)?;
    writeln!(fmt, "    state_class: measurement")?;
    if let Some(class) = field.device_class {
        writeln!(fmt, "    device_class: {}", class)?;
    }
    writeln!(fmt)
}

impl fmt::Display for DeviceSensors<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let state_topic = topic_for(self.base_topic, self.address);
        writeln!(fmt, "sensor:")?;
        for field in SENSOR_FIELDS {
            fmt_field(field, self.address, &state_topic, fmt)?;
        }
        Ok(())
    }
}
