//! Payload decoding for OMRON 2JCIE environment sensors.
//!
//! Both sensor generations broadcast manufacturer data tagged with the OMRON
//! company identifier (`0x02D5`, little-endian on air). A second marker
//! distinguishes the layouts: the BL broadcasts the ASCII bytes `EP`, the BU
//! broadcasts `Rbt`. Field positions are fixed and counted from the first byte
//! of the HCI event frame.

use crate::reading::{BlReading, BuReading, FixedPoint, Reading, SensorData};
use std::time::SystemTime;
use thiserror::Error;

/// OMRON company identifier as it appears in the frame.
pub const MANUFACTURER_MARKER: [u8; 2] = [0xD5, 0x02];

/// Sub-marker present in 2JCIE-BL frames.
pub const BL_MARKER: &[u8] = b"EP";

/// Sub-marker present in 2JCIE-BU frames.
pub const BU_MARKER: &[u8] = b"Rbt";

/// Highest frame offset read by the BU layout.
const BU_DEEPEST_OFFSET: usize = 38;

/// Highest frame offset read by the BL layout.
const BL_DEEPEST_OFFSET: usize = 40;

/// Reasons a frame does not produce a reading.
///
/// None of these are faults: nearby advertisers produce a steady stream of
/// frames that are not ours.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("not a sensor frame: manufacturer marker missing")]
    NotSensorFrame,
    #[error("unknown sensor variant: neither 'EP' nor 'Rbt' present")]
    UnknownVariant,
    #[error("truncated frame: need {needed} bytes, got {len}")]
    Truncated { needed: usize, len: usize },
}

/// Sensor hardware generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Bu,
    Bl,
}

impl Variant {
    fn deepest_offset(self) -> usize {
        match self {
            Variant::Bu => BU_DEEPEST_OFFSET,
            Variant::Bl => BL_DEEPEST_OFFSET,
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Decide which layout a frame uses, without reading any field.
///
/// `EP` is checked before `Rbt`, so a frame carrying both is treated as BL.
pub fn classify(frame: &[u8]) -> Result<Variant, DecodeError> {
    if !contains(frame, &MANUFACTURER_MARKER) {
        return Err(DecodeError::NotSensorFrame);
    }
    if contains(frame, BL_MARKER) {
        Ok(Variant::Bl)
    } else if contains(frame, BU_MARKER) {
        Ok(Variant::Bu)
    } else {
        Err(DecodeError::UnknownVariant)
    }
}

/// Decode a frame into a reading stamped with `captured_at`.
pub fn decode(frame: &[u8], captured_at: SystemTime) -> Result<Reading, DecodeError> {
    let variant = classify(frame)?;

    let needed = variant.deepest_offset() + 1;
    if frame.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            len: frame.len(),
        });
    }

    let fields = Fields(frame);
    let data = match variant {
        Variant::Bu => SensorData::Bu(fields.bu()),
        Variant::Bl => SensorData::Bl(fields.bl()),
    };

    Ok(Reading::new(data, captured_at))
}

/// Field accessors over a frame already checked to be long enough.
struct Fields<'a>(&'a [u8]);

impl Fields<'_> {
    fn u8_at(&self, offset: usize) -> u8 {
        self.0[offset]
    }

    /// Little-endian pair starting at `lo`.
    fn u16_at(&self, lo: usize) -> u16 {
        u16::from_le_bytes([self.0[lo], self.0[lo + 1]])
    }

    fn u32_at(&self, lo: usize) -> u32 {
        u32::from_le_bytes([self.0[lo], self.0[lo + 1], self.0[lo + 2], self.0[lo + 3]])
    }

    fn scaled(&self, lo: usize, scale: u8) -> FixedPoint {
        FixedPoint::new(u32::from(self.u16_at(lo)), scale)
    }

    fn company_id(&self) -> String {
        format!("{:x}{:02x}", self.0[19], self.0[20])
    }

    fn bu(&self) -> BuReading {
        BuReading {
            company_id: self.company_id(),
            temperature: self.scaled(23, 2),
            relative_humidity: self.scaled(25, 2),
            ambient_light: self.u16_at(27),
            barometric_pressure: FixedPoint::new(self.u32_at(29), 3),
            sound_noise: self.scaled(33, 2),
            etvoc: self.u16_at(35),
            eco2: self.u16_at(37),
        }
    }

    fn bl(&self) -> BlReading {
        BlReading {
            company_id: self.company_id(),
            sequence_number: self.u8_at(21),
            temperature: self.scaled(22, 2),
            relative_humidity: self.scaled(24, 2),
            ambient_light: self.u16_at(26),
            uv_index: self.scaled(28, 2),
            pressure: self.scaled(30, 1),
            sound_noise: self.scaled(32, 2),
            discomfort_index: self.scaled(34, 2),
            heat_stroke: self.scaled(36, 2),
            battery_voltage: self.u8_at(40),
        }
    }
}
