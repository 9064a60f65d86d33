//! Bluetooth device address type.
//!
//! Addresses are stored as six bytes in display order (most significant
//! first). Over the air, and inside HCI frames, the same six bytes travel in
//! reverse order; [`MacAddress::from_le_slice`] undoes that.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A Bluetooth MAC address stored as a compact 6-byte array.
///
/// Comparison happens on the bytes, so two addresses parsed from strings that
/// differ only in letter case are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Build an address from six bytes in over-the-air (little-endian) order.
    ///
    /// Returns `None` if `bytes` is not exactly six bytes long.
    pub fn from_le_slice(bytes: &[u8]) -> Option<Self> {
        let mut addr: [u8; 6] = bytes.try_into().ok()?;
        addr.reverse();
        Some(Self(addr))
    }

    /// The address as a single MQTT topic level: `aa_bb_cc_dd_ee_ff`.
    pub fn topic_segment(&self) -> String {
        topic_segment(&self.to_string())
    }
}

/// Replace every `:` with `_`.
///
/// Applying it to a string without colons returns the string unchanged.
pub fn topic_segment(address: &str) -> String {
    address.replace(':', "_")
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Why an address string was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseMacError {
    #[error("expected 6 colon-separated octets, got {0}")]
    OctetCount(usize),
    #[error("octet {index} ('{octet}') is not two hex digits")]
    BadOctet { index: usize, octet: String },
}

fn parse_octet(index: usize, octet: &str) -> Result<u8, ParseMacError> {
    let bad = || ParseMacError::BadOctet {
        index,
        octet: octet.to_string(),
    };
    if octet.len() != 2 || !octet.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(bad());
    }
    u8::from_str_radix(octet, 16).map_err(|_| bad())
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    /// Accepts `aa:bb:cc:dd:ee:ff` in any letter case, with surrounding
    /// whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let count = s.split(':').count();
        if count != 6 {
            return Err(ParseMacError::OctetCount(count));
        }

        let mut bytes = [0u8; 6];
        for (index, (slot, octet)) in bytes.iter_mut().zip(s.split(':')).enumerate() {
            *slot = parse_octet(index, octet)?;
        }
        Ok(Self(bytes))
    }
}
