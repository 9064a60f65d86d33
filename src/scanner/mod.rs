//! Radio access for the advertisement pipeline.
//!
//! The [`Radio`] trait is the contract the session supervisor drives: one
//! adapter, reset and configured once, read by a single reader task. The Linux
//! raw HCI implementation lives in [`hci`].

pub mod hci;

use crate::mac_address::MacAddress;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Offset of the first advertiser address byte in an LE advertising report.
const ADDRESS_OFFSET: usize = 7;

/// Length of the common HCI event header (packet type, event code, length).
const HEADER_LEN: usize = 3;

/// Channel buffer size for frames handed from the reader to the supervisor.
pub const FRAME_CHANNEL_BUFFER_SIZE: usize = 100;

/// Error type for radio operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bringing the adapter down and up again failed
    #[error("failed to reset hci{dev_id}: {source}")]
    Reset {
        dev_id: u16,
        #[source]
        source: std::io::Error,
    },
    /// The adapter could not be opened
    #[error("failed to open hci{dev_id}: {source}")]
    Open {
        dev_id: u16,
        #[source]
        source: std::io::Error,
    },
    /// Reading or writing the socket event filter failed
    #[error("failed to update HCI event filter: {0}")]
    Filter(#[source] std::io::Error),
    /// An HCI command could not be sent
    #[error("failed to send HCI command {name}: {source}")]
    Command {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    /// The socket failed while waiting for events
    #[error("failed to read HCI event: {0}")]
    Read(#[source] std::io::Error),
    /// A radio operation was attempted before `open`
    #[error("adapter is not open")]
    NotOpen,
}

/// One HCI event frame as read from the socket.
///
/// `data` holds the whole frame, header included; every offset used
/// downstream (source address, sensor fields) counts from its first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAdvertisement {
    pub packet_type: u8,
    pub event_code: u8,
    pub length: u8,
    pub data: Vec<u8>,
}

impl RawAdvertisement {
    /// Parse a frame, returning `None` if it is too short to carry an
    /// advertiser address.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < ADDRESS_OFFSET + 6 {
            return None;
        }
        Some(Self {
            packet_type: frame[0],
            event_code: frame[1],
            length: frame[2],
            data: frame.to_vec(),
        })
    }

    /// Everything after the 3-byte header.
    pub fn body(&self) -> &[u8] {
        &self.data[HEADER_LEN..]
    }

    /// Advertiser address from frame bytes 7..=12, reversed into display order.
    pub fn source_address(&self) -> Option<MacAddress> {
        MacAddress::from_le_slice(self.data.get(ADDRESS_OFFSET..ADDRESS_OFFSET + 6)?)
    }
}

/// What the reader task hands to the supervisor.
pub type FrameResult = Result<RawAdvertisement, ScanError>;

/// The single physical radio.
///
/// The supervisor calls these in a fixed order (`reset`, `open`,
/// `install_event_filter`, `set_scan_parameters`, `enable_scan`) and releases
/// in reverse (`disable_scan`, `restore_event_filter`). No other component
/// touches the radio.
pub trait Radio: Send {
    /// Adapter index this radio drives.
    fn dev_id(&self) -> u16;

    /// Force the adapter link down and up again.
    fn reset(&mut self) -> Result<(), ScanError>;

    /// Open the adapter for raw HCI access.
    fn open(&mut self) -> Result<(), ScanError>;

    /// Restrict the socket to HCI event packets, remembering the previous
    /// filter.
    fn install_event_filter(&mut self) -> Result<(), ScanError>;

    /// Put back the filter captured by `install_event_filter`.
    fn restore_event_filter(&mut self) -> Result<(), ScanError>;

    /// Active scan, full duty cycle, public own address, accept all.
    fn set_scan_parameters(&mut self) -> Result<(), ScanError>;

    fn enable_scan(&mut self) -> Result<(), ScanError>;

    fn disable_scan(&mut self) -> Result<(), ScanError>;

    /// Start the advertisement reader.
    ///
    /// Frames arrive on the returned channel in socket order. The reader stops
    /// when `cancel` fires, when the receiver is dropped, or after sending a
    /// read error.
    fn start_reader(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<FrameResult>, ScanError>;
}
