//! Fan-out of frames from the shared reader to per-device pipelines.

use crate::mac_address::MacAddress;
use crate::scanner::RawAdvertisement;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

/// Channel buffer size for each watched device.
pub const PIPELINE_CHANNEL_BUFFER_SIZE: usize = 32;

/// Outcome of routing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to the pipeline of a watched device
    Routed,
    /// Source address is not watched, or the frame carries no address
    Unwatched,
    /// Watched, but the pipeline could not take it
    Dropped,
}

/// Routes frames to the pipeline registered for their source address.
///
/// Each watched address owns one bounded channel with a single consumer, so
/// frames for one device stay in arrival order.
#[derive(Debug, Default)]
pub struct Dispatcher {
    routes: HashMap<MacAddress, mpsc::Sender<RawAdvertisement>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `address`, returning the receiving end of its pipeline.
    ///
    /// Registering the same address again replaces the earlier route.
    pub fn register(&mut self, address: MacAddress) -> mpsc::Receiver<RawAdvertisement> {
        let (tx, rx) = mpsc::channel(PIPELINE_CHANNEL_BUFFER_SIZE);
        self.routes.insert(address, tx);
        rx
    }

    /// Route `frame` by its source address.
    ///
    /// Never waits: a full pipeline loses the frame rather than stalling the
    /// reader and every other device.
    pub fn dispatch(&self, frame: RawAdvertisement) -> Dispatch {
        let Some(address) = frame.source_address() else {
            return Dispatch::Unwatched;
        };
        let Some(route) = self.routes.get(&address) else {
            trace!(%address, "ignoring advertisement from unwatched device");
            return Dispatch::Unwatched;
        };

        match route.try_send(frame) {
            Ok(()) => Dispatch::Routed,
            Err(TrySendError::Full(_)) => {
                warn!("Pipeline for {} is full, dropping advertisement", address);
                Dispatch::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Pipeline for {} has stopped, dropping advertisement", address);
                Dispatch::Dropped
            }
        }
    }
}
