//! Queue of finished radio frames waiting for channel access

use super::TransportError;
use crate::channel_access::Preamble;
use crate::{OUTBOX_SIZE, RADIO_MAX_FRAME_SIZE};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TryReceiveError, TrySendError};
use heapless::Vec;

/// A radio frame with its transmit preamble class
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub data: Vec<u8, RADIO_MAX_FRAME_SIZE>,
    pub preamble: Preamble,
}

impl OutboundFrame {
    pub fn from_slice(data: &[u8], preamble: Preamble) -> Result<Self, TransportError> {
        Ok(OutboundFrame {
            data: Vec::from_slice(data).map_err(|_| TransportError::BufferOverrun)?,
            preamble,
        })
    }
}

/// Frames built by message destinations, drained by the channel access controller
///
/// Destinations only hold a shared reference, so a frame can be queued from a
/// `Drop` implementation while the controller is borrowed elsewhere.
pub struct RadioOutbox {
    channel: Channel<CriticalSectionRawMutex, OutboundFrame, OUTBOX_SIZE>,
}

impl Default for RadioOutbox {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioOutbox {
    pub const fn new() -> Self {
        RadioOutbox { channel: Channel::new() }
    }

    pub fn push(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        match self.channel.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) => {
                log::warn!("Radio outbox full, dropping frame of {} bytes", frame.data.len());
                Err(TransportError::OutboxFull)
            }
        }
    }

    pub fn try_take(&self) -> Option<OutboundFrame> {
        match self.channel.try_receive() {
            Ok(frame) => Some(frame),
            Err(TryReceiveError::Empty) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    pub fn free_capacity(&self) -> usize {
        self.channel.free_capacity()
    }

    pub fn clear(&self) {
        self.channel.clear();
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn frames_leave_in_order() {
        let outbox = RadioOutbox::new();
        outbox.push(OutboundFrame::from_slice(&[1], Preamble::Long).unwrap()).unwrap();
        outbox.push(OutboundFrame::from_slice(&[2], Preamble::Short).unwrap()).unwrap();
        assert_eq!(outbox.try_take().map(|frame| frame.data[0]), Some(1));
        assert_eq!(outbox.try_take().map(|frame| frame.preamble), Some(Preamble::Short));
        assert!(outbox.try_take().is_none());
    }

    #[test]
    fn full_outbox_rejects() {
        let outbox = RadioOutbox::new();
        for _ in 0..OUTBOX_SIZE {
            outbox.push(OutboundFrame::from_slice(&[0], Preamble::Long).unwrap()).unwrap();
        }
        assert_eq!(outbox.free_capacity(), 0);
        let result = outbox.push(OutboundFrame::from_slice(&[0], Preamble::Long).unwrap());
        assert_eq!(result, Err(TransportError::OutboxFull));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let data = [0u8; RADIO_MAX_FRAME_SIZE + 1];
        assert_eq!(OutboundFrame::from_slice(&data, Preamble::Long), Err(TransportError::BufferOverrun));
    }
}
