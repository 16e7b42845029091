//! Binary radio framing
//!
//! Radio frames need no escaping: the driver frames them at the physical layer.
//! A [`BinaryDestination`] collects up to [`RADIO_MAX_FRAME_SIZE`] bytes and
//! queues them in the [`RadioOutbox`] when finished (or dropped). A
//! [`BinarySource`] reads a frame straight out of the receive queue.

use super::{ByteCursor, MessageDestination, MessageSource, OutboundFrame, RadioOutbox, TransportError};
use crate::RADIO_MAX_FRAME_SIZE;
use crate::channel_access::Preamble;
use crate::messages::{HEADER_SIZE, HeaderError, MessageHeader};
use heapless::Vec;
use log::{Level, log};

pub struct BinaryDestination<'a> {
    outbox: &'a RadioOutbox,
    buffer: Vec<u8, RADIO_MAX_FRAME_SIZE>,
    preamble: Preamble,
    open: bool,
}

impl<'a> BinaryDestination<'a> {
    /// Empty frame; the caller appends the header itself
    pub fn new(outbox: &'a RadioOutbox, preamble: Preamble) -> Self {
        BinaryDestination {
            outbox,
            buffer: Vec::new(),
            preamble,
            open: true,
        }
    }

    /// Frame pre-filled with a message header
    pub fn with_header(outbox: &'a RadioOutbox, header: MessageHeader, preamble: Preamble) -> Self {
        let mut destination = Self::new(outbox, preamble);
        // Cannot fail: an empty frame always has room for the header
        let _ = destination.buffer.extend_from_slice(&header.encode());
        destination
    }

    pub fn preamble(&self) -> Preamble {
        self.preamble
    }

    /// Bytes appended so far, header included
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl MessageDestination for BinaryDestination<'_> {
    fn append(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotInMessage);
        }
        self.buffer.extend_from_slice(bytes).map_err(|_| TransportError::BufferOverrun)
    }

    fn finish_and_send(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotInMessage);
        }
        self.open = false;
        let frame = OutboundFrame {
            data: core::mem::take(&mut self.buffer),
            preamble: self.preamble,
        };
        log::trace!("Queueing radio frame of {} bytes", frame.data.len());
        self.outbox.push(frame)
    }

    fn abort(&mut self) {
        self.open = false;
        self.buffer.clear();
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn remaining_capacity(&self) -> usize {
        RADIO_MAX_FRAME_SIZE - self.buffer.len()
    }
}

impl Drop for BinaryDestination<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(error) = self.finish_and_send() {
                log!(Level::Warn, "Dropped unfinished radio frame: {:?}", error);
            }
        }
    }
}

/// Reader over one received radio frame
#[cfg_attr(feature = "std", derive(Debug))]
pub struct BinarySource<'a> {
    cursor: ByteCursor<'a>,
}

impl<'a> BinarySource<'a> {
    pub fn new(frame: &'a [u8]) -> Self {
        BinarySource { cursor: ByteCursor::new(frame) }
    }

    /// Parses the header without moving the read position
    pub fn header(&self) -> Result<MessageHeader, HeaderError> {
        MessageHeader::parse(self.cursor.data())
    }

    /// Positions the reader on the first payload byte and returns the header
    pub fn read_header(&mut self) -> Result<MessageHeader, HeaderError> {
        let header = self.header()?;
        let mut raw = [0u8; HEADER_SIZE];
        self.cursor.read_into(&mut raw).map_err(|_| HeaderError::Truncated)?;
        Ok(header)
    }

    /// The whole frame
    pub fn frame(&self) -> &'a [u8] {
        self.cursor.data()
    }
}

impl MessageSource for BinarySource<'_> {
    fn read_byte(&mut self) -> Result<u8, TransportError> {
        self.cursor.read_byte()
    }

    fn read_into(&mut self, out: &mut [u8]) -> Result<(), TransportError> {
        self.cursor.read_into(out)
    }

    fn position(&self) -> usize {
        self.cursor.position()
    }

    fn seek(&mut self, offset: usize) -> Result<(), TransportError> {
        self.cursor.seek(offset)
    }

    fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    fn access_bytes(&self, offset: usize, len: usize) -> Result<&[u8], TransportError> {
        self.cursor.access_bytes(offset, len)
    }

    fn message_len(&self) -> usize {
        self.cursor.message_len()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::messages::MessageType;

    #[test]
    fn frame_at_ceiling_is_sent() {
        let outbox = RadioOutbox::new();
        let mut destination = BinaryDestination::new(&outbox, Preamble::Long);
        destination.append(&[0xA5; RADIO_MAX_FRAME_SIZE]).unwrap();
        assert_eq!(destination.remaining_capacity(), 0);
        destination.finish_and_send().unwrap();
        assert_eq!(outbox.try_take().map(|frame| frame.data.len()), Some(RADIO_MAX_FRAME_SIZE));
    }

    #[test]
    fn one_byte_over_ceiling_overruns_and_can_abort() {
        let outbox = RadioOutbox::new();
        let mut destination = BinaryDestination::new(&outbox, Preamble::Long);
        destination.append(&[0xA5; RADIO_MAX_FRAME_SIZE]).unwrap();
        assert_eq!(destination.append_byte(0), Err(TransportError::BufferOverrun));
        assert!(destination.is_open());
        assert_eq!(destination.len(), RADIO_MAX_FRAME_SIZE);
        destination.abort();
        drop(destination);
        assert!(outbox.is_empty());
    }

    #[test]
    fn second_finish_is_not_in_message() {
        let outbox = RadioOutbox::new();
        let mut destination = BinaryDestination::with_header(&outbox, MessageHeader::new(MessageType::Ping, false, 4, 1), Preamble::Long);
        destination.finish_and_send().unwrap();
        assert_eq!(destination.finish_and_send(), Err(TransportError::NotInMessage));
        assert_eq!(destination.append_byte(1), Err(TransportError::NotInMessage));
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn dropped_destination_still_sends() {
        let outbox = RadioOutbox::new();
        {
            let mut destination = BinaryDestination::with_header(&outbox, MessageHeader::new(MessageType::Status, false, 9, 3), Preamble::Short);
            destination.append_value(0x0102u16).unwrap();
        }
        let frame = outbox.try_take().unwrap();
        assert_eq!(&frame.data[..], &[b'S', 9, 3, 0x02, 0x01]);
        assert_eq!(frame.preamble, Preamble::Short);
    }

    #[test]
    fn source_reads_header_then_payload() {
        let frame = [0x80 | b'C', 7, 42, b'N', 1, 2];
        let mut source = BinarySource::new(&frame);
        let header = source.read_header().unwrap();
        assert_eq!(header.message_type(), MessageType::Command);
        assert!(header.forced_relay());
        assert_eq!(source.read_byte(), Ok(b'N'));
        assert_eq!(source.remaining(), 2);
        assert_eq!(source.access_bytes(4, 2), Ok(&[1, 2][..]));
    }
}
