//! # Message Transport
//!
//! One read/append contract over two framing disciplines so that relay and
//! command logic never care where a message came from or where it goes:
//!
//! - [`binary`]: radio frames. Raw bytes behind a `[type][station][unique]`
//!   header, no escaping; finished frames go to the [`RadioOutbox`] and from there
//!   through the channel access controller.
//! - [`kiss`]: byte-stream frames for the serial host bridge, delimited by
//!   `FEND` with two-byte escapes, read with a per-byte timeout.
//!
//! A [`MessageDestination`] is an append-only builder finished exactly once. A
//! destination dropped while still open sends what it holds; `abort` is the only
//! way to discard it. A [`MessageSource`] reads one received message front to back
//! and can seek back to any offset it already visited.

pub mod binary;
pub mod kiss;
pub mod outbox;

pub use binary::{BinaryDestination, BinarySource};
pub use kiss::{ByteSink, ByteSource, KissDecoder, KissDestination, KissFrameKind, KissReader, KissSource};
pub use outbox::{OutboundFrame, RadioOutbox};

/// Transport operation errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// End of the message reached
    End,
    /// The byte stream went quiet in the middle of a frame
    Timeout,
    /// The destination is already finished or aborted
    NotInMessage,
    /// The append does not fit, or a seek targets an offset not yet visited
    BufferOverrun,
    /// Malformed escape sequence in a KISS frame
    Framing,
    /// No room left in the radio outbox
    OutboxFull,
}

#[cfg(feature = "std")]
impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TransportError::End => write!(f, "end of message"),
            TransportError::Timeout => write!(f, "byte stream timed out"),
            TransportError::NotInMessage => write!(f, "no message in progress"),
            TransportError::BufferOverrun => write!(f, "message buffer overrun"),
            TransportError::Framing => write!(f, "malformed frame escape"),
            TransportError::OutboxFull => write!(f, "radio outbox is full"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TransportError {}

/// Largest value [`WireValue`] supports
const MAX_WIRE_VALUE_SIZE: usize = 8;

/// Fixed-size value with a little-endian wire form
pub trait WireValue: Sized {
    const SIZE: usize;
    fn write_le(&self, out: &mut [u8]);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_wire_value {
    ($($ty:ty),*) => {
        $(
            impl WireValue for $ty {
                const SIZE: usize = core::mem::size_of::<$ty>();

                fn write_le(&self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; core::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_wire_value!(u8, i8, u16, i16, u32, i32, u64, i64);

/// Append-only outbound message builder
pub trait MessageDestination {
    /// Appends all of `bytes` or nothing
    fn append(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    fn append_byte(&mut self, byte: u8) -> Result<(), TransportError> {
        self.append(&[byte])
    }

    fn append_value<T: WireValue>(&mut self, value: T) -> Result<(), TransportError>
    where
        Self: Sized,
    {
        let mut raw = [0u8; MAX_WIRE_VALUE_SIZE];
        value.write_le(&mut raw);
        self.append(&raw[..T::SIZE])
    }

    /// Frames and sends the message. A second call returns `NotInMessage`.
    fn finish_and_send(&mut self) -> Result<(), TransportError>;

    /// Discards the message without sending anything
    fn abort(&mut self);

    /// Bytes appended so far
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_open(&self) -> bool;

    /// Bytes that can still be appended
    fn remaining_capacity(&self) -> usize;
}

/// Sequential reader over one received message
pub trait MessageSource {
    /// Next byte, `End` once the message is exhausted
    fn read_byte(&mut self) -> Result<u8, TransportError>;

    /// Fills `out` completely or consumes nothing and returns `End`
    fn read_into(&mut self, out: &mut [u8]) -> Result<(), TransportError>;

    fn read_value<T: WireValue>(&mut self) -> Result<T, TransportError>
    where
        Self: Sized,
    {
        let mut raw = [0u8; MAX_WIRE_VALUE_SIZE];
        self.read_into(&mut raw[..T::SIZE])?;
        Ok(T::read_le(&raw))
    }

    fn position(&self) -> usize;

    /// Moves the read position to an offset at or before the furthest one read
    fn seek(&mut self, offset: usize) -> Result<(), TransportError>;

    fn remaining(&self) -> usize;

    /// Borrowed view of `len` bytes at `offset` without moving the read position
    fn access_bytes(&self, offset: usize, len: usize) -> Result<&[u8], TransportError>;

    /// Length of the whole message
    fn message_len(&self) -> usize;
}

/// Read cursor shared by the source implementations
#[cfg_attr(feature = "std", derive(Debug))]
pub(crate) struct ByteCursor<'a> {
    data: &'a [u8],
    position: usize,
    high_water: usize,
}

impl<'a> ByteCursor<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        ByteCursor {
            data,
            position: 0,
            high_water: 0,
        }
    }

    pub(crate) fn data(&self) -> &'a [u8] {
        self.data
    }

    fn advance(&mut self, count: usize) {
        self.position += count;
        self.high_water = self.high_water.max(self.position);
    }
}

impl MessageSource for ByteCursor<'_> {
    fn read_byte(&mut self) -> Result<u8, TransportError> {
        let byte = *self.data.get(self.position).ok_or(TransportError::End)?;
        self.advance(1);
        Ok(byte)
    }

    fn read_into(&mut self, out: &mut [u8]) -> Result<(), TransportError> {
        let end = self.position + out.len();
        let bytes = self.data.get(self.position..end).ok_or(TransportError::End)?;
        out.copy_from_slice(bytes);
        self.advance(out.len());
        Ok(())
    }

    fn position(&self) -> usize {
        self.position
    }

    fn seek(&mut self, offset: usize) -> Result<(), TransportError> {
        if offset > self.high_water {
            return Err(TransportError::BufferOverrun);
        }
        self.position = offset;
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn access_bytes(&self, offset: usize, len: usize) -> Result<&[u8], TransportError> {
        self.data.get(offset..offset + len).ok_or(TransportError::BufferOverrun)
    }

    fn message_len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn values_read_little_endian() {
        let data = [0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0xFF];
        let mut cursor = ByteCursor::new(&data);
        assert_eq!(cursor.read_value::<u16>(), Ok(0x1234));
        assert_eq!(cursor.read_value::<u32>(), Ok(0x1234_5678));
        assert_eq!(cursor.read_value::<i8>(), Ok(-1));
        assert_eq!(cursor.read_byte(), Err(TransportError::End));
    }

    #[test]
    fn short_read_consumes_nothing() {
        let data = [1, 2, 3];
        let mut cursor = ByteCursor::new(&data);
        cursor.read_byte().unwrap();
        let mut out = [0u8; 4];
        assert_eq!(cursor.read_into(&mut out), Err(TransportError::End));
        assert_eq!(cursor.position(), 1);
        assert_eq!(cursor.remaining(), 2);
    }

    #[test]
    fn seek_only_to_visited_offsets() {
        let data = [1, 2, 3, 4, 5];
        let mut cursor = ByteCursor::new(&data);
        let mut out = [0u8; 3];
        cursor.read_into(&mut out).unwrap();
        assert_eq!(cursor.seek(4), Err(TransportError::BufferOverrun));
        cursor.seek(1).unwrap();
        assert_eq!(cursor.read_byte(), Ok(2));
        // the furthest read position stays reachable after seeking back
        cursor.seek(3).unwrap();
        assert_eq!(cursor.read_byte(), Ok(4));
    }

    #[test]
    fn access_bytes_does_not_move_position() {
        let data = [9, 8, 7, 6];
        let cursor = ByteCursor::new(&data);
        assert_eq!(cursor.access_bytes(1, 2), Ok(&[8, 7][..]));
        assert_eq!(cursor.access_bytes(3, 2), Err(TransportError::BufferOverrun));
        assert_eq!(cursor.position(), 0);
    }
}
