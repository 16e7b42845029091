//! KISS byte-stream framing for the serial host bridge
//!
//! ```text
//! [FEND][kind][escaped payload][FEND]
//! ```
//!
//! Inside the payload `FEND` becomes `FESC TFEND` and `FESC` becomes
//! `FESC TFESC`. The kind byte is [`KissFrameKind::Data`] for a radio frame the
//! modem should transmit and [`KissFrameKind::LocalCommand`] for a command aimed at
//! the modem itself.

use super::{ByteCursor, MessageDestination, MessageSource, TransportError};
use crate::KISS_MAX_PAYLOAD;
use embassy_futures::select::{Either, select};
use embassy_time::{Duration, Timer};
use heapless::Vec;
use log::{Level, log};

pub const FEND: u8 = 0xC0;
pub const FESC: u8 = 0xDB;
pub const TFEND: u8 = 0xDC;
pub const TFESC: u8 = 0xDD;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum KissFrameKind {
    /// Radio frame to or from the air
    Data = 0x00,
    /// Command for the bridging modem and its reply
    LocalCommand = 0x06,
}

impl KissFrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(KissFrameKind::Data),
            0x06 => Some(KissFrameKind::LocalCommand),
            _ => None,
        }
    }
}

/// Blocking byte output (serial port)
pub trait ByteSink {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

impl<const N: usize> ByteSink for Vec<u8, N> {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.extend_from_slice(bytes).map_err(|_| TransportError::BufferOverrun)
    }
}

#[cfg(feature = "std")]
impl ByteSink for std::vec::Vec<u8> {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Asynchronous byte input (serial port); waits until a byte arrives
pub trait ByteSource {
    async fn read_byte(&mut self) -> u8;
}

/// Replays a fixed byte sequence, then goes quiet
pub struct SliceByteSource<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> SliceByteSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        SliceByteSource { bytes, position: 0 }
    }
}

impl ByteSource for SliceByteSource<'_> {
    async fn read_byte(&mut self) -> u8 {
        match self.bytes.get(self.position) {
            Some(byte) => {
                self.position += 1;
                *byte
            }
            None => core::future::pending().await,
        }
    }
}

/// Writes one complete escaped frame to `sink`
pub fn encode_frame(sink: &mut dyn ByteSink, kind: KissFrameKind, payload: &[u8]) -> Result<(), TransportError> {
    sink.write_bytes(&[FEND, kind as u8])?;
    let mut run_start = 0;
    for (index, byte) in payload.iter().enumerate() {
        let escaped = match *byte {
            FEND => [FESC, TFEND],
            FESC => [FESC, TFESC],
            _ => continue,
        };
        sink.write_bytes(&payload[run_start..index])?;
        sink.write_bytes(&escaped)?;
        run_start = index + 1;
    }
    sink.write_bytes(&payload[run_start..])?;
    sink.write_bytes(&[FEND])
}

/// Outbound KISS message
///
/// The payload is buffered unescaped so the message can still be aborted; the
/// escaped frame is written to the sink in one go when finished or dropped.
pub struct KissDestination<'a> {
    sink: &'a mut dyn ByteSink,
    kind: KissFrameKind,
    buffer: Vec<u8, KISS_MAX_PAYLOAD>,
    open: bool,
}

impl<'a> KissDestination<'a> {
    pub fn new(sink: &'a mut dyn ByteSink, kind: KissFrameKind) -> Self {
        KissDestination {
            sink,
            kind,
            buffer: Vec::new(),
            open: true,
        }
    }
}

impl MessageDestination for KissDestination<'_> {
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
        let result = encode_frame(&mut *self.sink, self.kind, &self.buffer);
        self.buffer.clear();
        result
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
        KISS_MAX_PAYLOAD - self.buffer.len()
    }
}

impl Drop for KissDestination<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(error) = self.finish_and_send() {
                log!(Level::Warn, "Dropped unfinished host frame: {:?}", error);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecoderState {
    WaitStart,
    Kind,
    SkipStationId(usize),
    Data,
    Escape,
}

/// Incremental KISS unescaper
///
/// Fed one byte at a time; reports the frame kind when a closing `FEND`
/// completes a frame. The decoded payload is then available from `frame` until
/// the next frame starts.
pub struct KissDecoder<const N: usize> {
    state: DecoderState,
    kind: u8,
    station_id_length: usize,
    buffer: Vec<u8, N>,
}

impl<const N: usize> KissDecoder<N> {
    /// `station_id_length` bytes after the kind byte are discarded
    pub const fn new(station_id_length: usize) -> Self {
        KissDecoder {
            state: DecoderState::WaitStart,
            kind: 0,
            station_id_length,
            buffer: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state = DecoderState::WaitStart;
        self.buffer.clear();
    }

    pub fn frame(&self) -> &[u8] {
        &self.buffer
    }

    pub fn push(&mut self, byte: u8) -> Result<Option<u8>, TransportError> {
        match self.state {
            DecoderState::WaitStart => {
                if byte == FEND {
                    self.state = DecoderState::Kind;
                }
            }
            DecoderState::Kind => {
                // Repeated FENDs between frames are fill
                if byte != FEND {
                    self.kind = byte;
                    self.buffer.clear();
                    self.state = match self.station_id_length {
                        0 => DecoderState::Data,
                        length => DecoderState::SkipStationId(length),
                    };
                }
            }
            DecoderState::SkipStationId(remaining) => {
                self.state = if byte == FEND {
                    DecoderState::Kind
                } else if remaining > 1 {
                    DecoderState::SkipStationId(remaining - 1)
                } else {
                    DecoderState::Data
                };
            }
            DecoderState::Data => match byte {
                FEND => {
                    // The closing FEND may also open the next frame
                    self.state = DecoderState::Kind;
                    return Ok(Some(self.kind));
                }
                FESC => self.state = DecoderState::Escape,
                _ => self.store(byte)?,
            },
            DecoderState::Escape => {
                let unescaped = match byte {
                    TFEND => FEND,
                    TFESC => FESC,
                    _ => {
                        self.reset();
                        return Err(TransportError::Framing);
                    }
                };
                self.state = DecoderState::Data;
                self.store(unescaped)?;
            }
        }
        Ok(None)
    }

    fn store(&mut self, byte: u8) -> Result<(), TransportError> {
        if self.buffer.push(byte).is_err() {
            self.reset();
            return Err(TransportError::BufferOverrun);
        }
        Ok(())
    }
}

/// Reads whole KISS frames from a byte stream with a per-byte timeout
pub struct KissReader<S: ByteSource> {
    source: S,
    decoder: KissDecoder<KISS_MAX_PAYLOAD>,
    byte_timeout: Duration,
}

impl<S: ByteSource> KissReader<S> {
    pub fn new(source: S, byte_timeout: Duration, station_id_length: usize) -> Self {
        KissReader {
            source,
            decoder: KissDecoder::new(station_id_length),
            byte_timeout,
        }
    }

    /// Waits for the next complete frame
    ///
    /// A quiet line longer than the byte timeout abandons any partial frame and
    /// returns `Timeout`; a malformed escape returns `Framing`.
    pub async fn read_frame(&mut self) -> Result<KissSource<'_>, TransportError> {
        loop {
            let byte = match select(self.source.read_byte(), Timer::after(self.byte_timeout)).await {
                Either::First(byte) => byte,
                Either::Second(()) => {
                    self.decoder.reset();
                    return Err(TransportError::Timeout);
                }
            };
            match self.decoder.push(byte) {
                Ok(Some(kind)) => return Ok(KissSource::new(kind, self.decoder.frame())),
                Ok(None) => {}
                Err(error) => {
                    log!(Level::Debug, "Abandoning host frame: {:?}", error);
                    return Err(error);
                }
            }
        }
    }
}

/// Reader over one decoded KISS frame
#[cfg_attr(feature = "std", derive(Debug))]
pub struct KissSource<'a> {
    kind: u8,
    cursor: ByteCursor<'a>,
}

impl<'a> KissSource<'a> {
    pub fn new(kind: u8, payload: &'a [u8]) -> Self {
        KissSource {
            kind,
            cursor: ByteCursor::new(payload),
        }
    }

    pub fn kind(&self) -> Option<KissFrameKind> {
        KissFrameKind::from_u8(self.kind)
    }

    pub fn raw_kind(&self) -> u8 {
        self.kind
    }

    pub fn payload(&self) -> &'a [u8] {
        self.cursor.data()
    }
}

impl MessageSource for KissSource<'_> {
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
