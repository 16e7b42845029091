//! # Messages Module
//!
//! Wire-level message vocabulary of the station mesh.
//!
//! Every radio frame starts with a three byte header:
//!
//! ```text
//! [type:1][stationId:1][uniqueId:1][payload...]
//! ```
//!
//! The low seven bits of the type byte select the [`MessageType`]; the high bit
//! asks every station on the path to relay the frame regardless of its relay
//! lists. For commands the station id is the destination (0 addresses every
//! station), for everything else it is the originator.
//!
//! Weather payloads are a sequence of reading tuples, see [`weather`].

pub mod weather;

pub use weather::{WeatherTuple, WeatherTupleIterator};

/// Station id addressing every station
pub const GLOBAL_STATION_ID: u8 = 0;

/// Size of the `[type][stationId][uniqueId]` header
pub const HEADER_SIZE: usize = 3;

/// High bit of the type byte
pub const FORCED_RELAY_FLAG: u8 = 0x80;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Command = b'C',
    Acknowledge = b'A',
    Weather = b'W',
    RelayWrapper = b'R',
    Ping = b'P',
    Status = b'S',
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            b'C' => Some(MessageType::Command),
            b'A' => Some(MessageType::Acknowledge),
            b'W' => Some(MessageType::Weather),
            b'R' => Some(MessageType::RelayWrapper),
            b'P' => Some(MessageType::Ping),
            b'S' => Some(MessageType::Status),
            _ => None,
        }
    }

    /// Weather has its own relay list, every other type shares the message list
    pub fn uses_weather_relay_list(&self) -> bool {
        *self == MessageType::Weather
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderError {
    /// Frame shorter than the three byte header
    Truncated,
    /// Discriminant not in the message vocabulary
    UnknownType(u8),
}

#[cfg(feature = "std")]
impl core::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HeaderError::Truncated => write!(f, "frame shorter than message header"),
            HeaderError::UnknownType(value) => write!(f, "unknown message type 0x{:02X}", value),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for HeaderError {}

/// Decoded type byte: discriminant plus forced-relay flag
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypeByte {
    pub message_type: MessageType,
    pub forced_relay: bool,
}

impl TypeByte {
    pub const fn new(message_type: MessageType, forced_relay: bool) -> Self {
        TypeByte { message_type, forced_relay }
    }

    pub fn decode(value: u8) -> Result<Self, HeaderError> {
        let message_type = MessageType::from_u8(value & !FORCED_RELAY_FLAG).ok_or(HeaderError::UnknownType(value & !FORCED_RELAY_FLAG))?;
        Ok(TypeByte {
            message_type,
            forced_relay: value & FORCED_RELAY_FLAG != 0,
        })
    }

    pub fn encode(&self) -> u8 {
        let flag = if self.forced_relay { FORCED_RELAY_FLAG } else { 0 };
        self.message_type as u8 | flag
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub type_byte: TypeByte,
    pub station_id: u8,
    pub unique_id: u8,
}

impl MessageHeader {
    pub const fn new(message_type: MessageType, forced_relay: bool, station_id: u8, unique_id: u8) -> Self {
        MessageHeader {
            type_byte: TypeByte::new(message_type, forced_relay),
            station_id,
            unique_id,
        }
    }

    pub fn parse(frame: &[u8]) -> Result<Self, HeaderError> {
        if frame.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated);
        }
        Ok(MessageHeader {
            type_byte: TypeByte::decode(frame[0])?,
            station_id: frame[1],
            unique_id: frame[2],
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        [self.type_byte.encode(), self.station_id, self.unique_id]
    }

    pub fn message_type(&self) -> MessageType {
        self.type_byte.message_type
    }

    pub fn forced_relay(&self) -> bool {
        self.type_byte.forced_relay
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn relay_flag_is_independent_of_type() {
        for message_type in [
            MessageType::Command,
            MessageType::Acknowledge,
            MessageType::Weather,
            MessageType::RelayWrapper,
            MessageType::Ping,
            MessageType::Status,
        ] {
            for forced_relay in [false, true] {
                let byte = TypeByte::new(message_type, forced_relay).encode();
                assert_eq!(byte & 0x7F, message_type as u8);
                assert_eq!(TypeByte::decode(byte), Ok(TypeByte { message_type, forced_relay }));
            }
        }
    }

    #[test]
    fn forced_command_type_byte() {
        assert_eq!(TypeByte::decode(0xC3), Ok(TypeByte::new(MessageType::Command, true)));
    }

    #[test]
    fn unknown_discriminant_is_rejected() {
        assert_eq!(MessageHeader::parse(&[b'Z', 1, 2]), Err(HeaderError::UnknownType(b'Z')));
        assert_eq!(MessageHeader::parse(&[0x80 | b'x', 1, 2]), Err(HeaderError::UnknownType(b'x')));
    }

    #[test]
    fn short_frame_is_truncated() {
        assert_eq!(MessageHeader::parse(&[b'W', 1]), Err(HeaderError::Truncated));
    }

    #[test]
    fn header_parses_ids() {
        let header = MessageHeader::parse(&[b'S', 12, 200, 9, 9]).unwrap();
        assert_eq!(header.message_type(), MessageType::Status);
        assert!(!header.forced_relay());
        assert_eq!((header.station_id, header.unique_id), (12, 200));
        assert_eq!(header.encode(), [b'S', 12, 200]);
    }
}
