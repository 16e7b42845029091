//! # Station Configuration
//!
//! Persistent station settings are reached through [`ConfigurationStore`]: get or
//! set one [`ConfigField`] at a time. Every set recomputes a CRC-16-CCITT over the
//! whole image so a torn EEPROM write is detected at the next boot.
//!
//! [`MemoryConfigStore`] keeps the image in RAM. It is what the tests and the demo
//! use, and what an EEPROM backend mirrors.
//!
//! ## Image layout
//!
//! | Offset | Size | Field                  |
//! |--------|------|------------------------|
//! | 0      | 1    | station id             |
//! | 1      | 1    | flags                  |
//! | 2      | 1    | CSMA persistence       |
//! | 3      | 1    | CSMA slot time (ms)    |
//! | 4      | 2    | short preamble         |
//! | 6      | 2    | long preamble          |
//! | 8      | 2    | weather interval (s)   |
//! | 10     | 1    | complex weather every  |
//! | 11     | 8    | message relay list     |
//! | 19     | 8    | weather relay list     |
//! | 27     | 2    | checksum               |
//!
//! Multi-byte fields are little-endian.

use crate::RELAY_LIST_SIZE;
use crate::channel_access::ChannelAccessConfig;
use crate::messages::{GLOBAL_STATION_ID, MessageType};
use embassy_time::Duration;

/// Bytes covered by the checksum
pub const CONFIG_DATA_SIZE: usize = 27;
pub const CONFIG_IMAGE_SIZE: usize = CONFIG_DATA_SIZE + 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfigField {
    StationId = 0x01,
    Flags = 0x02,
    CsmaPersistence = 0x03,
    CsmaSlotTime = 0x04,
    ShortPreamble = 0x05,
    LongPreamble = 0x06,
    WeatherInterval = 0x07,
    ComplexWeatherEvery = 0x08,
    MessageRelayList = 0x09,
    WeatherRelayList = 0x0A,
}

impl ConfigField {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ConfigField::StationId),
            0x02 => Some(ConfigField::Flags),
            0x03 => Some(ConfigField::CsmaPersistence),
            0x04 => Some(ConfigField::CsmaSlotTime),
            0x05 => Some(ConfigField::ShortPreamble),
            0x06 => Some(ConfigField::LongPreamble),
            0x07 => Some(ConfigField::WeatherInterval),
            0x08 => Some(ConfigField::ComplexWeatherEvery),
            0x09 => Some(ConfigField::MessageRelayList),
            0x0A => Some(ConfigField::WeatherRelayList),
            _ => None,
        }
    }

    pub const fn offset(&self) -> usize {
        match self {
            ConfigField::StationId => 0,
            ConfigField::Flags => 1,
            ConfigField::CsmaPersistence => 2,
            ConfigField::CsmaSlotTime => 3,
            ConfigField::ShortPreamble => 4,
            ConfigField::LongPreamble => 6,
            ConfigField::WeatherInterval => 8,
            ConfigField::ComplexWeatherEvery => 10,
            ConfigField::MessageRelayList => 11,
            ConfigField::WeatherRelayList => 19,
        }
    }

    pub const fn len(&self) -> usize {
        match self {
            ConfigField::ShortPreamble | ConfigField::LongPreamble | ConfigField::WeatherInterval => 2,
            ConfigField::MessageRelayList | ConfigField::WeatherRelayList => RELAY_LIST_SIZE,
            _ => 1,
        }
    }

    /// Whether a change requires the channel access settings to be reloaded
    pub fn affects_channel(&self) -> bool {
        matches!(
            self,
            ConfigField::CsmaPersistence
                | ConfigField::CsmaSlotTime
                | ConfigField::ShortPreamble
                | ConfigField::LongPreamble
                | ConfigField::MessageRelayList
                | ConfigField::WeatherRelayList
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    UnknownField(u8),
    WrongLength { expected: usize, actual: usize },
    /// Value outside the field's domain (station id 0 is the global address)
    InvalidValue,
    ChecksumMismatch,
}

#[cfg(feature = "std")]
impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::UnknownField(field) => write!(f, "unknown configuration field 0x{:02X}", field),
            ConfigError::WrongLength { expected, actual } => write!(f, "expected {} bytes, got {}", expected, actual),
            ConfigError::InvalidValue => write!(f, "invalid configuration value"),
            ConfigError::ChecksumMismatch => write!(f, "configuration checksum mismatch"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ConfigError {}

/// Station behaviour flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfigFlags(pub u8);

impl ConfigFlags {
    /// Log loggable traffic even when this station did not relay it
    pub const RECORD_NON_RELAYED: u8 = 0x01;
    /// Do not send "OK" acknowledgments
    pub const SUPPRESS_ACK: u8 = 0x02;
    /// Forward received radio messages to the serial host
    pub const HOST_BRIDGE: u8 = 0x04;

    pub fn record_non_relayed(&self) -> bool {
        self.0 & Self::RECORD_NON_RELAYED != 0
    }

    pub fn suppress_ack(&self) -> bool {
        self.0 & Self::SUPPRESS_ACK != 0
    }

    pub fn host_bridge(&self) -> bool {
        self.0 & Self::HOST_BRIDGE != 0
    }
}

/// Static per-type relay list
///
/// Zero entries are empty slots. A message from (or to) station `id` is relayed
/// when `id` is listed. Global traffic (id 0) is relayed by any station that
/// relays for at least one peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayList(pub [u8; RELAY_LIST_SIZE]);

impl RelayList {
    pub fn from_slice(ids: &[u8]) -> Option<Self> {
        if ids.len() > RELAY_LIST_SIZE {
            return None;
        }
        let mut list = [0u8; RELAY_LIST_SIZE];
        list[..ids.len()].copy_from_slice(ids);
        Some(RelayList(list))
    }

    pub fn is_active(&self) -> bool {
        self.0.iter().any(|id| *id != GLOBAL_STATION_ID)
    }

    pub fn should_relay(&self, station_id: u8) -> bool {
        if station_id == GLOBAL_STATION_ID {
            return self.is_active();
        }
        self.0.iter().any(|id| *id == station_id)
    }
}

/// Field-level access to the persistent configuration
pub trait ConfigurationStore {
    /// Current value of `field`, exactly `field.len()` bytes
    fn get(&self, field: ConfigField) -> &[u8];

    fn set(&mut self, field: ConfigField, value: &[u8]) -> Result<(), ConfigError>;

    /// Whole image including checksum, as dumped by the query command
    fn image(&self) -> &[u8];

    fn get_u8(&self, field: ConfigField) -> u8 {
        self.get(field).first().copied().unwrap_or(0)
    }

    fn get_u16(&self, field: ConfigField) -> u16 {
        match self.get(field) {
            [low, high, ..] => u16::from_le_bytes([*low, *high]),
            _ => 0,
        }
    }

    fn station_id(&self) -> u8 {
        self.get_u8(ConfigField::StationId)
    }

    fn flags(&self) -> ConfigFlags {
        ConfigFlags(self.get_u8(ConfigField::Flags))
    }

    fn relay_list(&self, message_type: MessageType) -> RelayList {
        let field = if message_type.uses_weather_relay_list() {
            ConfigField::WeatherRelayList
        } else {
            ConfigField::MessageRelayList
        };
        let mut list = [0u8; RELAY_LIST_SIZE];
        let stored = self.get(field);
        let len = stored.len().min(RELAY_LIST_SIZE);
        list[..len].copy_from_slice(&stored[..len]);
        RelayList(list)
    }

    /// Whether this station relays anything at all
    fn relays_for_peers(&self) -> bool {
        self.relay_list(MessageType::Command).is_active() || self.relay_list(MessageType::Weather).is_active()
    }
}

/// Builds the channel access settings from the stored fields
///
/// Timeouts and receive preamble detection lengths are not stored and come
/// from `base`.
pub fn channel_access_config<C: ConfigurationStore + ?Sized>(store: &C, base: &ChannelAccessConfig) -> ChannelAccessConfig {
    ChannelAccessConfig {
        persistence: store.get_u8(ConfigField::CsmaPersistence),
        slot_time: Duration::from_millis(store.get_u8(ConfigField::CsmaSlotTime) as u64),
        short_preamble: store.get_u16(ConfigField::ShortPreamble),
        long_preamble: store.get_u16(ConfigField::LongPreamble),
        ..*base
    }
}

/// Calculate CRC-16-CCITT (polynomial 0x1021, initial value 0xFFFF, no final XOR)
///
/// ```rust,ignore
/// assert_eq!(checksum16(b"123456789"), 0x29B1);
/// ```
pub fn checksum16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Configuration image held in RAM
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryConfigStore {
    image: [u8; CONFIG_IMAGE_SIZE],
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConfigStore {
    /// Factory defaults
    pub fn new() -> Self {
        let mut image = [0u8; CONFIG_IMAGE_SIZE];
        image[ConfigField::StationId.offset()] = 1;
        image[ConfigField::CsmaPersistence.offset()] = 63;
        image[ConfigField::CsmaSlotTime.offset()] = 100;
        image[4..6].copy_from_slice(&8u16.to_le_bytes());
        image[6..8].copy_from_slice(&512u16.to_le_bytes());
        image[8..10].copy_from_slice(&300u16.to_le_bytes());
        image[ConfigField::ComplexWeatherEvery.offset()] = 6;
        let mut store = MemoryConfigStore { image };
        store.update_checksum();
        store
    }

    /// Factory defaults with another station id
    pub fn with_station_id(station_id: u8) -> Self {
        let mut store = Self::new();
        store.image[ConfigField::StationId.offset()] = station_id;
        store.update_checksum();
        store
    }

    /// Loads an image read back from EEPROM
    pub fn from_image(image: &[u8]) -> Result<Self, ConfigError> {
        if image.len() != CONFIG_IMAGE_SIZE {
            return Err(ConfigError::WrongLength {
                expected: CONFIG_IMAGE_SIZE,
                actual: image.len(),
            });
        }
        let mut store = MemoryConfigStore { image: [0u8; CONFIG_IMAGE_SIZE] };
        store.image.copy_from_slice(image);
        if store.stored_checksum() != checksum16(&store.image[..CONFIG_DATA_SIZE]) {
            return Err(ConfigError::ChecksumMismatch);
        }
        Ok(store)
    }

    /// Sets a field from its numeric id, as the configuration command does
    pub fn set_raw(&mut self, field: u8, value: &[u8]) -> Result<ConfigField, ConfigError> {
        let field = ConfigField::from_u8(field).ok_or(ConfigError::UnknownField(field))?;
        self.set(field, value)?;
        Ok(field)
    }

    fn stored_checksum(&self) -> u16 {
        u16::from_le_bytes([self.image[CONFIG_DATA_SIZE], self.image[CONFIG_DATA_SIZE + 1]])
    }

    fn update_checksum(&mut self) {
        let crc = checksum16(&self.image[..CONFIG_DATA_SIZE]);
        self.image[CONFIG_DATA_SIZE..].copy_from_slice(&crc.to_le_bytes());
    }
}

impl ConfigurationStore for MemoryConfigStore {
    fn get(&self, field: ConfigField) -> &[u8] {
        &self.image[field.offset()..field.offset() + field.len()]
    }

    fn set(&mut self, field: ConfigField, value: &[u8]) -> Result<(), ConfigError> {
        if value.len() != field.len() {
            return Err(ConfigError::WrongLength {
                expected: field.len(),
                actual: value.len(),
            });
        }
        if field == ConfigField::StationId && value[0] == GLOBAL_STATION_ID {
            return Err(ConfigError::InvalidValue);
        }
        self.image[field.offset()..field.offset() + field.len()].copy_from_slice(value);
        self.update_checksum();
        log::debug!("Configuration field {:?} updated", field);
        Ok(())
    }

    fn image(&self) -> &[u8] {
        &self.image
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn checksum16_check_value() {
        assert_eq!(checksum16(b"123456789"), 0x29B1);
    }

    #[test]
    fn fields_tile_the_image() {
        let fields = [
            ConfigField::StationId,
            ConfigField::Flags,
            ConfigField::CsmaPersistence,
            ConfigField::CsmaSlotTime,
            ConfigField::ShortPreamble,
            ConfigField::LongPreamble,
            ConfigField::WeatherInterval,
            ConfigField::ComplexWeatherEvery,
            ConfigField::MessageRelayList,
            ConfigField::WeatherRelayList,
        ];
        let mut next = 0;
        for field in fields {
            assert_eq!(field.offset(), next, "{:?}", field);
            assert_eq!(ConfigField::from_u8(field as u8), Some(field));
            next += field.len();
        }
        assert_eq!(next, CONFIG_DATA_SIZE);
    }

    #[test]
    fn defaults_survive_reload() {
        let store = MemoryConfigStore::new();
        let reloaded = MemoryConfigStore::from_image(store.image()).unwrap();
        assert_eq!(reloaded, store);
        assert_eq!(reloaded.station_id(), 1);
        assert_eq!(reloaded.get_u16(ConfigField::LongPreamble), 512);
    }

    #[test]
    fn set_recomputes_checksum() {
        let mut store = MemoryConfigStore::new();
        store.set(ConfigField::WeatherInterval, &600u16.to_le_bytes()).unwrap();
        let reloaded = MemoryConfigStore::from_image(store.image()).unwrap();
        assert_eq!(reloaded.get_u16(ConfigField::WeatherInterval), 600);
    }

    #[test]
    fn corrupted_image_is_rejected() {
        let store = MemoryConfigStore::new();
        let mut image = [0u8; CONFIG_IMAGE_SIZE];
        image.copy_from_slice(store.image());
        image[3] ^= 0x01;
        assert_eq!(MemoryConfigStore::from_image(&image), Err(ConfigError::ChecksumMismatch));
    }

    #[test]
    fn invalid_sets_are_rejected() {
        let mut store = MemoryConfigStore::new();
        assert_eq!(
            store.set(ConfigField::ShortPreamble, &[1]),
            Err(ConfigError::WrongLength { expected: 2, actual: 1 })
        );
        assert_eq!(store.set(ConfigField::StationId, &[0]), Err(ConfigError::InvalidValue));
        assert_eq!(store.set_raw(0x7F, &[1]), Err(ConfigError::UnknownField(0x7F)));
        assert_eq!(store.set_raw(0x02, &[ConfigFlags::SUPPRESS_ACK]), Ok(ConfigField::Flags));
        assert!(store.flags().suppress_ack());
    }

    #[test]
    fn relay_list_membership() {
        let empty = RelayList::default();
        assert!(!empty.should_relay(0));
        assert!(!empty.should_relay(5));

        let list = RelayList::from_slice(&[5, 9]).unwrap();
        assert!(list.should_relay(5));
        assert!(list.should_relay(9));
        assert!(!list.should_relay(6));
        assert!(list.should_relay(0));
        assert!(RelayList::from_slice(&[1; RELAY_LIST_SIZE + 1]).is_none());
    }

    #[test]
    fn relay_lists_are_type_scoped() {
        let mut store = MemoryConfigStore::new();
        store.set(ConfigField::WeatherRelayList, &RelayList::from_slice(&[7]).unwrap().0).unwrap();
        assert!(store.relay_list(MessageType::Weather).should_relay(7));
        assert!(!store.relay_list(MessageType::Ping).should_relay(7));
        assert!(store.relays_for_peers());
    }

    #[test]
    fn channel_settings_follow_store() {
        let mut store = MemoryConfigStore::new();
        store.set(ConfigField::CsmaPersistence, &[200]).unwrap();
        store.set(ConfigField::CsmaSlotTime, &[20]).unwrap();
        let config = channel_access_config(&store, &ChannelAccessConfig::default());
        assert_eq!(config.persistence, 200);
        assert_eq!(config.slot_time, Duration::from_millis(20));
        assert_eq!(config.long_preamble, 512);
        assert_eq!(config.access_timeout, ChannelAccessConfig::default().access_timeout);
    }
}
