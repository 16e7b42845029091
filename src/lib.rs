#![cfg_attr(not(feature = "std"), no_std)]
#![allow(async_fn_in_trait)] // We control the usage of these traits

//! # Weather Mesh Radio
//!
//! Communications core of a solar powered weather station that shares one
//! half-duplex radio channel with its peers and a base station, forming a simple
//! store-and-forward mesh.
//!
//! Layers, leaves first:
//!
//! - [`radio_devices`]: the [`RadioDriver`] contract plus loopback and simulated
//!   devices
//! - [`channel_access`]: p-persistent CSMA, the receive queue in front of the
//!   single-frame transceiver buffer, idle states and channel statistics
//! - [`transport`]: binary radio framing and KISS serial framing behind one
//!   read/append contract
//! - [`relay`]: the relay and deduplication engine, with [`commands`] for the
//!   local command set
//! - [`station`]: the main loop gluing the layers to the external collaborators
//!   in [`config`] and [`services`]
//!
//! Everything is allocation free; buffers are sized by the constants below.

#[cfg(all(not(test), not(any(feature = "radio-device-echo", feature = "radio-device-simulator"))))]
compile_error!("At least one radio device feature must be enabled");

pub mod channel_access;
pub mod commands;
pub mod config;
pub mod messages;
pub mod radio_devices;
pub mod relay;
pub mod services;
pub mod station;
pub mod transport;

pub use channel_access::{ChannelAccessConfig, ChannelAccessController, ChannelError, IdleState, Preamble, StatisticsSnapshot};
pub use config::{ConfigError, ConfigField, ConfigFlags, ConfigurationStore, MemoryConfigStore, RelayList};
pub use messages::{MessageHeader, MessageType};
pub use radio_devices::{RadioDeviceError, RadioDriver};
pub use relay::{RelayConfiguration, RelayEngine};
pub use services::{Database, FirmwareUpdater, MessageLog, NoFirmwareUpdates, Services};
pub use station::{FlushReport, ReadingKind, Station, StationError};
pub use transport::{MessageDestination, MessageSource, TransportError};

//Radio dependent constants, that affect compatibility of a node
pub const RADIO_MAX_FRAME_SIZE: usize = 254;
/// Hardware receive buffer of the transceiver
pub const RADIO_DEVICE_BUFFER_SIZE: usize = 255;
pub const RELAY_LIST_SIZE: usize = 8;
pub const KISS_MAX_PAYLOAD: usize = RADIO_MAX_FRAME_SIZE;

//Constants that only affect efficiency of a node, but do not result incompatibility
pub const RECEIVE_QUEUE_SLOTS: usize = 8;
pub const RECEIVE_ARENA_SIZE: usize = 255;
/// Room for an acknowledgment, a relay copy and an aggregation flush per queued message
pub const OUTBOX_SIZE: usize = 3 * RECEIVE_QUEUE_SLOTS;
pub const RECENT_HISTORY_SIZE: usize = 16;
pub const RECENTLY_SEEN_SIZE: usize = 16;
pub const AGGREGATION_BUFFER_SIZE: usize = 100;
