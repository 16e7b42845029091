//! External collaborators consulted by the relay engine and command dispatch
//!
//! The flash message log and the remote firmware update protocol live outside
//! this crate. They are reached through [`Database`] and [`FirmwareUpdater`];
//! [`Services`] bundles them with the [`ConfigurationStore`].

use crate::RADIO_MAX_FRAME_SIZE;
use crate::config::ConfigurationStore;
use crate::messages::MessageType;
use heapless::{Deque, Vec};

/// Durable message log
pub trait Database {
    fn store_message(&mut self, message_type: MessageType, station_id: u8, payload: &[u8]);

    /// Erases every stored message
    fn erase(&mut self);
}

/// Remote firmware update protocol
pub trait FirmwareUpdater {
    /// Handles one update command. Returns the length of the reply written into
    /// `reply`, or `None` when the command was not accepted.
    fn handle_command(&mut self, arguments: &[u8], reply: &mut [u8]) -> Option<usize>;
}

/// Collaborators owned by a station
pub struct Services<C: ConfigurationStore, D: Database, F: FirmwareUpdater> {
    pub config: C,
    pub database: D,
    pub firmware: F,
}

impl<C: ConfigurationStore, D: Database, F: FirmwareUpdater> Services<C, D, F> {
    pub fn new(config: C, database: D, firmware: F) -> Self {
        Services { config, database, firmware }
    }
}

#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_type: MessageType,
    pub station_id: u8,
    pub payload: Vec<u8, RADIO_MAX_FRAME_SIZE>,
}

/// RAM-backed message log keeping the newest `N` records
pub struct MessageLog<const N: usize> {
    records: Deque<StoredMessage, N>,
    erased: u32,
}

impl<const N: usize> Default for MessageLog<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> MessageLog<N> {
    pub const fn new() -> Self {
        MessageLog {
            records: Deque::new(),
            erased: 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredMessage> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// How many times the log was erased
    pub fn erase_count(&self) -> u32 {
        self.erased
    }
}

impl<const N: usize> Database for MessageLog<N> {
    fn store_message(&mut self, message_type: MessageType, station_id: u8, payload: &[u8]) {
        let mut stored = Vec::new();
        let len = payload.len().min(RADIO_MAX_FRAME_SIZE);
        let _ = stored.extend_from_slice(&payload[..len]);
        if self.records.is_full() {
            self.records.pop_front();
        }
        let _ = self.records.push_back(StoredMessage {
            message_type,
            station_id,
            payload: stored,
        });
        log::trace!("Logged {:?} from station {}", message_type, station_id);
    }

    fn erase(&mut self) {
        self.records.clear();
        self.erased += 1;
    }
}

/// Firmware updater for stations without remote programming
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFirmwareUpdates;

impl FirmwareUpdater for NoFirmwareUpdates {
    fn handle_command(&mut self, _arguments: &[u8], _reply: &mut [u8]) -> Option<usize> {
        None
    }
}
