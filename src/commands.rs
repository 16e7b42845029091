//! # Command Dispatch
//!
//! Commands arrive either over the radio (a `C` message addressed to this station
//! or to everyone) or from the serial host (a KISS local command frame). Both
//! paths land in [`RelayEngine::execute_command`], which reads the command code
//! and its arguments from a [`MessageSource`] positioned just after the header.
//!
//! | Code | Arguments | Effect |
//! |------|-----------|--------|
//! | `N` | none | no operation, acknowledged |
//! | `F` | field, value | sets one configuration field |
//! | `L` | `M` or `W`, up to eight ids | replaces a relay list |
//! | `Q` | `C` or `V` | dumps the configuration image or volatile state |
//! | `M` | persistence, slot ms | CSMA tuning |
//! | `B` | none | radio reinitialization |
//! | `E` | none | erases the message log |
//! | `U` | update protocol bytes | firmware update step |
//! | `I` | none | picks a fresh random station id |

use crate::channel_access::StatisticsSnapshot;
use crate::config::{ConfigField, ConfigFlags, ConfigurationStore, RelayList};
use crate::messages::HEADER_SIZE;
use crate::relay::RelayEngine;
use crate::services::{Database, FirmwareUpdater, Services};
use crate::transport::MessageSource;
use crate::RADIO_MAX_FRAME_SIZE;
use embassy_time::Instant;
use heapless::Vec;
use log::{Level, log};

/// Largest reply that fits an acknowledgment frame
pub const COMMAND_REPLY_CAPACITY: usize = RADIO_MAX_FRAME_SIZE - HEADER_SIZE;

pub type CommandReply = Vec<u8, COMMAND_REPLY_CAPACITY>;

pub const REPLY_OK: &[u8] = b"OK";
pub const REPLY_IGNORED: &[u8] = b"IGNORED";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandCode {
    NoOp = b'N',
    SetField = b'F',
    SetRelayList = b'L',
    Query = b'Q',
    SetCsma = b'M',
    ReinitializeRadio = b'B',
    EraseDatabase = b'E',
    FirmwareUpdate = b'U',
    PickStationId = b'I',
}

impl CommandCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            b'N' => Some(CommandCode::NoOp),
            b'F' => Some(CommandCode::SetField),
            b'L' => Some(CommandCode::SetRelayList),
            b'Q' => Some(CommandCode::Query),
            b'M' => Some(CommandCode::SetCsma),
            b'B' => Some(CommandCode::ReinitializeRadio),
            b'E' => Some(CommandCode::EraseDatabase),
            b'U' => Some(CommandCode::FirmwareUpdate),
            b'I' => Some(CommandCode::PickStationId),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandOutcome {
    pub handled: bool,
    /// Whether a plain "OK" is owed when there is no reply data
    pub ack_required: bool,
}

impl CommandOutcome {
    pub const HANDLED: CommandOutcome = CommandOutcome {
        handled: true,
        ack_required: true,
    };
    /// Handled, answered by the reply data alone
    pub const ANSWERED: CommandOutcome = CommandOutcome {
        handled: true,
        ack_required: false,
    };
    pub const NOT_HANDLED: CommandOutcome = CommandOutcome {
        handled: false,
        ack_required: false,
    };
}

/// Picks the acknowledgment payload for an executed command
///
/// Unhandled commands always answer "IGNORED". Reply data is always sent. The
/// suppress-ack flag only silences the bare "OK".
pub fn reply_payload<'r>(outcome: &CommandOutcome, reply: &'r CommandReply, flags: ConfigFlags) -> Option<&'r [u8]> {
    if !outcome.handled {
        Some(REPLY_IGNORED)
    } else if !reply.is_empty() {
        Some(reply)
    } else if outcome.ack_required && !flags.suppress_ack() {
        Some(REPLY_OK)
    } else {
        None
    }
}

impl RelayEngine {
    /// Executes the command at the current position of `source`
    pub fn execute_command<S: MessageSource, C: ConfigurationStore, D: Database, F: FirmwareUpdater>(
        &mut self,
        source: &mut S,
        services: &mut Services<C, D, F>,
        statistics: &StatisticsSnapshot,
        now: Instant,
        reply: &mut CommandReply,
    ) -> CommandOutcome {
        let Ok(code) = source.read_byte() else {
            log::debug!("Empty command");
            return CommandOutcome::NOT_HANDLED;
        };
        let Some(command) = CommandCode::from_u8(code) else {
            log::debug!("Unknown command code 0x{:02X}", code);
            return CommandOutcome::NOT_HANDLED;
        };
        log::debug!("Executing {:?}", command);

        match command {
            CommandCode::NoOp => CommandOutcome::HANDLED,
            CommandCode::SetField => self.set_field(source, services),
            CommandCode::SetRelayList => self.set_relay_list(source, services),
            CommandCode::Query => self.query(source, services, statistics, now, reply),
            CommandCode::SetCsma => self.set_csma(source, services),
            CommandCode::ReinitializeRadio => {
                self.pending.reinitialize_radio = true;
                CommandOutcome::HANDLED
            }
            CommandCode::EraseDatabase => {
                services.database.erase();
                log!(Level::Info, "Message log erased");
                CommandOutcome::HANDLED
            }
            CommandCode::FirmwareUpdate => firmware_update(source, services, reply),
            CommandCode::PickStationId => self.pick_station_id(services, reply),
        }
    }

    fn set_field<S: MessageSource, C: ConfigurationStore, D: Database, F: FirmwareUpdater>(
        &mut self,
        source: &mut S,
        services: &mut Services<C, D, F>,
    ) -> CommandOutcome {
        let Ok(raw_field) = source.read_byte() else {
            return CommandOutcome::NOT_HANDLED;
        };
        let Some(field) = ConfigField::from_u8(raw_field) else {
            log!(Level::Warn, "Unknown configuration field 0x{:02X}", raw_field);
            return CommandOutcome::NOT_HANDLED;
        };
        let Ok(value) = source.access_bytes(source.position(), source.remaining()) else {
            return CommandOutcome::NOT_HANDLED;
        };
        match services.config.set(field, value) {
            Ok(()) => {
                log!(Level::Info, "Configuration field {:?} updated", field);
                if field.affects_channel() {
                    self.pending.reload_channel_settings = true;
                }
                CommandOutcome::HANDLED
            }
            Err(error) => {
                log!(Level::Warn, "Rejected {:?} update: {:?}", field, error);
                CommandOutcome::NOT_HANDLED
            }
        }
    }

    fn set_relay_list<S: MessageSource, C: ConfigurationStore, D: Database, F: FirmwareUpdater>(
        &mut self,
        source: &mut S,
        services: &mut Services<C, D, F>,
    ) -> CommandOutcome {
        let field = match source.read_byte() {
            Ok(b'M') => ConfigField::MessageRelayList,
            Ok(b'W') => ConfigField::WeatherRelayList,
            _ => return CommandOutcome::NOT_HANDLED,
        };
        let Ok(ids) = source.access_bytes(source.position(), source.remaining()) else {
            return CommandOutcome::NOT_HANDLED;
        };
        let Some(list) = RelayList::from_slice(ids) else {
            log!(Level::Warn, "Relay list of {} stations is too long", ids.len());
            return CommandOutcome::NOT_HANDLED;
        };
        match services.config.set(field, &list.0) {
            Ok(()) => {
                self.pending.reload_channel_settings = true;
                CommandOutcome::HANDLED
            }
            Err(_) => CommandOutcome::NOT_HANDLED,
        }
    }

    fn set_csma<S: MessageSource, C: ConfigurationStore, D: Database, F: FirmwareUpdater>(
        &mut self,
        source: &mut S,
        services: &mut Services<C, D, F>,
    ) -> CommandOutcome {
        let (Ok(persistence), Ok(slot_ms)) = (source.read_byte(), source.read_byte()) else {
            return CommandOutcome::NOT_HANDLED;
        };
        let stored = services
            .config
            .set(ConfigField::CsmaPersistence, &[persistence])
            .and_then(|_| services.config.set(ConfigField::CsmaSlotTime, &[slot_ms]));
        if stored.is_err() {
            return CommandOutcome::NOT_HANDLED;
        }
        log!(Level::Info, "CSMA persistence {} slot {} ms", persistence, slot_ms);
        self.pending.reload_channel_settings = true;
        CommandOutcome::HANDLED
    }

    fn query<S: MessageSource, C: ConfigurationStore, D: Database, F: FirmwareUpdater>(
        &mut self,
        source: &mut S,
        services: &mut Services<C, D, F>,
        statistics: &StatisticsSnapshot,
        now: Instant,
        reply: &mut CommandReply,
    ) -> CommandOutcome {
        let written = match source.read_byte() {
            Ok(b'C') => reply.extend_from_slice(services.config.image()),
            Ok(b'V') => self.volatile_state(statistics, now, reply),
            _ => return CommandOutcome::NOT_HANDLED,
        };
        match written {
            Ok(()) => CommandOutcome::ANSWERED,
            Err(()) => {
                reply.clear();
                CommandOutcome::NOT_HANDLED
            }
        }
    }

    /// Statistics, unique id counter, aggregation fill, then every recently
    /// seen station with its age in seconds
    fn volatile_state(&self, statistics: &StatisticsSnapshot, now: Instant, reply: &mut CommandReply) -> Result<(), ()> {
        reply.extend_from_slice(&statistics.encode())?;
        reply.extend_from_slice(&[self.peek_unique_id(), self.aggregation.len() as u8, self.recently_seen.len() as u8])?;
        for station in self.recently_seen.iter() {
            let age = now.saturating_duration_since(station.last_seen).as_secs().min(u16::MAX as u64) as u16;
            reply.push(station.station_id).map_err(|_| ())?;
            reply.extend_from_slice(&age.to_le_bytes())?;
        }
        Ok(())
    }

    fn pick_station_id<C: ConfigurationStore, D: Database, F: FirmwareUpdater>(
        &mut self,
        services: &mut Services<C, D, F>,
        reply: &mut CommandReply,
    ) -> CommandOutcome {
        let current = services.config.station_id();
        let Some(station_id) = self.pick_random_station_id(current) else {
            log!(Level::Warn, "No free station id");
            return CommandOutcome::NOT_HANDLED;
        };
        if services.config.set(ConfigField::StationId, &[station_id]).is_err() {
            return CommandOutcome::NOT_HANDLED;
        }
        log!(Level::Info, "Station id changed {} -> {}", current, station_id);
        let _ = reply.push(station_id);
        CommandOutcome::ANSWERED
    }
}

fn firmware_update<S: MessageSource, C: ConfigurationStore, D: Database, F: FirmwareUpdater>(
    source: &mut S,
    services: &mut Services<C, D, F>,
    reply: &mut CommandReply,
) -> CommandOutcome {
    let Ok(arguments) = source.access_bytes(source.position(), source.remaining()) else {
        return CommandOutcome::NOT_HANDLED;
    };
    let mut buffer = [0u8; COMMAND_REPLY_CAPACITY];
    match services.firmware.handle_command(arguments, &mut buffer) {
        Some(len) => {
            let _ = reply.extend_from_slice(&buffer[..len.min(COMMAND_REPLY_CAPACITY)]);
            CommandOutcome::HANDLED
        }
        None => CommandOutcome::NOT_HANDLED,
    }
}
