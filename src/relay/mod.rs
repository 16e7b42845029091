//! # Mesh Relay & Deduplication Engine
//!
//! Decides, for every decoded inbound message, whether to execute it, relay it,
//! hold it for aggregated relay, log it, or ignore it, and keeps the bounded
//! histories that stop a message from being relayed or executed twice.
//!
//! Per message:
//!
//! 1. Anything but a command carrying this station's id is our own traffic heard
//!    back through the mesh and is dropped.
//! 2. Commands addressed to this station or to everyone are executed locally
//!    (see [`crate::commands`]), at most once per unique id.
//! 3. Weather refreshes the recently-seen station list.
//! 4. A message is relayed when it is not ours and either carries the forced
//!    relay flag or its station is on the relay list for its type, unless the
//!    recently-relayed history already holds it. Weather readings are appended
//!    to the aggregation buffer instead of being relayed frame by frame.
//! 5. Loggable types go to the message log when they were relayed, or always
//!    when the record-non-relayed flag is set.
//!
//! The engine never touches the radio. Outbound frames go into the
//! [`RadioOutbox`]; work that needs the radio is reported through
//! [`PendingActions`] and applied by the station loop.

pub mod aggregation;
pub mod history;

pub use aggregation::WeatherRelayBuffer;
pub use history::{HistoryRing, RecentlyHandledCommands, RecentlyRelayed, RecentlySeenStations, RelayedMessage, SeenStation};

use crate::channel_access::{ChannelAccessController, Preamble, StatisticsSnapshot};
use crate::commands::{CommandReply, reply_payload};
use crate::config::ConfigurationStore;
use crate::messages::{GLOBAL_STATION_ID, HEADER_SIZE, HeaderError, MessageHeader, MessageType, WeatherTuple, WeatherTupleIterator};
use crate::radio_devices::RadioDriver;
use crate::services::{Database, FirmwareUpdater, Services};
use crate::transport::kiss::encode_frame;
use crate::transport::{BinaryDestination, BinarySource, ByteSink, KissDestination, KissFrameKind, MessageDestination, MessageSource, OutboundFrame, RadioOutbox, TransportError};
use crate::{AGGREGATION_BUFFER_SIZE, RADIO_MAX_FRAME_SIZE, RECENT_HISTORY_SIZE, RECENTLY_SEEN_SIZE};
use embassy_time::{Duration, Instant};
use log::{Level, log};
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

/// Types written to the message log
pub const LOGGABLE_TYPES: [MessageType; 3] = [MessageType::Weather, MessageType::Status, MessageType::Acknowledge];

/// Attempts at drawing a random station id before falling back to a scan
const RANDOM_ID_ATTEMPTS: usize = 32;

/// Free outbox slots required before the next message is taken from the queue
///
/// A command needs two (acknowledgment and relay copy). A weather frame packed
/// with readings can cause up to six aggregation flushes plus standalone relays
/// of oversized readings, all within one frame's worth of bytes.
pub const MESSAGE_OUTBOX_RESERVE: usize = 8;

/// Settings of the relay side of a station
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayConfiguration {
    /// Silence on the serial line that abandons a partial host frame
    pub host_byte_timeout: Duration,
    /// Station identifier bytes the host puts after the KISS kind byte
    pub host_station_id_length: usize,
}

impl Default for RelayConfiguration {
    fn default() -> Self {
        RelayConfiguration {
            host_byte_timeout: Duration::from_millis(500),
            host_station_id_length: 0,
        }
    }
}

/// Radio work requested by executed commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingActions {
    pub reinitialize_radio: bool,
    /// CSMA, preamble or relay list settings changed
    pub reload_channel_settings: bool,
}

impl PendingActions {
    pub fn is_empty(&self) -> bool {
        !self.reinitialize_radio && !self.reload_channel_settings
    }
}

/// What happened to one inbound message
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageDisposition {
    /// Malformed, or our own traffic heard back
    pub discarded: bool,
    pub executed: bool,
    pub relayed: bool,
    pub logged: bool,
}

/// Everything the engine consults while processing a batch of messages
pub struct RelayContext<'a, 'h, C: ConfigurationStore, D: Database, F: FirmwareUpdater> {
    pub outbox: &'a RadioOutbox,
    pub services: &'a mut Services<C, D, F>,
    pub statistics: StatisticsSnapshot,
    /// Serial host receiving a copy of every accepted message when bridging
    pub host: Option<&'h mut dyn ByteSink>,
    pub now: Instant,
}

pub struct RelayEngine {
    pub(crate) recently_seen: RecentlySeenStations<RECENTLY_SEEN_SIZE>,
    recently_relayed: RecentlyRelayed<RECENT_HISTORY_SIZE>,
    handled_commands: RecentlyHandledCommands<RECENT_HISTORY_SIZE>,
    pub(crate) aggregation: WeatherRelayBuffer<AGGREGATION_BUFFER_SIZE>,
    next_unique_id: u8,
    rng: WyRand,
    pub(crate) pending: PendingActions,
}

impl RelayEngine {
    pub fn new(rng_seed: u64) -> Self {
        let mut rng = WyRand::seed_from_u64(rng_seed);
        // Random start so a rebooted station does not reuse ids still in peer histories
        let next_unique_id = (rng.next_u32() & 0xFF) as u8;
        RelayEngine {
            recently_seen: RecentlySeenStations::new(),
            recently_relayed: RecentlyRelayed::new(),
            handled_commands: RecentlyHandledCommands::new(),
            aggregation: WeatherRelayBuffer::new(),
            next_unique_id,
            rng,
            pending: PendingActions::default(),
        }
    }

    /// Allocates the unique id of a message this station originates
    pub fn get_unique_id(&mut self) -> u8 {
        let unique_id = self.next_unique_id;
        self.next_unique_id = unique_id.wrapping_add(1);
        unique_id
    }

    pub fn peek_unique_id(&self) -> u8 {
        self.next_unique_id
    }

    pub fn recently_seen(&self) -> &RecentlySeenStations<RECENTLY_SEEN_SIZE> {
        &self.recently_seen
    }

    pub fn recently_relayed(&self) -> &RecentlyRelayed<RECENT_HISTORY_SIZE> {
        &self.recently_relayed
    }

    pub fn handled_commands(&self) -> &RecentlyHandledCommands<RECENT_HISTORY_SIZE> {
        &self.handled_commands
    }

    pub fn aggregation(&self) -> &WeatherRelayBuffer<AGGREGATION_BUFFER_SIZE> {
        &self.aggregation
    }

    /// Returns and clears the radio work requested since the last call
    pub fn take_pending(&mut self) -> PendingActions {
        core::mem::take(&mut self.pending)
    }

    /// Processes queued messages in arrival order
    ///
    /// Stops early, leaving the rest queued, once the outbox could no longer take
    /// every frame the next message may produce.
    pub fn read_messages<R: RadioDriver, C: ConfigurationStore, D: Database, F: FirmwareUpdater>(
        &mut self,
        controller: &mut ChannelAccessController<R>,
        outbox: &RadioOutbox,
        services: &mut Services<C, D, F>,
        host: Option<&mut dyn ByteSink>,
    ) -> usize {
        let mut context = RelayContext {
            outbox,
            services,
            statistics: controller.statistics().snapshot(),
            host,
            now: Instant::now(),
        };
        let mut processed = 0;
        while outbox.free_capacity() >= MESSAGE_OUTBOX_RESERVE {
            match controller.dequeue_message() {
                Some(frame) => {
                    let mut source = BinarySource::new(frame);
                    self.process_message(&mut source, &mut context);
                    processed += 1;
                }
                None => break,
            }
        }
        if controller.queued() > 0 {
            log::debug!("Outbox nearly full, {} messages wait for the next pass", controller.queued());
        }
        processed
    }

    /// Classifies one message and acts on it
    pub fn process_message<S: MessageSource, C: ConfigurationStore, D: Database, F: FirmwareUpdater>(
        &mut self,
        source: &mut S,
        context: &mut RelayContext<'_, '_, C, D, F>,
    ) -> MessageDisposition {
        let mut disposition = MessageDisposition::default();
        let self_id = context.services.config.station_id();
        let header = match read_header(source) {
            Ok(header) => header,
            Err(error) => {
                log!(Level::Warn, "Dropping malformed message: {:?}", error);
                disposition.discarded = true;
                return disposition;
            }
        };
        let message_type = header.message_type();
        log::trace!(
            "Received {:?} station {} #{}{}",
            message_type,
            header.station_id,
            header.unique_id,
            if header.forced_relay() { " (forced relay)" } else { "" }
        );

        if message_type != MessageType::Command && header.station_id == self_id {
            log::trace!("Own {:?} #{} heard back, ignoring", message_type, header.unique_id);
            disposition.discarded = true;
            return disposition;
        }

        let flags = context.services.config.flags();
        if flags.host_bridge() {
            if let Some(host) = context.host.as_deref_mut() {
                let forwarded = source
                    .access_bytes(0, source.message_len())
                    .and_then(|frame| encode_frame(host, KissFrameKind::Data, frame));
                if let Err(error) = forwarded {
                    log!(Level::Warn, "Forwarding to host failed: {:?}", error);
                }
            }
        }

        if message_type == MessageType::Command && (header.station_id == self_id || header.station_id == GLOBAL_STATION_ID) {
            disposition.executed = self.handle_radio_command(&header, self_id, source, context);
        }

        if message_type == MessageType::Weather {
            self.recently_seen.observe(header.station_id, context.now);
        }

        let relay_list = context.services.config.relay_list(message_type);
        let relay_required = header.station_id != self_id && (header.forced_relay() || relay_list.should_relay(header.station_id));
        if relay_required {
            let relayed = RelayedMessage {
                message_type,
                station_id: header.station_id,
                unique_id: header.unique_id,
            };
            if self.recently_relayed.contains(&relayed) {
                log::debug!("{:?} station {} #{} already relayed", message_type, header.station_id, header.unique_id);
            } else {
                let result = if message_type == MessageType::Weather {
                    self.aggregate_weather(source, self_id, context.outbox)
                } else {
                    relay_copy(&header, source, context.outbox)
                };
                match result {
                    Ok(()) => {
                        log::debug!("Relayed {:?} station {} #{}", message_type, header.station_id, header.unique_id);
                        self.recently_relayed.record(relayed);
                        disposition.relayed = true;
                    }
                    Err(error) => log!(Level::Warn, "Relay of {:?} #{} failed: {:?}", message_type, header.unique_id, error),
                }
            }
        }

        if should_log(message_type, disposition.relayed, flags.record_non_relayed()) {
            if let Ok(payload) = source.access_bytes(HEADER_SIZE, source.message_len() - HEADER_SIZE) {
                context.services.database.store_message(message_type, header.station_id, payload);
                disposition.logged = true;
            }
        }
        disposition
    }

    fn handle_radio_command<S: MessageSource, C: ConfigurationStore, D: Database, F: FirmwareUpdater>(
        &mut self,
        header: &MessageHeader,
        self_id: u8,
        source: &mut S,
        context: &mut RelayContext<'_, '_, C, D, F>,
    ) -> bool {
        if self.handled_commands.contains(header.unique_id) {
            log::debug!("Command #{} already handled", header.unique_id);
            return false;
        }
        let mut reply = CommandReply::new();
        let outcome = self.execute_command(source, context.services, &context.statistics, context.now, &mut reply);
        self.handled_commands.record(header.unique_id);

        if let Some(payload) = reply_payload(&outcome, &reply, context.services.config.flags()) {
            let header = MessageHeader::new(MessageType::Acknowledge, false, self_id, header.unique_id);
            let mut destination = BinaryDestination::with_header(context.outbox, header, Preamble::Short);
            if let Err(error) = destination.append(payload).and_then(|_| destination.finish_and_send()) {
                log!(Level::Warn, "Reply to command #{} not queued: {:?}", header.unique_id, error);
                destination.abort();
            }
        }
        outcome.handled
    }

    /// Executes a command from the serial host and answers on the serial line
    pub fn execute_local_command<S: MessageSource, C: ConfigurationStore, D: Database, F: FirmwareUpdater>(
        &mut self,
        source: &mut S,
        services: &mut Services<C, D, F>,
        statistics: &StatisticsSnapshot,
        sink: &mut dyn ByteSink,
    ) -> bool {
        let mut reply = CommandReply::new();
        let outcome = self.execute_command(source, services, statistics, Instant::now(), &mut reply);
        if let Some(payload) = reply_payload(&outcome, &reply, services.config.flags()) {
            let mut destination = KissDestination::new(sink, KissFrameKind::LocalCommand);
            if destination.append(payload).is_err() {
                destination.abort();
            }
        }
        outcome.handled
    }

    /// Queues a raw radio frame handed over by the serial host
    ///
    /// The frame is remembered as relayed so its copies coming back through the
    /// mesh are not relayed again.
    pub fn queue_host_frame(&mut self, frame: &[u8], outbox: &RadioOutbox) -> Result<(), TransportError> {
        let preamble = match MessageHeader::parse(frame) {
            Ok(header) => {
                self.recently_relayed.record(RelayedMessage {
                    message_type: header.message_type(),
                    station_id: header.station_id,
                    unique_id: header.unique_id,
                });
                preamble_for(header.message_type())
            }
            Err(error) => {
                log!(Level::Debug, "Host frame without valid header ({:?}), sending as is", error);
                Preamble::Long
            }
        };
        outbox.push(OutboundFrame::from_slice(frame, preamble)?)
    }

    fn aggregate_weather<S: MessageSource>(&mut self, source: &S, self_id: u8, outbox: &RadioOutbox) -> Result<(), TransportError> {
        let body = source.access_bytes(1, source.message_len() - 1)?;
        let mut tuples = WeatherTupleIterator::new(body);
        for tuple in tuples.by_ref() {
            if tuple.station_id == self_id {
                continue;
            }
            self.aggregate_tuple(&tuple, self_id, outbox)?;
        }
        if tuples.truncated() {
            log!(Level::Warn, "Weather message with malformed reading tuple");
        }
        Ok(())
    }

    fn aggregate_tuple(&mut self, tuple: &WeatherTuple<'_>, self_id: u8, outbox: &RadioOutbox) -> Result<(), TransportError> {
        if self.aggregation.push(tuple) {
            return Ok(());
        }
        self.flush_aggregation(self_id, outbox)?;
        if self.aggregation.push(tuple) {
            return Ok(());
        }
        // Larger than the whole buffer: relay it on its own
        let unique_id = self.get_unique_id();
        let tuple_header = [tuple.station_id, tuple.unique_id, tuple.reading.len() as u8];
        send_weather_frame(outbox, self_id, unique_id, &[], &[&tuple_header, tuple.reading])
    }

    /// Sends the aggregation buffer as a weather message of its own
    pub fn flush_aggregation(&mut self, self_id: u8, outbox: &RadioOutbox) -> Result<(), TransportError> {
        if self.aggregation.is_empty() {
            return Ok(());
        }
        let unique_id = self.get_unique_id();
        let result = send_weather_frame(outbox, self_id, unique_id, &[], &[self.aggregation.as_bytes()]);
        log!(Level::Debug, "Flushed {} aggregated readings as #{}", self.aggregation.tuple_count(), unique_id);
        self.aggregation.clear();
        result
    }

    /// Originates this station's weather message, carrying the aggregated readings
    pub fn send_weather(&mut self, reading: &[u8], self_id: u8, outbox: &RadioOutbox) -> Result<u8, TransportError> {
        let room = RADIO_MAX_FRAME_SIZE - HEADER_SIZE - 1;
        if reading.len() > room || reading.len() > u8::MAX as usize {
            return Err(TransportError::BufferOverrun);
        }
        let unique_id = self.get_unique_id();
        if self.aggregation.len() <= room - reading.len() {
            let result = send_weather_frame(outbox, self_id, unique_id, reading, &[self.aggregation.as_bytes()]);
            if !self.aggregation.is_empty() {
                log::debug!("Weather #{} carries {} relayed readings", unique_id, self.aggregation.tuple_count());
            }
            self.aggregation.clear();
            result?;
        } else {
            send_weather_frame(outbox, self_id, unique_id, reading, &[])?;
            self.flush_aggregation(self_id, outbox)?;
        }
        Ok(unique_id)
    }

    /// Originates a status message with channel statistics
    pub fn send_status(&mut self, self_id: u8, statistics: &StatisticsSnapshot, outbox: &RadioOutbox) -> Result<u8, TransportError> {
        let unique_id = self.get_unique_id();
        let header = MessageHeader::new(MessageType::Status, false, self_id, unique_id);
        let mut destination = BinaryDestination::with_header(outbox, header, Preamble::Long);
        let body = destination
            .append(&statistics.encode())
            .and_then(|_| destination.append(&[self.recently_seen.len() as u8, self.aggregation.len() as u8]));
        if let Err(error) = body {
            destination.abort();
            return Err(error);
        }
        destination.finish_and_send()?;
        Ok(unique_id)
    }

    /// Picks a station id that is neither ours, global, nor recently heard
    pub fn pick_random_station_id(&mut self, self_id: u8) -> Option<u8> {
        let usable = |id: u8, seen: &RecentlySeenStations<RECENTLY_SEEN_SIZE>| id != GLOBAL_STATION_ID && id != self_id && !seen.contains(id);
        for _ in 0..RANDOM_ID_ATTEMPTS {
            let candidate = (self.rng.next_u32() & 0xFF) as u8;
            if usable(candidate, &self.recently_seen) {
                return Some(candidate);
            }
        }
        (1..=u8::MAX).find(|id| usable(*id, &self.recently_seen))
    }
}

fn read_header<S: MessageSource>(source: &mut S) -> Result<MessageHeader, HeaderError> {
    let mut raw = [0u8; HEADER_SIZE];
    source.read_into(&mut raw).map_err(|_| HeaderError::Truncated)?;
    MessageHeader::parse(&raw)
}

/// Acknowledgments go out with a short preamble, everything else long
fn preamble_for(message_type: MessageType) -> Preamble {
    if message_type == MessageType::Acknowledge {
        Preamble::Short
    } else {
        Preamble::Long
    }
}

fn should_log(message_type: MessageType, relayed: bool, record_non_relayed: bool) -> bool {
    LOGGABLE_TYPES.contains(&message_type) && (relayed || record_non_relayed)
}

/// Re-sends a message under its original header; commands and pings keep
/// demanding relay, replies do not
fn relay_copy<S: MessageSource>(header: &MessageHeader, source: &S, outbox: &RadioOutbox) -> Result<(), TransportError> {
    let message_type = header.message_type();
    let forced_relay = matches!(message_type, MessageType::Command | MessageType::Ping);
    let copy = MessageHeader::new(message_type, forced_relay, header.station_id, header.unique_id);
    let mut destination = BinaryDestination::with_header(outbox, copy, preamble_for(message_type));
    let payload = source.access_bytes(HEADER_SIZE, source.message_len() - HEADER_SIZE)?;
    if let Err(error) = destination.append(payload) {
        destination.abort();
        return Err(error);
    }
    destination.finish_and_send()
}

fn send_weather_frame(outbox: &RadioOutbox, self_id: u8, unique_id: u8, reading: &[u8], tail: &[&[u8]]) -> Result<(), TransportError> {
    let header = MessageHeader::new(MessageType::Weather, false, self_id, unique_id);
    let mut destination = BinaryDestination::with_header(outbox, header, Preamble::Long);
    let mut result = destination.append_byte(reading.len() as u8).and_then(|_| destination.append(reading));
    for part in tail {
        result = result.and_then(|_| destination.append(part));
    }
    if let Err(error) = result {
        destination.abort();
        return Err(error);
    }
    destination.finish_and_send()
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::channel_access::{ChannelAccessConfig, IdleState};
    use crate::config::{ConfigField, ConfigFlags, MemoryConfigStore, RelayList};
    use crate::messages::FORCED_RELAY_FLAG;
    use crate::radio_devices::EchoRadio;
    use crate::services::{MessageLog, NoFirmwareUpdates};
    use crate::{OUTBOX_SIZE, RECEIVE_QUEUE_SLOTS};
    use futures::executor::block_on;

    const SELF_ID: u8 = 3;

    type TestServices = Services<MemoryConfigStore, MessageLog<16>, NoFirmwareUpdates>;

    fn services() -> TestServices {
        Services::new(MemoryConfigStore::with_station_id(SELF_ID), MessageLog::new(), NoFirmwareUpdates)
    }

    fn set_list(services: &mut TestServices, field: ConfigField, ids: &[u8]) {
        services.config.set(field, &RelayList::from_slice(ids).unwrap().0).unwrap();
    }

    fn process(engine: &mut RelayEngine, services: &mut TestServices, outbox: &RadioOutbox, frame: &[u8]) -> MessageDisposition {
        let mut context = RelayContext {
            outbox,
            services,
            statistics: StatisticsSnapshot::default(),
            host: None,
            now: Instant::from_secs(100),
        };
        engine.process_message(&mut BinarySource::new(frame), &mut context)
    }

    fn drain(outbox: &RadioOutbox) -> std::vec::Vec<OutboundFrame> {
        core::iter::from_fn(|| outbox.try_take()).collect()
    }

    fn fill_outbox(outbox: &RadioOutbox, frames: usize) {
        for _ in 0..frames {
            outbox.push(OutboundFrame::from_slice(&[0], Preamble::Long).unwrap()).unwrap();
        }
    }

    /// Controller with `frames` already moved into its receive queue
    fn queued_controller(frames: &[std::vec::Vec<u8>]) -> ChannelAccessController<EchoRadio> {
        let mut controller = ChannelAccessController::new(EchoRadio::new(), ChannelAccessConfig::default(), 1);
        block_on(async {
            controller.reinitialize().await.unwrap();
            controller.set_idle_state(IdleState::ContinuousReceive).await.unwrap();
            for frame in frames {
                controller.radio_mut().inject(frame, true);
                assert_eq!(controller.read_if_possible().await.unwrap(), Some(frame.len()));
            }
        });
        controller
    }

    fn weather(station_id: u8, unique_id: u8, reading: &[u8]) -> std::vec::Vec<u8> {
        let mut frame = vec![b'W', station_id, unique_id, reading.len() as u8];
        frame.extend_from_slice(reading);
        frame
    }

    #[test]
    fn duplicate_deliveries_relay_once() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        set_list(&mut services, ConfigField::MessageRelayList, &[5]);
        let frame = [b'S', 5, 7, 1, 2, 3];
        let dispositions: std::vec::Vec<_> = (0..3).map(|_| process(&mut engine, &mut services, &outbox, &frame)).collect();
        assert!(dispositions[0].relayed);
        assert!(!dispositions[1].relayed && !dispositions[2].relayed);
        let sent = drain(&outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].data[..], &frame);
        assert_eq!(sent[0].preamble, Preamble::Long);
    }

    #[test]
    fn full_receive_queue_is_acknowledged_and_relayed_in_one_pass() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        set_list(&mut services, ConfigField::MessageRelayList, &[8]);
        let frames: std::vec::Vec<_> = (1..=RECEIVE_QUEUE_SLOTS as u8).map(|unique_id| std::vec![b'C', GLOBAL_STATION_ID, unique_id, b'N']).collect();
        let mut controller = queued_controller(&frames);
        assert_eq!(controller.queued(), RECEIVE_QUEUE_SLOTS);

        assert_eq!(engine.read_messages(&mut controller, &outbox, &mut services, None), RECEIVE_QUEUE_SLOTS);
        let sent = drain(&outbox);
        let acks = sent.iter().filter(|frame| frame.data[0] == b'A').count();
        let relays = sent.iter().filter(|frame| frame.data[0] == FORCED_RELAY_FLAG | b'C').count();
        assert_eq!(acks, RECEIVE_QUEUE_SLOTS);
        assert_eq!(relays, RECEIVE_QUEUE_SLOTS);
        assert_eq!(engine.recently_relayed().len(), relays);
        assert_eq!(engine.handled_commands().len(), acks);
    }

    #[test]
    fn nearly_full_outbox_leaves_messages_queued() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        fill_outbox(&outbox, OUTBOX_SIZE - MESSAGE_OUTBOX_RESERVE + 1);
        let mut controller = queued_controller(&[std::vec![b'C', SELF_ID, 9, b'N']]);

        assert_eq!(engine.read_messages(&mut controller, &outbox, &mut services, None), 0);
        assert_eq!(controller.queued(), 1);
        assert!(engine.handled_commands().is_empty());

        outbox.clear();
        assert_eq!(engine.read_messages(&mut controller, &outbox, &mut services, None), 1);
        assert_eq!(&drain(&outbox)[0].data[..], b"A\x03\x09OK");
    }

    #[test]
    fn relay_lost_to_full_outbox_is_not_remembered() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        set_list(&mut services, ConfigField::MessageRelayList, &[5]);
        fill_outbox(&outbox, OUTBOX_SIZE);
        let frame = [b'S', 5, 7, 1];
        assert!(!process(&mut engine, &mut services, &outbox, &frame).relayed);
        assert!(engine.recently_relayed().is_empty());

        outbox.clear();
        assert!(process(&mut engine, &mut services, &outbox, &frame).relayed);
        assert_eq!(&drain(&outbox)[0].data[..], &frame);
    }

    #[test]
    fn own_messages_are_never_relayed_or_acted_on() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        services.config.set(ConfigField::Flags, &[ConfigFlags::RECORD_NON_RELAYED]).unwrap();
        set_list(&mut services, ConfigField::MessageRelayList, &[SELF_ID]);
        set_list(&mut services, ConfigField::WeatherRelayList, &[SELF_ID]);
        for frame in [
            std::vec![FORCED_RELAY_FLAG | b'S', SELF_ID, 1, 9],
            std::vec![FORCED_RELAY_FLAG | b'P', SELF_ID, 2],
            weather(SELF_ID, 3, &[1, 2]),
            std::vec![b'A', SELF_ID, 4, b'O', b'K'],
        ] {
            let disposition = process(&mut engine, &mut services, &outbox, &frame);
            assert_eq!(disposition, MessageDisposition { discarded: true, ..Default::default() });
        }
        assert!(outbox.is_empty());
        assert!(services.database.is_empty());
        assert!(engine.recently_seen().is_empty());
    }

    #[test]
    fn forced_command_for_foreign_station_is_relayed() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        let frame = [FORCED_RELAY_FLAG | b'C', 9, 44, b'N'];
        let disposition = process(&mut engine, &mut services, &outbox, &frame);
        assert!(disposition.relayed);
        assert!(!disposition.executed);
        let sent = drain(&outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].data[..], &frame);
    }

    #[test]
    fn unforced_command_without_list_is_not_relayed() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        let disposition = process(&mut engine, &mut services, &outbox, &[b'C', 9, 44, b'N']);
        assert_eq!(disposition, MessageDisposition::default());
        assert!(outbox.is_empty());
    }

    #[test]
    fn listed_command_relay_copy_demands_forced_relay() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        set_list(&mut services, ConfigField::MessageRelayList, &[9]);
        process(&mut engine, &mut services, &outbox, &[b'C', 9, 44, b'Q', b'C']);
        let sent = drain(&outbox);
        assert_eq!(&sent[0].data[..], &[FORCED_RELAY_FLAG | b'C', 9, 44, b'Q', b'C']);
    }

    #[test]
    fn acknowledgment_relay_is_short_and_unforced() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        set_list(&mut services, ConfigField::MessageRelayList, &[5]);
        let disposition = process(&mut engine, &mut services, &outbox, &[FORCED_RELAY_FLAG | b'A', 5, 12, b'O', b'K']);
        assert!(disposition.relayed && disposition.logged);
        let sent = drain(&outbox);
        assert_eq!(&sent[0].data[..], &[b'A', 5, 12, b'O', b'K']);
        assert_eq!(sent[0].preamble, Preamble::Short);
    }

    #[test]
    fn command_with_unique_id_zero_always_executes() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        let frame = [b'C', SELF_ID, 0, b'N'];
        assert!(process(&mut engine, &mut services, &outbox, &frame).executed);
        assert!(process(&mut engine, &mut services, &outbox, &frame).executed);
        assert!(engine.handled_commands().is_empty());
        let acks = drain(&outbox);
        assert_eq!(acks.len(), 2);
        assert_eq!(&acks[0].data[..], &[b'A', SELF_ID, 0, b'O', b'K']);
        assert_eq!(acks[0].preamble, Preamble::Short);
    }

    #[test]
    fn repeated_command_executes_once() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        let frame = [b'C', SELF_ID, 77, b'E'];
        assert!(process(&mut engine, &mut services, &outbox, &frame).executed);
        assert!(!process(&mut engine, &mut services, &outbox, &frame).executed);
        assert_eq!(services.database.erase_count(), 1);
        assert!(engine.handled_commands().contains(77));
        assert_eq!(drain(&outbox).len(), 1);
    }

    #[test]
    fn global_command_executes_and_relays_for_active_station() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        set_list(&mut services, ConfigField::MessageRelayList, &[8]);
        let disposition = process(&mut engine, &mut services, &outbox, &[b'C', GLOBAL_STATION_ID, 5, b'N']);
        assert!(disposition.executed && disposition.relayed);
        let sent = drain(&outbox);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].data[0], b'A');
        assert_eq!(&sent[1].data[..], &[FORCED_RELAY_FLAG | b'C', GLOBAL_STATION_ID, 5, b'N']);
    }

    #[test]
    fn unknown_command_is_ignored_even_with_ack_suppression() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        services.config.set(ConfigField::Flags, &[ConfigFlags::SUPPRESS_ACK]).unwrap();
        assert!(!process(&mut engine, &mut services, &outbox, &[b'C', SELF_ID, 1, b'Z']).executed);
        assert!(process(&mut engine, &mut services, &outbox, &[b'C', SELF_ID, 2, b'N']).executed);
        let replies = drain(&outbox);
        assert_eq!(replies.len(), 1);
        assert_eq!(&replies[0].data[3..], b"IGNORED");
    }

    #[test]
    fn unknown_type_is_dropped() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        let disposition = process(&mut engine, &mut services, &outbox, &[FORCED_RELAY_FLAG | b'X', 4, 4, 4]);
        assert!(disposition.discarded);
        assert!(process(&mut engine, &mut services, &outbox, &[b'W', 4]).discarded);
        assert!(outbox.is_empty());
    }

    #[test]
    fn weather_updates_recently_seen_without_relay() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        let disposition = process(&mut engine, &mut services, &outbox, &weather(6, 1, &[10, 20]));
        assert!(!disposition.relayed && !disposition.logged);
        assert!(engine.recently_seen().contains(6));
        assert!(engine.aggregation().is_empty());
    }

    #[test]
    fn relayed_weather_is_aggregated_not_sent() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        set_list(&mut services, ConfigField::WeatherRelayList, &[6]);
        let mut frame = weather(6, 1, &[10, 20]);
        // a reading relayed earlier by station 6, plus one of ours that came back around
        frame.extend_from_slice(&[7, 2, 1, 30, SELF_ID, 9, 1, 40]);
        let disposition = process(&mut engine, &mut services, &outbox, &frame);
        assert!(disposition.relayed && disposition.logged);
        assert!(outbox.is_empty());
        assert_eq!(engine.aggregation().as_bytes(), &[6, 1, 2, 10, 20, 7, 2, 1, 30]);
    }

    #[test]
    fn aggregation_overflow_flushes_exactly_once_before_storing() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        set_list(&mut services, ConfigField::WeatherRelayList, &[6]);
        let reading = [0x5A; 40];
        for unique_id in 0..2 {
            process(&mut engine, &mut services, &outbox, &weather(6, unique_id, &reading));
            assert!(outbox.is_empty());
        }
        assert_eq!(engine.aggregation().len(), 86);

        process(&mut engine, &mut services, &outbox, &weather(6, 2, &reading));
        assert!(engine.aggregation().len() <= AGGREGATION_BUFFER_SIZE);
        assert_eq!(engine.aggregation().len(), 43);
        let flushed = drain(&outbox);
        assert_eq!(flushed.len(), 1);
        let frame = &flushed[0].data;
        assert_eq!(&frame[..2], &[b'W', SELF_ID]);
        assert_eq!(frame[3], 0, "flush carries no reading of its own");
        assert_eq!(frame.len(), HEADER_SIZE + 1 + 86);
        let stations: std::vec::Vec<_> = WeatherTupleIterator::new(&frame[1..]).map(|tuple| tuple.unique_id).collect();
        assert_eq!(stations, vec![frame[2], 0, 1]);
    }

    #[test]
    fn oversized_reading_is_relayed_standalone() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        set_list(&mut services, ConfigField::WeatherRelayList, &[6]);
        process(&mut engine, &mut services, &outbox, &weather(6, 1, &[1; 120]));
        assert!(engine.aggregation().is_empty());
        let sent = drain(&outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data.len(), HEADER_SIZE + 1 + 3 + 120);
    }

    #[test]
    fn own_weather_carries_aggregated_readings() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        set_list(&mut services, ConfigField::WeatherRelayList, &[6]);
        process(&mut engine, &mut services, &outbox, &weather(6, 1, &[10]));
        let unique_id = engine.send_weather(&[1, 2, 3], SELF_ID, &outbox).unwrap();
        assert!(engine.aggregation().is_empty());
        let sent = drain(&outbox);
        assert_eq!(&sent[0].data[..], &[b'W', SELF_ID, unique_id, 3, 1, 2, 3, 6, 1, 1, 10]);
    }

    #[test]
    fn logging_follows_record_non_relayed_flag() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        assert!(!process(&mut engine, &mut services, &outbox, &[b'S', 5, 1, 0xEE]).logged);
        services.config.set(ConfigField::Flags, &[ConfigFlags::RECORD_NON_RELAYED]).unwrap();
        assert!(process(&mut engine, &mut services, &outbox, &[b'S', 5, 2, 0xEE]).logged);
        // Pings are never logged
        assert!(!process(&mut engine, &mut services, &outbox, &[b'P', 5, 3]).logged);
        let record = services.database.iter().next().unwrap();
        assert_eq!((record.message_type, record.station_id), (MessageType::Status, 5));
        assert_eq!(&record.payload[..], &[0xEE]);
    }

    #[test]
    fn host_bridge_forwards_accepted_frames() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        services.config.set(ConfigField::Flags, &[ConfigFlags::HOST_BRIDGE]).unwrap();
        let mut host = std::vec::Vec::<u8>::new();
        {
            let mut context = RelayContext {
                outbox: &outbox,
                services: &mut services,
                statistics: StatisticsSnapshot::default(),
                host: Some(&mut host),
                now: Instant::from_secs(1),
            };
            engine.process_message(&mut BinarySource::new(&[b'S', 5, 1, 0xC0]), &mut context);
            engine.process_message(&mut BinarySource::new(&[b'S', SELF_ID, 2]), &mut context);
        }
        assert_eq!(host, vec![0xC0, 0x00, b'S', 5, 1, 0xDB, 0xDC, 0xC0]);
    }

    #[test]
    fn host_frames_are_not_relayed_back() {
        let mut engine = RelayEngine::new(1);
        let mut services = services();
        let outbox = RadioOutbox::new();
        let frame = [FORCED_RELAY_FLAG | b'C', 9, 60, b'N'];
        engine.queue_host_frame(&frame, &outbox).unwrap();
        assert_eq!(drain(&outbox).len(), 1);
        assert!(!process(&mut engine, &mut services, &outbox, &frame).relayed);
    }

    #[test]
    fn unique_ids_wrap() {
        let mut engine = RelayEngine::new(1);
        let start = engine.peek_unique_id();
        let ids: std::vec::Vec<u8> = (0..300).map(|_| engine.get_unique_id()).collect();
        assert_eq!(ids[0], start);
        assert_eq!(ids[256], start);
        assert_eq!(ids[1], start.wrapping_add(1));
    }

    #[test]
    fn random_station_id_avoids_known_ids() {
        let mut engine = RelayEngine::new(5);
        for station in 1..=250u8 {
            engine.recently_seen.observe(station, Instant::from_secs(station as u64));
        }
        for _ in 0..20 {
            let id = engine.pick_random_station_id(SELF_ID).unwrap();
            assert!(id != GLOBAL_STATION_ID && id != SELF_ID);
            assert!(!engine.recently_seen().contains(id));
        }
    }

    #[test]
    fn status_message_carries_statistics() {
        let mut engine = RelayEngine::new(1);
        let outbox = RadioOutbox::new();
        let statistics = StatisticsSnapshot {
            crc_error_rate: 1,
            dropped_packet_rate: 2,
            access_delay_ms: 3,
        };
        let unique_id = engine.send_status(SELF_ID, &statistics, &outbox).unwrap();
        let sent = drain(&outbox);
        assert_eq!(&sent[0].data[..], &[b'S', SELF_ID, unique_id, 1, 0, 2, 0, 3, 0, 0, 0]);
    }
}
