//! # Station Loop
//!
//! Ties the layers together for one station: the channel access controller owns
//! the radio, the relay engine owns the histories, and the station owns both plus
//! the outbox between them and the external collaborators.
//!
//! A firmware main loop looks like:
//!
//! ```rust,ignore
//! station.start().await?;
//! loop {
//!     station.poll(None).await?;
//!     if let Some(kind) = station.weather_due(Instant::now()) {
//!         let reading = sensors.read(kind);
//!         station.send_weather(&reading).await?;
//!     }
//!     Timer::after(REST_PERIOD).await;
//! }
//! ```
//!
//! Driver faults never stop the loop: the radio is reinitialized and the failed
//! frame is dropped. Repeated faults escalate to error-level logging. Sending
//! this station's own messages reports a dropped frame as an error, so the
//! caller learns that a reading never went on air.

use crate::channel_access::{ChannelAccessConfig, ChannelAccessController, ChannelError, IdleState};
use crate::config::{ConfigField, ConfigurationStore, channel_access_config};
use crate::radio_devices::RadioDriver;
use crate::relay::{RelayConfiguration, RelayEngine};
use crate::services::{Database, FirmwareUpdater, Services};
use crate::transport::{ByteSink, ByteSource, KissFrameKind, KissReader, KissSource, RadioOutbox, TransportError};
use embassy_time::{Duration, Instant};
use log::{Level, log};

/// Consecutive driver faults before the failure is reported as an error
pub const FAULT_ESCALATION_THRESHOLD: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StationError {
    Channel(ChannelError),
    Transport(TransportError),
}

#[cfg(feature = "std")]
impl core::fmt::Display for StationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StationError::Channel(error) => write!(f, "channel access: {}", error),
            StationError::Transport(error) => write!(f, "transport: {}", error),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for StationError {}

impl From<ChannelError> for StationError {
    fn from(error: ChannelError) -> Self {
        StationError::Channel(error)
    }
}

impl From<TransportError> for StationError {
    fn from(error: TransportError) -> Self {
        StationError::Transport(error)
    }
}

/// Outcome of one pass over the outbox
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub dropped: usize,
    /// Why the first dropped frame failed
    pub failure: Option<ChannelError>,
}

impl FlushReport {
    /// Fails when any frame was dropped
    pub fn into_result(self) -> Result<usize, ChannelError> {
        match self.failure {
            Some(error) => Err(error),
            None => Ok(self.sent),
        }
    }
}

/// Which sensor set the next weather message should carry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadingKind {
    /// Wind direction and speed
    Simple,
    /// Simple set plus battery, temperature and charge state
    Complex,
}

/// Weather send cadence driven by the stored interval and complex cadence
#[derive(Clone, Copy, Debug, Default)]
pub struct WeatherSchedule {
    next_due: Option<Instant>,
    sent: u32,
}

impl WeatherSchedule {
    pub const fn new() -> Self {
        WeatherSchedule { next_due: None, sent: 0 }
    }

    /// Returns the reading owed at `now` and advances the schedule
    pub fn poll<C: ConfigurationStore + ?Sized>(&mut self, config: &C, now: Instant) -> Option<ReadingKind> {
        if matches!(self.next_due, Some(due) if now < due) {
            return None;
        }
        let interval = Duration::from_secs(config.get_u16(ConfigField::WeatherInterval).max(1) as u64);
        self.next_due = Some(now + interval);

        let complex_every = config.get_u8(ConfigField::ComplexWeatherEvery) as u32;
        let kind = if complex_every != 0 && self.sent % complex_every == 0 {
            ReadingKind::Complex
        } else {
            ReadingKind::Simple
        };
        self.sent = self.sent.wrapping_add(1);
        Some(kind)
    }
}

pub struct Station<R: RadioDriver, C: ConfigurationStore, D: Database, F: FirmwareUpdater> {
    controller: ChannelAccessController<R>,
    engine: RelayEngine,
    outbox: RadioOutbox,
    services: Services<C, D, F>,
    base_config: ChannelAccessConfig,
    relay_config: RelayConfiguration,
    schedule: WeatherSchedule,
    consecutive_faults: u8,
}

impl<R: RadioDriver, C: ConfigurationStore, D: Database, F: FirmwareUpdater> Station<R, C, D, F> {
    /// Builds a station; the radio stays untouched until [`Station::start`]
    ///
    /// `base_config` supplies the channel settings that are not stored in the
    /// configuration store.
    pub fn new(radio: R, services: Services<C, D, F>, base_config: ChannelAccessConfig, relay_config: RelayConfiguration, rng_seed: u64) -> Self {
        let config = channel_access_config(&services.config, &base_config);
        Station {
            controller: ChannelAccessController::new(radio, config, rng_seed),
            engine: RelayEngine::new(rng_seed.rotate_left(32) ^ 0x9E37_79B9_7F4A_7C15),
            outbox: RadioOutbox::new(),
            services,
            base_config,
            relay_config,
            schedule: WeatherSchedule::new(),
            consecutive_faults: 0,
        }
    }

    pub fn controller(&self) -> &ChannelAccessController<R> {
        &self.controller
    }

    pub fn engine(&self) -> &RelayEngine {
        &self.engine
    }

    pub fn services(&self) -> &Services<C, D, F> {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut Services<C, D, F> {
        &mut self.services
    }

    pub fn outbox(&self) -> &RadioOutbox {
        &self.outbox
    }

    pub fn relay_configuration(&self) -> &RelayConfiguration {
        &self.relay_config
    }

    pub fn station_id(&self) -> u8 {
        self.services.config.station_id()
    }

    pub fn consecutive_faults(&self) -> u8 {
        self.consecutive_faults
    }

    /// Relaying stations listen continuously, all others duty-cycle
    pub fn idle_policy(&self) -> IdleState {
        if self.services.config.relays_for_peers() {
            IdleState::ContinuousReceive
        } else {
            IdleState::IntermittentReceive
        }
    }

    pub async fn start(&mut self) -> Result<(), ChannelError> {
        log!(Level::Info, "Starting station {}", self.station_id());
        self.controller.reinitialize().await?;
        self.controller.set_idle_state(self.idle_policy()).await
    }

    /// One main loop iteration
    ///
    /// Returns how many received messages were processed. When the outbox fills
    /// up part way, it is transmitted before the remaining messages are read.
    pub async fn poll(&mut self, mut host: Option<&mut dyn ByteSink>) -> Result<usize, ChannelError> {
        if let Err(error) = self.controller.service_receiver().await {
            self.handle_fault(error).await?;
        }
        let mut processed = 0;
        loop {
            let sink = match host {
                Some(ref mut sink) => Some(&mut **sink as &mut dyn ByteSink),
                None => None,
            };
            processed += self.engine.read_messages(&mut self.controller, &self.outbox, &mut self.services, sink);
            self.apply_pending().await?;
            self.flush().await?;
            if self.controller.queued() == 0 {
                break;
            }
        }

        let policy = self.idle_policy();
        if self.controller.idle_state() != policy {
            if let Err(error) = self.controller.set_idle_state(policy).await {
                self.handle_fault(error).await?;
            }
        }
        Ok(processed)
    }

    /// The reading owed at `now`, if any
    pub fn weather_due(&mut self, now: Instant) -> Option<ReadingKind> {
        self.schedule.poll(&self.services.config, now)
    }

    /// Originates a weather message and transmits it with the queued traffic
    pub async fn send_weather(&mut self, reading: &[u8]) -> Result<u8, StationError> {
        let unique_id = self.engine.send_weather(reading, self.station_id(), &self.outbox)?;
        self.flush().await?.into_result()?;
        Ok(unique_id)
    }

    pub async fn send_status(&mut self) -> Result<u8, StationError> {
        let statistics = self.controller.statistics().snapshot();
        let unique_id = self.engine.send_status(self.station_id(), &statistics, &self.outbox)?;
        self.flush().await?.into_result()?;
        Ok(unique_id)
    }

    /// Transmits every queued frame
    ///
    /// A frame whose transmission fails is dropped and counted in the report; a
    /// faulted radio is reinitialized and the remaining frames still go out. Only
    /// a failed reinitialization is returned as an error.
    pub async fn flush(&mut self) -> Result<FlushReport, ChannelError> {
        let mut report = FlushReport::default();
        while let Some(frame) = self.outbox.try_take() {
            match self.controller.transmit(&frame.data, frame.preamble).await {
                Ok(()) => {
                    report.sent += 1;
                    self.consecutive_faults = 0;
                }
                Err(error) => {
                    self.handle_fault(error).await?;
                    report.dropped += 1;
                    report.failure.get_or_insert(error);
                }
            }
        }
        Ok(report)
    }

    /// Acts on one KISS frame from the serial host
    pub async fn handle_host_frame(&mut self, frame: &mut KissSource<'_>, reply: &mut dyn ByteSink) -> Result<(), StationError> {
        match frame.kind() {
            Some(KissFrameKind::Data) => {
                self.engine.queue_host_frame(frame.payload(), &self.outbox)?;
                self.flush().await?.into_result()?;
            }
            Some(KissFrameKind::LocalCommand) => {
                let statistics = self.controller.statistics().snapshot();
                self.engine.execute_local_command(frame, &mut self.services, &statistics, reply);
                self.apply_pending().await?;
            }
            None => log::debug!("Ignoring host frame of kind 0x{:02X}", frame.raw_kind()),
        }
        Ok(())
    }

    /// Serial reader using this station's host line settings
    pub fn host_reader<B: ByteSource>(&self, source: B) -> KissReader<B> {
        KissReader::new(source, self.relay_config.host_byte_timeout, self.relay_config.host_station_id_length)
    }

    /// Waits for one frame from the host and handles it
    ///
    /// A timeout or a malformed frame is logged and skipped.
    pub async fn serve_host<B: ByteSource>(&mut self, reader: &mut KissReader<B>, reply: &mut dyn ByteSink) -> Result<(), StationError> {
        match reader.read_frame().await {
            Ok(mut frame) => self.handle_host_frame(&mut frame, reply).await,
            Err(error @ (TransportError::Timeout | TransportError::Framing | TransportError::BufferOverrun)) => {
                log!(Level::Warn, "Host frame abandoned: {:?}", error);
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Runs `operation` with the radio asleep, then restores the idle state
    ///
    /// Used around flash access that shares the bus with the radio.
    pub async fn with_radio_silence<T>(&mut self, operation: impl FnOnce(&mut Services<C, D, F>) -> T) -> Result<T, ChannelError> {
        let previous = self.controller.idle_state();
        self.controller.set_idle_state(IdleState::Sleep).await?;
        let result = operation(&mut self.services);
        let restored = match previous {
            IdleState::Uninitialized | IdleState::Sleep => self.idle_policy(),
            state => state,
        };
        self.controller.set_idle_state(restored).await?;
        Ok(result)
    }

    async fn apply_pending(&mut self) -> Result<(), ChannelError> {
        let pending = self.engine.take_pending();
        if pending.reload_channel_settings {
            let config = channel_access_config(&self.services.config, &self.base_config);
            log::debug!("Channel settings reloaded: {:?}", config);
            self.controller.set_config(config);
        }
        if pending.reinitialize_radio {
            self.controller.reinitialize().await?;
        }
        Ok(())
    }

    /// Absorbs transient channel errors and reinitializes a faulted radio
    ///
    /// Fails only when the reinitialization itself fails.
    async fn handle_fault(&mut self, error: ChannelError) -> Result<(), ChannelError> {
        match error {
            ChannelError::DriverFault(fault) => {
                self.consecutive_faults = self.consecutive_faults.saturating_add(1);
                if self.consecutive_faults >= FAULT_ESCALATION_THRESHOLD {
                    log!(Level::Error, "Radio faulted {} times in a row: {:?}", self.consecutive_faults, fault);
                } else {
                    log!(Level::Warn, "Radio fault {:?}, reinitializing", fault);
                }
                self.controller.reinitialize().await
            }
            ChannelError::Timeout => {
                log!(Level::Warn, "Channel stayed busy, frame dropped");
                Ok(())
            }
            other => {
                log::debug!("Channel error absorbed: {:?}", other);
                Ok(())
            }
        }
    }
}
