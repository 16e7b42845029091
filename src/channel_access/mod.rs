//! # Channel Access Controller
//!
//! Sole owner of the radio. Everything that goes on air or comes off it passes
//! through [`ChannelAccessController`]:
//!
//! - **Transmit**: p-persistent CSMA (`delay_csma`), transmit preamble selection,
//!   hand-off to the driver, then re-entry of the configured idle state.
//! - **Receive**: `read_if_possible` moves the frame waiting in the one-deep
//!   hardware buffer into a bounded [`ReceiveQueue`] and re-arms the receiver;
//!   `dequeue_message` hands queued frames out without copying them.
//! - **Idle policy**: [`IdleState`] trades responsiveness against sleep current.
//!   Entering a state programs the receive preamble detection length and starts the
//!   matching receive mode.
//! - **Statistics**: CRC error rate, dropped packet rate and access delay as
//!   moving averages ([`ChannelStatistics`]).
//!
//! Driver errors never panic the controller: they come back as
//! [`ChannelError::DriverFault`] and the caller decides whether to reinitialize.

pub mod receive_queue;
pub mod statistics;

pub use receive_queue::ReceiveQueue;
pub use statistics::{ChannelStatistics, MovingAverage, StatisticsSnapshot};

use crate::radio_devices::{ChannelActivity, PreambleDirection, RadioDeviceError, RadioDriver};
use crate::{RECEIVE_ARENA_SIZE, RECEIVE_QUEUE_SLOTS};
use embassy_time::{Duration, Instant, Timer};
use log::{Level, log};
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

/// Granularity of receiver servicing while waiting out a CSMA slot
const SLOT_SERVICE_INTERVAL: Duration = Duration::from_millis(2);

/// Errors reported by the channel access controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel stayed busy beyond the absolute access timeout
    Timeout,
    /// No receive queue slot or arena space for the waiting frame. The frame stays
    /// in the radio buffer.
    QueueFull,
    /// The received frame failed the physical layer CRC and was discarded
    CrcMismatch,
    /// Requested idle state cannot be entered explicitly
    InvalidState,
    /// The radio driver reported an error; the radio is assumed wedged
    DriverFault(RadioDeviceError),
}

#[cfg(feature = "std")]
impl core::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ChannelError::Timeout => write!(f, "channel access timed out"),
            ChannelError::QueueFull => write!(f, "receive queue is full"),
            ChannelError::CrcMismatch => write!(f, "received frame failed CRC"),
            ChannelError::InvalidState => write!(f, "invalid idle state"),
            ChannelError::DriverFault(error) => write!(f, "radio driver fault: {}", error),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ChannelError {}

impl From<RadioDeviceError> for ChannelError {
    fn from(error: RadioDeviceError) -> Self {
        ChannelError::DriverFault(error)
    }
}

/// Idle behaviour of the radio between transmissions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleState {
    /// Initial state; cannot be requested
    Uninitialized,
    /// Receiver always on, catches short-preamble acknowledgments
    ContinuousReceive,
    /// Duty-cycled receiver, only long-preamble frames wake it
    IntermittentReceive,
    /// Receiver off (radio silence or shutdown)
    Sleep,
}

/// Transmit preamble class
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preamble {
    /// Time-critical replies to stations known to be listening
    Short,
    /// Long enough to wake duty-cycled receivers
    Long,
}

/// Channel access tuning
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelAccessConfig {
    /// Persistence p (0-255). After a busy channel the controller waits one slot
    /// unless a random byte falls below p.
    pub persistence: u8,
    pub slot_time: Duration,
    /// Absolute bound on one `delay_csma` call
    pub access_timeout: Duration,
    pub short_preamble: u16,
    pub long_preamble: u16,
    /// Receive preamble detection length in continuous receive
    pub continuous_rx_preamble: u16,
    /// Receive preamble detection length in duty-cycled receive
    pub intermittent_rx_preamble: u16,
}

impl Default for ChannelAccessConfig {
    fn default() -> Self {
        ChannelAccessConfig {
            persistence: 63,
            slot_time: Duration::from_millis(100),
            access_timeout: Duration::from_secs(5),
            short_preamble: 8,
            long_preamble: 512,
            continuous_rx_preamble: 8,
            intermittent_rx_preamble: 256,
        }
    }
}

impl ChannelAccessConfig {
    pub fn preamble_length(&self, preamble: Preamble) -> u16 {
        match preamble {
            Preamble::Short => self.short_preamble,
            Preamble::Long => self.long_preamble,
        }
    }
}

pub struct ChannelAccessController<R: RadioDriver> {
    radio: R,
    config: ChannelAccessConfig,
    idle_state: IdleState,
    queue: ReceiveQueue<RECEIVE_QUEUE_SLOTS, RECEIVE_ARENA_SIZE>,
    statistics: ChannelStatistics,
    last_packet_counter: u16,
    rng: WyRand,
}

impl<R: RadioDriver> ChannelAccessController<R> {
    pub fn new(mut radio: R, config: ChannelAccessConfig, rng_seed: u64) -> Self {
        let last_packet_counter = radio.receive_signal().counter();
        ChannelAccessController {
            radio,
            config,
            idle_state: IdleState::Uninitialized,
            queue: ReceiveQueue::new(),
            statistics: ChannelStatistics::new(),
            last_packet_counter,
            rng: WyRand::seed_from_u64(rng_seed),
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn config(&self) -> &ChannelAccessConfig {
        &self.config
    }

    /// Applies new tuning; takes effect with the next transmit or idle re-entry
    pub fn set_config(&mut self, config: ChannelAccessConfig) {
        self.config = config;
    }

    pub fn idle_state(&self) -> IdleState {
        self.idle_state
    }

    pub fn statistics(&self) -> &ChannelStatistics {
        &self.statistics
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Full radio initialization followed by re-entry of the current idle state
    pub async fn reinitialize(&mut self) -> Result<(), ChannelError> {
        log!(Level::Info, "Initializing radio");
        self.radio.initialize().await?;
        self.enter_idle_state().await
    }

    pub async fn set_idle_state(&mut self, state: IdleState) -> Result<(), ChannelError> {
        if state == IdleState::Uninitialized {
            return Err(ChannelError::InvalidState);
        }
        if state != self.idle_state {
            log::debug!("Idle state {:?} -> {:?}", self.idle_state, state);
        }
        self.idle_state = state;
        self.enter_idle_state().await
    }

    async fn enter_idle_state(&mut self) -> Result<(), ChannelError> {
        match self.idle_state {
            IdleState::Uninitialized => Ok(()),
            IdleState::ContinuousReceive => {
                self.radio.set_preamble_length(PreambleDirection::Receive, self.config.continuous_rx_preamble);
                Ok(self.radio.start_receive().await?)
            }
            IdleState::IntermittentReceive => {
                self.radio.set_preamble_length(PreambleDirection::Receive, self.config.intermittent_rx_preamble);
                Ok(self.radio.start_receive_duty_cycle().await?)
            }
            IdleState::Sleep => Ok(self.radio.sleep().await?),
        }
    }

    /// Sends one frame after carrier sense, then re-arms the idle state
    pub async fn transmit(&mut self, data: &[u8], preamble: Preamble) -> Result<(), ChannelError> {
        self.delay_csma().await?;
        self.radio.set_preamble_length(PreambleDirection::Transmit, self.config.preamble_length(preamble));
        if let Err(error) = self.radio.transmit(data).await {
            log!(Level::Warn, "Transmission of {} bytes failed: {:?}", data.len(), error);
            return Err(ChannelError::DriverFault(error));
        }
        log::trace!("Transmitted {} bytes with {:?} preamble", data.len(), preamble);
        self.enter_idle_state().await
    }

    /// p-persistent carrier sense with backoff
    ///
    /// Returns the time spent waiting for the channel, which is also recorded
    /// into the access delay average.
    pub async fn delay_csma(&mut self) -> Result<Duration, ChannelError> {
        let start = Instant::now();
        let deadline = start + self.config.access_timeout;
        let mut previous_busy = false;

        loop {
            if previous_busy && (self.rng.next_u32() & 0xFF) as u8 >= self.config.persistence {
                self.wait_slot().await?;
            }
            let first = self.radio.channel_busy(true).await?;
            let mut state = first;
            while state == ChannelActivity::Busy {
                self.service_receiver().await?;
                if Instant::now() >= deadline {
                    log!(Level::Warn, "Channel busy for {} ms, giving up", start.elapsed().as_millis());
                    return Err(ChannelError::Timeout);
                }
                state = self.radio.channel_busy(true).await?;
            }
            if first == ChannelActivity::Free {
                break;
            }
            previous_busy = true;
        }

        let elapsed = start.elapsed();
        self.statistics.record_access_delay(elapsed);
        Ok(elapsed)
    }

    async fn wait_slot(&mut self) -> Result<(), ChannelError> {
        let slot_end = Instant::now() + self.config.slot_time;
        loop {
            self.service_receiver().await?;
            let now = Instant::now();
            if now >= slot_end {
                return Ok(());
            }
            Timer::after((slot_end - now).min(SLOT_SERVICE_INTERVAL)).await;
        }
    }

    /// Drains every frame the radio is holding
    ///
    /// A full queue ends the drain without error; the frame waits in the radio.
    pub async fn service_receiver(&mut self) -> Result<usize, ChannelError> {
        let mut received = 0;
        loop {
            match self.read_if_possible().await {
                Ok(Some(_)) => received += 1,
                Ok(None) => return Ok(received),
                Err(ChannelError::QueueFull) => return Ok(received),
                Err(ChannelError::CrcMismatch) => continue,
                Err(error) => return Err(error),
            }
        }
    }

    /// Moves at most one frame from the radio into the receive queue
    ///
    /// Returns the length of the queued frame, `None` when no frame was waiting.
    pub async fn read_if_possible(&mut self) -> Result<Option<usize>, ChannelError> {
        if !self.radio.receive_signal().is_pending() {
            return Ok(None);
        }
        let Some(space) = self.queue.writable() else {
            log::trace!("Receive queue full, frame left in radio buffer");
            return Err(ChannelError::QueueFull);
        };

        let result = self.radio.read_data(space).await;
        let frame = match result {
            Ok(frame) => frame,
            Err(RadioDeviceError::BufferTooSmall) => {
                log::trace!("Receive arena too small for waiting frame");
                return Err(ChannelError::QueueFull);
            }
            Err(error) => {
                let announced = self.take_announced();
                self.statistics.record_lost(announced);
                log!(Level::Warn, "Reading received frame failed: {:?}", error);
                // The radio is re-armed even though the read failed; a second
                // failure here is reported instead of the first
                self.enter_idle_state().await?;
                return Err(ChannelError::DriverFault(error));
            }
        };

        let announced = self.take_announced();
        self.statistics.record_lost(announced.saturating_sub(1));
        if announced > 1 {
            log!(Level::Warn, "{} frames lost before they could be read", announced - 1);
        }
        self.statistics.record_received();
        self.statistics.record_crc(frame.crc_ok);

        if !frame.crc_ok {
            log::debug!("Discarding frame of {} bytes with CRC error", frame.length);
            self.enter_idle_state().await?;
            return Err(ChannelError::CrcMismatch);
        }

        self.queue.commit(frame.length);
        log::trace!("Queued frame of {} bytes ({} waiting)", frame.length, self.queue.len());
        self.enter_idle_state().await?;
        Ok(Some(frame.length))
    }

    /// Oldest queued frame; valid until the controller is used again
    pub fn dequeue_message(&mut self) -> Option<&[u8]> {
        self.queue.dequeue()
    }

    /// Clears the packet-ready flag and returns how many frames arrived since the
    /// previous read
    fn take_announced(&mut self) -> u16 {
        match self.radio.receive_signal().take() {
            Some(counter) => {
                let announced = counter.wrapping_sub(self.last_packet_counter);
                self.last_packet_counter = counter;
                announced
            }
            None => 0,
        }
    }
}
