//! # Simulated Medium - Multi-Station Radio Simulation
//!
//! A [`SimulatedMedium`] models one shared radio channel for `N` stations. Each
//! station gets a [`SimulatedRadio`] handle implementing [`RadioDriver`], so whole
//! stations (controller, relay engine, command dispatch) can be wired together in
//! tests and in the demo without hardware.
//!
//! ## Model
//!
//! - **Links**: a directed matrix. A link is `Down`, `Clean` or `Corrupting` (the
//!   frame arrives with a failed CRC).
//! - **Receivers**: a frame is delivered only when the receiver is listening
//!   (continuous or duty-cycled) and the transmit preamble is at least as long as
//!   the receiver's preamble detection length. Duty-cycled stations therefore
//!   only wake for long-preamble frames.
//! - **Hardware buffer**: one frame per station. A second delivery before the
//!   first is read overwrites it and the packet counter moves on, so the loss
//!   shows up as a counter gap.
//! - **Contention**: busy answers are scripted per station (`script_busy`),
//!   which keeps CSMA tests deterministic.
//!
//! All state sits behind a critical-section mutex so the radios only need a shared
//! reference to the medium.

use super::{ChannelActivity, PacketSignal, PreambleDirection, RadioDeviceError, RadioDriver, ReceivedFrame, ReceiverMode};
use crate::RADIO_DEVICE_BUFFER_SIZE;
use core::cell::RefCell;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use heapless::Vec;
use log::{Level, log};

/// State of a directed link between two simulated stations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Clean,
    /// Frames arrive but fail the CRC check
    Corrupting,
}

struct HardwareBuffer {
    data: Vec<u8, RADIO_DEVICE_BUFFER_SIZE>,
    crc_ok: bool,
}

struct StationState<const N: usize> {
    links: [LinkState; N],
    mode: ReceiverMode,
    initialized: bool,
    tx_preamble: u16,
    rx_preamble: u16,
    busy_answers: u32,
    fail_next_transmit: Option<RadioDeviceError>,
    buffer: Option<HardwareBuffer>,
    delivered: u32,
    transmitted: u32,
}

impl<const N: usize> StationState<N> {
    fn new() -> Self {
        StationState {
            links: [LinkState::Down; N],
            mode: ReceiverMode::Standby,
            initialized: false,
            tx_preamble: 0,
            rx_preamble: 0,
            busy_answers: 0,
            fail_next_transmit: None,
            buffer: None,
            delivered: 0,
            transmitted: 0,
        }
    }
}

/// Shared channel connecting `N` simulated stations
pub struct SimulatedMedium<const N: usize> {
    stations: Mutex<CriticalSectionRawMutex, RefCell<[StationState<N>; N]>>,
    signals: [PacketSignal; N],
}

impl<const N: usize> Default for SimulatedMedium<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SimulatedMedium<N> {
    /// Creates a medium with every link down
    pub fn new() -> Self {
        SimulatedMedium {
            stations: Mutex::new(RefCell::new(core::array::from_fn(|_| StationState::new()))),
            signals: core::array::from_fn(|_| PacketSignal::new()),
        }
    }

    /// Creates a medium where every station hears every other station
    pub fn fully_connected() -> Self {
        let medium = Self::new();
        for from in 0..N {
            for to in 0..N {
                if from != to {
                    medium.set_link(from, to, LinkState::Clean);
                }
            }
        }
        medium
    }

    /// Hands out the radio of station `node`
    pub fn radio(&self, node: usize) -> SimulatedRadio<'_, N> {
        SimulatedRadio { medium: self, node }
    }

    pub fn set_link(&self, from: usize, to: usize, state: LinkState) {
        self.stations.lock(|stations| {
            if let Some(station) = stations.borrow_mut().get_mut(from) {
                if to < N {
                    station.links[to] = state;
                }
            }
        });
    }

    /// Sets both directions of a link
    pub fn connect(&self, a: usize, b: usize, state: LinkState) {
        self.set_link(a, b, state);
        self.set_link(b, a, state);
    }

    /// The next `count` channel probes of `node` report a busy channel
    pub fn script_busy(&self, node: usize, count: u32) {
        self.with_station(node, |station| station.busy_answers = count);
    }

    pub fn fail_next_transmit(&self, node: usize, error: RadioDeviceError) {
        self.with_station(node, |station| station.fail_next_transmit = Some(error));
    }

    pub fn receiver_mode(&self, node: usize) -> Option<ReceiverMode> {
        self.with_station(node, |station| station.mode)
    }

    /// Number of frames that reached the hardware buffer of `node`
    pub fn delivered(&self, node: usize) -> u32 {
        self.with_station(node, |station| station.delivered).unwrap_or(0)
    }

    pub fn transmitted(&self, node: usize) -> u32 {
        self.with_station(node, |station| station.transmitted).unwrap_or(0)
    }

    fn with_station<T>(&self, node: usize, f: impl FnOnce(&mut StationState<N>) -> T) -> Option<T> {
        self.stations.lock(|stations| stations.borrow_mut().get_mut(node).map(f))
    }

    fn broadcast(&self, from: usize, data: &[u8]) -> Result<(), RadioDeviceError> {
        self.stations.lock(|stations| {
            let mut stations = stations.borrow_mut();
            let (links, tx_preamble) = {
                let sender = stations.get_mut(from).ok_or(RadioDeviceError::HardwareFault)?;
                if !sender.initialized {
                    return Err(RadioDeviceError::InitializationFailed);
                }
                if let Some(error) = sender.fail_next_transmit.take() {
                    sender.initialized = false;
                    return Err(error);
                }
                sender.transmitted += 1;
                sender.mode = ReceiverMode::Standby;
                (sender.links, sender.tx_preamble)
            };

            for (to, link) in links.iter().enumerate() {
                if to == from || *link == LinkState::Down {
                    continue;
                }
                let receiver = &mut stations[to];
                let listening = matches!(receiver.mode, ReceiverMode::Continuous | ReceiverMode::DutyCycle);
                if !listening || tx_preamble < receiver.rx_preamble {
                    log::trace!("Station {} missed frame from {} (mode {:?})", to, from, receiver.mode);
                    continue;
                }
                let mut buffer = Vec::new();
                let _ = buffer.extend_from_slice(&data[..data.len().min(RADIO_DEVICE_BUFFER_SIZE)]);
                if receiver.buffer.is_some() {
                    log::trace!("Station {} hardware buffer overwritten", to);
                }
                receiver.buffer = Some(HardwareBuffer {
                    data: buffer,
                    crc_ok: *link == LinkState::Clean,
                });
                receiver.delivered += 1;
                self.signals[to].raise();
            }
            Ok(())
        })
    }
}

/// Radio handle of one station on a [`SimulatedMedium`]
pub struct SimulatedRadio<'a, const N: usize> {
    medium: &'a SimulatedMedium<N>,
    node: usize,
}

impl<const N: usize> SimulatedRadio<'_, N> {
    pub fn node(&self) -> usize {
        self.node
    }

    fn station<T>(&self, f: impl FnOnce(&mut StationState<N>) -> T) -> Result<T, RadioDeviceError> {
        self.medium.with_station(self.node, f).ok_or(RadioDeviceError::HardwareFault)
    }

    fn set_mode(&self, mode: ReceiverMode) -> Result<(), RadioDeviceError> {
        self.station(|station| {
            if !station.initialized {
                return Err(RadioDeviceError::InitializationFailed);
            }
            station.mode = mode;
            Ok(())
        })?
    }
}

impl<const N: usize> RadioDriver for SimulatedRadio<'_, N> {
    async fn initialize(&mut self) -> Result<(), RadioDeviceError> {
        log!(Level::Debug, "[{}] Simulated radio initialized", self.node);
        self.station(|station| {
            station.initialized = true;
            station.mode = ReceiverMode::Standby;
            station.buffer = None;
        })
    }

    async fn transmit(&mut self, data: &[u8]) -> Result<(), RadioDeviceError> {
        if data.len() > RADIO_DEVICE_BUFFER_SIZE {
            return Err(RadioDeviceError::TransmissionFailed);
        }
        log::trace!("[{}] Transmitting {} bytes", self.node, data.len());
        self.medium.broadcast(self.node, data)
    }

    async fn read_data(&mut self, buffer: &mut [u8]) -> Result<ReceivedFrame, RadioDeviceError> {
        self.station(|station| {
            if !station.initialized {
                return Err(RadioDeviceError::InitializationFailed);
            }
            let frame = station.buffer.as_ref().ok_or(RadioDeviceError::ReceiveFailed)?;
            let length = frame.data.len();
            if buffer.len() < length {
                return Err(RadioDeviceError::BufferTooSmall);
            }
            buffer[..length].copy_from_slice(&frame.data);
            let crc_ok = frame.crc_ok;
            station.buffer = None;
            Ok(ReceivedFrame { length, crc_ok })
        })?
    }

    async fn channel_busy(&mut self, _detect_only: bool) -> Result<ChannelActivity, RadioDeviceError> {
        self.station(|station| {
            if !station.initialized {
                return Err(RadioDeviceError::CadFailed);
            }
            if station.busy_answers > 0 {
                station.busy_answers -= 1;
                return Ok(ChannelActivity::Busy);
            }
            Ok(ChannelActivity::Free)
        })?
    }

    async fn start_receive(&mut self) -> Result<(), RadioDeviceError> {
        self.set_mode(ReceiverMode::Continuous)
    }

    async fn start_receive_duty_cycle(&mut self) -> Result<(), RadioDeviceError> {
        self.set_mode(ReceiverMode::DutyCycle)
    }

    async fn sleep(&mut self) -> Result<(), RadioDeviceError> {
        self.station(|station| station.mode = ReceiverMode::Sleep)
    }

    fn set_preamble_length(&mut self, direction: PreambleDirection, length: u16) {
        let _ = self.station(|station| match direction {
            PreambleDirection::Transmit => station.tx_preamble = length,
            PreambleDirection::Receive => station.rx_preamble = length,
        });
    }

    fn receive_signal(&mut self) -> &PacketSignal {
        &self.medium.signals[self.node]
    }
}
