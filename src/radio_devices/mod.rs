//! Radio devices
//!
//! This module defines the contract between the channel access controller and the
//! physical-layer driver, plus the driver implementations shipped with the crate:
//!
//! - `echo`: loopback device that hears its own transmissions
//! - `simulator`: shared-medium simulator for multi-station scenarios
//!
//! Hardware drivers live outside this crate and implement [`RadioDriver`].
//!
//! ## Interrupt model
//!
//! A driver signals "packet ready" through a [`PacketSignal`]: a waiting flag plus a
//! wrapping packet counter. Both are written from interrupt context and read by the
//! controller inside a critical section, so the masked window is a handful of
//! instructions.

use core::cell::Cell;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

#[cfg(feature = "radio-device-echo")]
pub mod echo;

#[cfg(feature = "radio-device-simulator")]
pub mod simulator;

#[cfg(feature = "radio-device-echo")]
pub use echo::EchoRadio;

#[cfg(feature = "radio-device-simulator")]
pub use simulator::{SimulatedMedium, SimulatedRadio};

/// Radio device operation errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RadioDeviceError {
    /// Device was not initialized before attempting an operation
    InitializationFailed,
    /// Failed to transmit a frame
    TransmissionFailed,
    /// Failed to read a received frame out of the device
    ReceiveFailed,
    /// Channel activity detection failed
    CadFailed,
    /// The received frame does not fit into the supplied buffer. The frame stays
    /// in the device buffer and can be read again later.
    BufferTooSmall,
    /// The device reported a hardware level fault
    HardwareFault,
}

#[cfg(feature = "std")]
impl core::fmt::Display for RadioDeviceError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RadioDeviceError::InitializationFailed => write!(f, "radio device is not initialized"),
            RadioDeviceError::TransmissionFailed => write!(f, "radio transmission failed"),
            RadioDeviceError::ReceiveFailed => write!(f, "reading the received frame failed"),
            RadioDeviceError::CadFailed => write!(f, "channel activity detection failed"),
            RadioDeviceError::BufferTooSmall => write!(f, "received frame does not fit the buffer"),
            RadioDeviceError::HardwareFault => write!(f, "radio hardware fault"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RadioDeviceError {}

/// Result of a channel-busy probe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelActivity {
    /// No carrier or preamble detected
    Free,
    /// Another station is transmitting
    Busy,
}

/// Which side of the radio a preamble length applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreambleDirection {
    /// Length of the preamble sent in front of outgoing frames
    Transmit,
    /// Minimum preamble the receiver must detect before it syncs
    Receive,
}

/// Receiver state of the bundled devices, exposed for inspection in tests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverMode {
    /// Powered, not listening (after initialize and after each transmit)
    Standby,
    Continuous,
    DutyCycle,
    Sleep,
}

/// Metadata of a frame copied out of the device buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceivedFrame {
    /// Number of bytes written into the caller's buffer
    pub length: usize,
    /// Whether the physical layer CRC matched
    pub crc_ok: bool,
}

#[derive(Clone, Copy, Default)]
struct SignalState {
    waiting: bool,
    counter: u16,
}

/// Packet-ready flag and packet counter shared with the radio interrupt
///
/// `raise` is the only operation performed from interrupt context. The counter
/// only ever increments (wrapping), so a reader comparing two snapshots learns how
/// many frames arrived in between, including the ones overwritten in the
/// single-frame hardware buffer before software could read them.
pub struct PacketSignal {
    state: Mutex<CriticalSectionRawMutex, Cell<SignalState>>,
}

impl Default for PacketSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSignal {
    pub const fn new() -> Self {
        PacketSignal {
            state: Mutex::new(Cell::new(SignalState { waiting: false, counter: 0 })),
        }
    }

    /// Marks a frame as waiting in the device buffer (interrupt context)
    pub fn raise(&self) {
        self.state.lock(|cell| {
            let mut state = cell.get();
            state.waiting = true;
            state.counter = state.counter.wrapping_add(1);
            cell.set(state);
        });
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock(|cell| cell.get().waiting)
    }

    /// Clears the waiting flag and returns the packet counter at that moment
    ///
    /// Returns `None` when no frame was waiting.
    pub fn take(&self) -> Option<u16> {
        self.state.lock(|cell| {
            let mut state = cell.get();
            if !state.waiting {
                return None;
            }
            state.waiting = false;
            cell.set(state);
            Some(state.counter)
        })
    }

    pub fn counter(&self) -> u16 {
        self.state.lock(|cell| cell.get().counter)
    }
}

/// Physical-layer driver interface
///
/// The channel access controller is the only owner of a `RadioDriver`; nothing
/// above it talks to the device. Every operation returns a status the caller must
/// check. A `TransmissionFailed` or `HardwareFault` is taken as a wedged radio and
/// answered with a full [`RadioDriver::initialize`] by the station loop.
///
/// # Examples
/// ```rust,ignore
/// use weather_mesh_radio::radio_devices::{ChannelActivity, RadioDriver, RadioDeviceError};
///
/// async fn send_when_clear<R: RadioDriver>(radio: &mut R, frame: &[u8]) -> Result<(), RadioDeviceError> {
///     while radio.channel_busy(true).await? == ChannelActivity::Busy {}
///     radio.transmit(frame).await
/// }
/// ```
pub trait RadioDriver {
    /// Brings the device from any state (including wedged) into standby
    async fn initialize(&mut self) -> Result<(), RadioDeviceError>;

    /// Sends one frame; returns once the frame left the antenna
    async fn transmit(&mut self, data: &[u8]) -> Result<(), RadioDeviceError>;

    /// Copies the frame waiting in the device buffer into `buffer`
    ///
    /// Must leave the frame in place and return `BufferTooSmall` when it does not
    /// fit, so a later call with more room can still fetch it.
    async fn read_data(&mut self, buffer: &mut [u8]) -> Result<ReceivedFrame, RadioDeviceError>;

    /// Probes the channel. `detect_only` asks for a carrier/preamble check without
    /// disturbing a receive in progress.
    async fn channel_busy(&mut self, detect_only: bool) -> Result<ChannelActivity, RadioDeviceError>;

    /// Continuous receive mode
    async fn start_receive(&mut self) -> Result<(), RadioDeviceError>;

    /// Duty-cycled receive mode: the receiver wakes periodically and stays up only
    /// when it catches a preamble
    async fn start_receive_duty_cycle(&mut self) -> Result<(), RadioDeviceError>;

    /// Lowest-power state; the receiver is off
    async fn sleep(&mut self) -> Result<(), RadioDeviceError>;

    fn set_preamble_length(&mut self, direction: PreambleDirection, length: u16);

    /// Services pending interrupt sources and returns the packet signal
    fn receive_signal(&mut self) -> &PacketSignal;
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn packet_signal_take_clears_waiting_flag() {
        let signal = PacketSignal::new();
        assert_eq!(signal.take(), None);
        signal.raise();
        assert!(signal.is_pending());
        assert_eq!(signal.take(), Some(1));
        assert!(!signal.is_pending());
        assert_eq!(signal.take(), None);
    }

    #[test]
    fn packet_signal_counter_reports_overwritten_frames() {
        let signal = PacketSignal::new();
        signal.raise();
        signal.raise();
        signal.raise();
        // Only one take for three interrupts: the counter exposes the gap
        assert_eq!(signal.take(), Some(3));
    }

    #[test]
    fn packet_signal_counter_wraps() {
        let signal = PacketSignal::new();
        for _ in 0..u16::MAX as u32 + 2 {
            signal.raise();
        }
        assert_eq!(signal.counter(), 1);
    }

    #[test]
    fn radio_device_error_display() {
        assert_eq!(format!("{}", RadioDeviceError::CadFailed), "channel activity detection failed");
        let _: &dyn std::error::Error = &RadioDeviceError::HardwareFault;
    }
}
