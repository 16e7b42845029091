//! # Echo Radio - Loopback Device for Testing
//!
//! Minimal [`RadioDriver`] that hears its own transmissions. Every transmitted
//! frame is latched into the single-frame receive buffer and the packet signal is
//! raised, exactly as a real transceiver would do when a peer sent the frame.
//!
//! Besides the loopback the device carries a few hooks that let tests and
//! bring-up code drive the channel access controller through otherwise hard to
//! reach paths:
//!
//! - `inject`: place a frame (optionally with a bad CRC) into the receive buffer
//! - `script_busy`: answer the next N channel probes with `Busy`
//! - `fail_next`: make the next transmit fail like a wedged transceiver
//!
//! The device never needs hardware, has no timing of its own and is single-node
//! only: relay logic needs the simulator.

use super::{ChannelActivity, PacketSignal, PreambleDirection, RadioDeviceError, RadioDriver, ReceivedFrame, ReceiverMode};
use crate::RADIO_DEVICE_BUFFER_SIZE;
use heapless::Vec;
use log::{Level, log};

/// Loopback radio device
pub struct EchoRadio {
    signal: PacketSignal,
    buffer: Vec<u8, RADIO_DEVICE_BUFFER_SIZE>,
    crc_ok: bool,
    initialized: bool,
    mode: ReceiverMode,
    tx_preamble: u16,
    rx_preamble: u16,
    busy_answers: u32,
    probes: u32,
    transmissions: u32,
    fail_next_transmit: Option<RadioDeviceError>,
    last_transmitted: Vec<u8, RADIO_DEVICE_BUFFER_SIZE>,
    last_preamble: u16,
}

impl Default for EchoRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoRadio {
    pub const fn new() -> Self {
        EchoRadio {
            signal: PacketSignal::new(),
            buffer: Vec::new(),
            crc_ok: true,
            initialized: false,
            mode: ReceiverMode::Standby,
            tx_preamble: 0,
            rx_preamble: 0,
            busy_answers: 0,
            probes: 0,
            transmissions: 0,
            fail_next_transmit: None,
            last_transmitted: Vec::new(),
            last_preamble: 0,
        }
    }

    /// Places a frame into the receive buffer as if it arrived over the air
    ///
    /// An unread frame is overwritten, the packet counter still advances.
    pub fn inject(&mut self, frame: &[u8], crc_ok: bool) {
        self.buffer.clear();
        let len = frame.len().min(RADIO_DEVICE_BUFFER_SIZE);
        // Cannot fail: the length is clamped to the capacity
        let _ = self.buffer.extend_from_slice(&frame[..len]);
        self.crc_ok = crc_ok;
        self.signal.raise();
    }

    /// The next `count` channel probes report a busy channel
    pub fn script_busy(&mut self, count: u32) {
        self.busy_answers = count;
    }

    /// The next transmit fails with `error`
    pub fn fail_next(&mut self, error: RadioDeviceError) {
        self.fail_next_transmit = Some(error);
    }

    pub fn probes(&self) -> u32 {
        self.probes
    }

    pub fn transmissions(&self) -> u32 {
        self.transmissions
    }

    pub fn last_transmitted(&self) -> &[u8] {
        &self.last_transmitted
    }

    /// Transmit preamble used for the most recent frame
    pub fn last_preamble(&self) -> u16 {
        self.last_preamble
    }

    pub fn mode(&self) -> ReceiverMode {
        self.mode
    }

    pub fn receive_preamble(&self) -> u16 {
        self.rx_preamble
    }
}

impl RadioDriver for EchoRadio {
    async fn initialize(&mut self) -> Result<(), RadioDeviceError> {
        log!(Level::Debug, "Echo radio initialized");
        self.initialized = true;
        self.mode = ReceiverMode::Standby;
        self.buffer.clear();
        Ok(())
    }

    async fn transmit(&mut self, data: &[u8]) -> Result<(), RadioDeviceError> {
        if !self.initialized {
            return Err(RadioDeviceError::InitializationFailed);
        }
        if let Some(error) = self.fail_next_transmit.take() {
            self.initialized = false;
            return Err(error);
        }
        if data.len() > RADIO_DEVICE_BUFFER_SIZE {
            return Err(RadioDeviceError::TransmissionFailed);
        }
        self.transmissions += 1;
        self.last_transmitted.clear();
        let _ = self.last_transmitted.extend_from_slice(data);
        self.last_preamble = self.tx_preamble;
        self.mode = ReceiverMode::Standby;
        log::trace!("Echoing frame of {} bytes", data.len());
        self.inject(data, true);
        Ok(())
    }

    async fn read_data(&mut self, buffer: &mut [u8]) -> Result<ReceivedFrame, RadioDeviceError> {
        if !self.initialized {
            return Err(RadioDeviceError::InitializationFailed);
        }
        let length = self.buffer.len();
        if buffer.len() < length {
            return Err(RadioDeviceError::BufferTooSmall);
        }
        buffer[..length].copy_from_slice(&self.buffer);
        Ok(ReceivedFrame { length, crc_ok: self.crc_ok })
    }

    async fn channel_busy(&mut self, _detect_only: bool) -> Result<ChannelActivity, RadioDeviceError> {
        if !self.initialized {
            return Err(RadioDeviceError::CadFailed);
        }
        self.probes += 1;
        if self.busy_answers > 0 {
            self.busy_answers -= 1;
            return Ok(ChannelActivity::Busy);
        }
        Ok(ChannelActivity::Free)
    }

    async fn start_receive(&mut self) -> Result<(), RadioDeviceError> {
        if !self.initialized {
            return Err(RadioDeviceError::InitializationFailed);
        }
        self.mode = ReceiverMode::Continuous;
        Ok(())
    }

    async fn start_receive_duty_cycle(&mut self) -> Result<(), RadioDeviceError> {
        if !self.initialized {
            return Err(RadioDeviceError::InitializationFailed);
        }
        self.mode = ReceiverMode::DutyCycle;
        Ok(())
    }

    async fn sleep(&mut self) -> Result<(), RadioDeviceError> {
        self.mode = ReceiverMode::Sleep;
        Ok(())
    }

    fn set_preamble_length(&mut self, direction: PreambleDirection, length: u16) {
        match direction {
            PreambleDirection::Transmit => self.tx_preamble = length,
            PreambleDirection::Receive => self.rx_preamble = length,
        }
    }

    fn receive_signal(&mut self) -> &PacketSignal {
        &self.signal
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn transmitted_frame_is_heard_back() {
        let mut radio = EchoRadio::new();
        block_on(async {
            radio.initialize().await.unwrap();
            radio.set_preamble_length(PreambleDirection::Transmit, 512);
            radio.transmit(&[1, 2, 3]).await.unwrap();
            assert!(radio.receive_signal().is_pending());
            let mut buffer = [0u8; 8];
            let frame = radio.read_data(&mut buffer).await.unwrap();
            assert_eq!(frame, ReceivedFrame { length: 3, crc_ok: true });
            assert_eq!(&buffer[..3], &[1, 2, 3]);
        });
        assert_eq!(radio.last_preamble(), 512);
    }

    #[test]
    fn read_into_short_buffer_keeps_frame() {
        let mut radio = EchoRadio::new();
        block_on(async {
            radio.initialize().await.unwrap();
            radio.inject(&[9; 10], true);
            let mut small = [0u8; 4];
            assert_eq!(radio.read_data(&mut small).await, Err(RadioDeviceError::BufferTooSmall));
            let mut large = [0u8; 16];
            assert_eq!(radio.read_data(&mut large).await.unwrap().length, 10);
        });
    }

    #[test]
    fn scripted_busy_answers_run_out() {
        let mut radio = EchoRadio::new();
        block_on(async {
            radio.initialize().await.unwrap();
            radio.script_busy(2);
            assert_eq!(radio.channel_busy(true).await, Ok(ChannelActivity::Busy));
            assert_eq!(radio.channel_busy(true).await, Ok(ChannelActivity::Busy));
            assert_eq!(radio.channel_busy(true).await, Ok(ChannelActivity::Free));
        });
        assert_eq!(radio.probes(), 3);
    }

    #[test]
    fn failed_transmit_requires_initialize() {
        let mut radio = EchoRadio::new();
        block_on(async {
            radio.initialize().await.unwrap();
            radio.fail_next(RadioDeviceError::HardwareFault);
            assert_eq!(radio.transmit(&[1]).await, Err(RadioDeviceError::HardwareFault));
            assert_eq!(radio.transmit(&[1]).await, Err(RadioDeviceError::InitializationFailed));
            radio.initialize().await.unwrap();
            assert_eq!(radio.transmit(&[1]).await, Ok(()));
        });
    }
}
