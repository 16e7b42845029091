//! Exponential moving averages for channel health telemetry

use embassy_time::Duration;

/// Averaging period in samples
pub const AVERAGING_PERIOD: u32 = 256;

/// Rates are expressed in hundredths of a percent
pub const RATE_FULL_SCALE: u32 = 10_000;

/// Fixed-point exponential moving average over [`AVERAGING_PERIOD`] samples
///
/// The accumulator holds `average * AVERAGING_PERIOD`; every sample moves it by
/// `sample - accumulator / AVERAGING_PERIOD`. Starting from zero, one sample of
/// value `s` therefore raises the reported average by `s / AVERAGING_PERIOD`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MovingAverage {
    accumulator: u32,
}

impl MovingAverage {
    pub const fn new() -> Self {
        MovingAverage { accumulator: 0 }
    }

    pub fn record(&mut self, sample: u32) {
        self.accumulator = self.accumulator - self.accumulator / AVERAGING_PERIOD + sample.min(u32::MAX / AVERAGING_PERIOD);
    }

    pub fn value(&self) -> u32 {
        self.accumulator / AVERAGING_PERIOD
    }

    pub fn accumulator(&self) -> u32 {
        self.accumulator
    }
}

/// Channel health counters kept by the channel access controller
#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelStatistics {
    crc_errors: MovingAverage,
    dropped_packets: MovingAverage,
    access_delay: MovingAverage,
}

impl ChannelStatistics {
    pub const fn new() -> Self {
        ChannelStatistics {
            crc_errors: MovingAverage::new(),
            dropped_packets: MovingAverage::new(),
            access_delay: MovingAverage::new(),
        }
    }

    pub fn record_crc(&mut self, crc_ok: bool) {
        self.crc_errors.record(if crc_ok { 0 } else { RATE_FULL_SCALE });
    }

    /// Frames the hardware announced but software never got to read
    pub fn record_lost(&mut self, count: u16) {
        for _ in 0..count {
            self.dropped_packets.record(RATE_FULL_SCALE);
        }
    }

    pub fn record_received(&mut self) {
        self.dropped_packets.record(0);
    }

    pub fn record_access_delay(&mut self, elapsed: Duration) {
        self.access_delay.record(elapsed.as_millis().min(u32::MAX as u64) as u32);
    }

    pub fn access_delay(&self) -> &MovingAverage {
        &self.access_delay
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            crc_error_rate: clamp_u16(self.crc_errors.value()),
            dropped_packet_rate: clamp_u16(self.dropped_packets.value()),
            access_delay_ms: clamp_u16(self.access_delay.value()),
        }
    }
}

fn clamp_u16(value: u32) -> u16 {
    value.min(u16::MAX as u32) as u16
}

/// Statistics triple exposed to status telemetry and the query command
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    /// Hundredths of a percent
    pub crc_error_rate: u16,
    /// Hundredths of a percent
    pub dropped_packet_rate: u16,
    pub access_delay_ms: u16,
}

impl StatisticsSnapshot {
    pub const ENCODED_SIZE: usize = 6;

    /// Little-endian wire form: crc rate, drop rate, delay
    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut out = [0u8; Self::ENCODED_SIZE];
        out[0..2].copy_from_slice(&self.crc_error_rate.to_le_bytes());
        out[2..4].copy_from_slice(&self.dropped_packet_rate.to_le_bytes());
        out[4..6].copy_from_slice(&self.access_delay_ms.to_le_bytes());
        out
    }
}
