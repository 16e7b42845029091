//! Weather relay aggregation buffer
//!
//! Readings waiting for relay are collected here as encoded tuples and ride along
//! with the station's next own weather message, saving a frame per reading.

use crate::messages::WeatherTuple;
use heapless::Vec;

pub struct WeatherRelayBuffer<const CAP: usize> {
    buffer: Vec<u8, CAP>,
    tuples: usize,
}

impl<const CAP: usize> Default for WeatherRelayBuffer<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAP: usize> WeatherRelayBuffer<CAP> {
    pub const fn new() -> Self {
        WeatherRelayBuffer { buffer: Vec::new(), tuples: 0 }
    }

    pub fn fits(&self, tuple: &WeatherTuple<'_>) -> bool {
        self.buffer.len() + tuple.encoded_len() <= CAP
    }

    /// Appends the tuple when it fits; the buffer is untouched otherwise
    pub fn push(&mut self, tuple: &WeatherTuple<'_>) -> bool {
        if !self.fits(tuple) || tuple.reading.len() > u8::MAX as usize {
            return false;
        }
        let header = [tuple.station_id, tuple.unique_id, tuple.reading.len() as u8];
        // Both cannot fail after the capacity check
        let _ = self.buffer.extend_from_slice(&header);
        let _ = self.buffer.extend_from_slice(tuple.reading);
        self.tuples += 1;
        true
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.tuples = 0;
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn tuple_count(&self) -> usize {
        self.tuples
    }

    pub const fn capacity(&self) -> usize {
        CAP
    }
}
