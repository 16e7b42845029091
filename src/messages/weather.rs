//! Weather reading tuples
//!
//! A weather frame body (everything after the type byte) is a run of tuples:
//!
//! ```text
//! [stationId:1][uniqueId:1][length:1][reading bytes: length]
//! ```
//!
//! The first tuple is the reading of the originating station (its id and unique
//! id double as the message header). Tuples after it were aggregated by relaying
//! stations. Reading bytes are opaque to the mesh and are copied, never parsed.

/// Bytes in front of the reading in every tuple
pub const TUPLE_OVERHEAD: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeatherTuple<'a> {
    pub station_id: u8,
    pub unique_id: u8,
    pub reading: &'a [u8],
}

impl WeatherTuple<'_> {
    pub fn encoded_len(&self) -> usize {
        TUPLE_OVERHEAD + self.reading.len()
    }
}

/// Iterator over the tuples of a weather frame body
///
/// Stops at the first tuple whose declared length runs past the end of the body.
#[cfg_attr(feature = "std", derive(Debug))]
pub struct WeatherTupleIterator<'a> {
    body: &'a [u8],
    position: usize,
}

impl<'a> WeatherTupleIterator<'a> {
    /// `body` starts right after the type byte
    pub fn new(body: &'a [u8]) -> Self {
        WeatherTupleIterator { body, position: 0 }
    }

    /// Whether iteration stopped on a malformed tuple instead of the end of the body
    pub fn truncated(&self) -> bool {
        self.position < self.body.len()
    }
}

impl<'a> Iterator for WeatherTupleIterator<'a> {
    type Item = WeatherTuple<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position + TUPLE_OVERHEAD > self.body.len() {
            return None;
        }
        let station_id = self.body[self.position];
        let unique_id = self.body[self.position + 1];
        let length = self.body[self.position + 2] as usize;
        let start = self.position + TUPLE_OVERHEAD;
        if start + length > self.body.len() {
            return None;
        }
        self.position = start + length;
        Some(WeatherTuple {
            station_id,
            unique_id,
            reading: &self.body[start..start + length],
        })
    }
}
