//! Bounded histories used for deduplication and station visibility
//!
//! - [`HistoryRing`]: FIFO overwrite, backs the recently-relayed and
//!   recently-handled-command caches
//! - [`RecentlySeenStations`]: least-recently-seen eviction by linear scan

use crate::messages::MessageType;
use embassy_time::{Duration, Instant};

/// Fixed-capacity history that overwrites its oldest entry
pub struct HistoryRing<T: Copy + PartialEq, const N: usize> {
    entries: [Option<T>; N],
    next: usize,
}

impl<T: Copy + PartialEq, const N: usize> Default for HistoryRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + PartialEq, const N: usize> HistoryRing<T, N> {
    pub const fn new() -> Self {
        HistoryRing { entries: [None; N], next: 0 }
    }

    pub fn record(&mut self, value: T) {
        if N == 0 {
            return;
        }
        self.entries[self.next] = Some(value);
        self.next = (self.next + 1) % N;
    }

    pub fn contains(&self, value: &T) -> bool {
        self.entries.iter().flatten().any(|entry| entry == value)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identity of a relayed message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayedMessage {
    pub message_type: MessageType,
    pub station_id: u8,
    pub unique_id: u8,
}

pub type RecentlyRelayed<const N: usize> = HistoryRing<RelayedMessage, N>;

/// Unique ids of commands already executed
///
/// Unique id 0 marks a command that is applied on every reception: it is
/// never recorded and never reported as seen.
pub struct RecentlyHandledCommands<const N: usize> {
    ring: HistoryRing<u8, N>,
}

impl<const N: usize> Default for RecentlyHandledCommands<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RecentlyHandledCommands<N> {
    pub const fn new() -> Self {
        RecentlyHandledCommands { ring: HistoryRing::new() }
    }

    pub fn record(&mut self, unique_id: u8) {
        if unique_id != 0 {
            self.ring.record(unique_id);
        }
    }

    pub fn contains(&self, unique_id: u8) -> bool {
        unique_id != 0 && self.ring.contains(&unique_id)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeenStation {
    pub station_id: u8,
    pub last_seen: Instant,
}

/// Stations heard recently, evicting the one heard least recently when full
pub struct RecentlySeenStations<const N: usize> {
    entries: [Option<SeenStation>; N],
}

impl<const N: usize> Default for RecentlySeenStations<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RecentlySeenStations<N> {
    pub const fn new() -> Self {
        RecentlySeenStations { entries: [None; N] }
    }

    pub fn observe(&mut self, station_id: u8, now: Instant) {
        if let Some(entry) = self.entries.iter_mut().flatten().find(|entry| entry.station_id == station_id) {
            entry.last_seen = now;
            return;
        }
        let seen = SeenStation { station_id, last_seen: now };
        if let Some(slot) = self.entries.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(seen);
            return;
        }

        let mut stalest = 0;
        let mut stalest_age = Duration::from_ticks(0);
        for (index, entry) in self.entries.iter().enumerate() {
            if let Some(entry) = entry {
                let age = now.saturating_duration_since(entry.last_seen);
                if age > stalest_age {
                    stalest_age = age;
                    stalest = index;
                }
            }
        }
        if let Some(slot) = self.entries.get_mut(stalest) {
            log::trace!("Evicting station {:?} from recently seen", slot.map(|entry| entry.station_id));
            *slot = Some(seen);
        }
    }

    pub fn contains(&self, station_id: u8) -> bool {
        self.iter().any(|entry| entry.station_id == station_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SeenStation> {
        self.entries.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    fn at(seconds: u64) -> Instant {
        Instant::from_secs(seconds)
    }

    #[test]
    fn ring_overwrites_oldest() {
        let mut ring = HistoryRing::<u8, 3>::new();
        for value in 1..=4 {
            ring.record(value);
        }
        assert!(!ring.contains(&1));
        assert!(ring.contains(&2) && ring.contains(&3) && ring.contains(&4));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn relayed_messages_match_on_all_fields() {
        let mut relayed = RecentlyRelayed::<4>::new();
        let message = RelayedMessage {
            message_type: MessageType::Ping,
            station_id: 3,
            unique_id: 9,
        };
        relayed.record(message);
        assert!(relayed.contains(&message));
        assert!(!relayed.contains(&RelayedMessage {
            message_type: MessageType::Status,
            ..message
        }));
        assert!(!relayed.contains(&RelayedMessage { unique_id: 10, ..message }));
    }

    #[test]
    fn unique_id_zero_is_never_recorded() {
        let mut handled = RecentlyHandledCommands::<4>::new();
        handled.record(0);
        handled.record(0);
        assert!(handled.is_empty());
        assert!(!handled.contains(0));
        handled.record(5);
        assert!(handled.contains(5));
    }

    #[test]
    fn seen_station_is_refreshed_not_duplicated() {
        let mut seen = RecentlySeenStations::<3>::new();
        seen.observe(4, at(1));
        seen.observe(4, at(5));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen.iter().next().map(|entry| entry.last_seen), Some(at(5)));
    }

    #[test]
    fn full_cache_evicts_largest_staleness() {
        let mut seen = RecentlySeenStations::<4>::new();
        seen.observe(10, at(30));
        seen.observe(11, at(10));
        seen.observe(12, at(40));
        seen.observe(13, at(20));
        // Refresh 11 so 13 becomes the stalest even though 10 was inserted first
        seen.observe(11, at(50));
        seen.observe(14, at(60));
        assert!(!seen.contains(13));
        for station in [10, 11, 12, 14] {
            assert!(seen.contains(station), "station {} missing", station);
        }

        seen.observe(15, at(61));
        assert!(!seen.contains(10));
    }
}
