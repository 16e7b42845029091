//! Bounded receive queue in front of the single-frame radio buffer
//!
//! Frames are stored back to back in a byte arena. `SLOTS` bounds the number of
//! queued frames, `ARENA` the bytes they may occupy together. The queue only ever
//! appends until it is drained completely, at which point every cursor returns to
//! zero, so a frame is always one contiguous slice.

use log::{Level, log};

pub struct ReceiveQueue<const SLOTS: usize, const ARENA: usize> {
    arena: [u8; ARENA],
    starts: [usize; SLOTS],
    lengths: [usize; SLOTS],
    read: usize,
    write: usize,
    write_offset: usize,
}

impl<const SLOTS: usize, const ARENA: usize> Default for ReceiveQueue<SLOTS, ARENA> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SLOTS: usize, const ARENA: usize> ReceiveQueue<SLOTS, ARENA> {
    pub const fn new() -> Self {
        ReceiveQueue {
            arena: [0; ARENA],
            starts: [0; SLOTS],
            lengths: [0; SLOTS],
            read: 0,
            write: 0,
            write_offset: 0,
        }
    }

    /// Free arena bytes, or `None` when no slot or no byte is left
    ///
    /// The caller fills a prefix of the returned slice and then calls
    /// [`ReceiveQueue::commit`] with the number of bytes written.
    pub fn writable(&mut self) -> Option<&mut [u8]> {
        if self.write >= SLOTS || self.write_offset >= ARENA {
            return None;
        }
        Some(&mut self.arena[self.write_offset..])
    }

    /// Publishes the frame written into the slice from [`ReceiveQueue::writable`]
    pub fn commit(&mut self, length: usize) -> bool {
        if self.write >= SLOTS || self.write_offset + length > ARENA {
            return false;
        }
        self.starts[self.write] = self.write_offset;
        self.lengths[self.write] = length;
        self.write += 1;
        self.write_offset += length;
        true
    }

    /// Hands out the oldest frame without copying it
    pub fn dequeue(&mut self) -> Option<&[u8]> {
        if self.read > self.write {
            log!(Level::Error, "Receive queue read cursor {} overtook write cursor {}", self.read, self.write);
            return None;
        }
        if self.read == self.write {
            self.reset();
            return None;
        }
        let index = self.read;
        self.read += 1;
        let start = self.starts[index];
        let end = start + self.lengths[index];
        if self.read == self.write {
            // Drained: the handed out slice stays valid until the next mutable call
            self.read = 0;
            self.write = 0;
            self.write_offset = 0;
        }
        Some(&self.arena[start..end])
    }

    pub fn len(&self) -> usize {
        self.write.saturating_sub(self.read)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cursors(&self) -> (usize, usize) {
        (self.read, self.write)
    }

    pub fn free_bytes(&self) -> usize {
        ARENA - self.write_offset
    }

    fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
        self.write_offset = 0;
    }
}
