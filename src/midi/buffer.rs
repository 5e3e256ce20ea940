// src/midi/buffer.rs
// Per-cycle MIDI event buffer exchanged with the driver

use crate::config::MidiConfig;

/// Events of one process cycle, stored back to back in a byte arena.
/// Used both as the input a channel records from and as the output it
/// plays into. Capacity is reserved up front so that pushing on the
/// processing thread does not allocate in the common case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MidiBuffer {
    n_frames: u32,
    bytes: Vec<u8>,
    events: Vec<(u32, usize, usize)>, // (time, offset, len)
}

impl MidiBuffer {
    pub fn new(n_frames: u32) -> Self {
        Self::with_capacity(n_frames, 64)
    }

    pub fn with_capacity(n_frames: u32, max_events: usize) -> Self {
        Self {
            n_frames,
            bytes: Vec::with_capacity(max_events * 3),
            events: Vec::with_capacity(max_events),
        }
    }

    pub fn from_config(n_frames: u32, config: &MidiConfig) -> Self {
        Self::with_capacity(n_frames, config.buffer_events)
    }

    /// Frames covered by this buffer.
    pub fn n_frames(&self) -> u32 {
        self.n_frames
    }

    /// Reuse the buffer for a new cycle, keeping the allocation.
    pub fn reset(&mut self, n_frames: u32) {
        self.n_frames = n_frames;
        self.bytes.clear();
        self.events.clear();
    }

    /// Append an event. Events are expected in non-decreasing time order.
    pub fn push(&mut self, time: u32, data: &[u8]) {
        let offset = self.bytes.len();
        self.bytes.extend_from_slice(data);
        self.events.push((time, offset, data.len()));
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<(u32, &[u8])> {
        let &(time, offset, len) = self.events.get(idx)?;
        Some((time, &self.bytes[offset..offset + len]))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        self.events
            .iter()
            .map(|&(time, offset, len)| (time, &self.bytes[offset..offset + len]))
    }

    /// Owned copy of all events, mostly useful in tests.
    pub fn to_vec(&self) -> Vec<(u32, Vec<u8>)> {
        self.iter().map(|(t, d)| (t, d.to_vec())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_get() {
        let mut buf = MidiBuffer::new(128);
        buf.push(3, &[0x90, 60, 100]);
        buf.push(10, &[0xC0, 7]);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.get(1), Some((10, &[0xC0u8, 7][..])));
        assert_eq!(buf.get(2), None);
    }

    #[test]
    fn test_from_config_reserves_events() {
        let config = MidiConfig {
            buffer_events: 32,
            ..MidiConfig::default()
        };
        let buf = MidiBuffer::from_config(16, &config);
        assert_eq!(buf.n_frames(), 16);
        assert!(buf.events.capacity() >= 32);
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut buf = MidiBuffer::with_capacity(64, 8);
        buf.push(0, &[0x90, 60, 100]);
        buf.reset(32);
        assert!(buf.is_empty());
        assert_eq!(buf.n_frames(), 32);
        assert!(buf.events.capacity() >= 8);
    }
}
