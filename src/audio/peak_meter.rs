// src/audio/peak_meter.rs
// Lock-free output peak tracking for audio channels

use std::sync::atomic::{AtomicU32, Ordering};

/// Running absolute peak, written by the processing thread and read or
/// reset from anywhere.
#[derive(Debug)]
pub struct PeakMeter {
    peak_level: AtomicU32, // f32 bits
}

impl PeakMeter {
    pub fn new() -> Self {
        Self {
            peak_level: AtomicU32::new(0),
        }
    }

    /// Raise the peak to `level` if it is higher (call from audio thread).
    pub fn update(&self, level: f32) {
        let level = level.abs();
        if level.is_nan() {
            return;
        }
        // Non-negative floats order the same as their bit patterns.
        self.peak_level.fetch_max(level.to_bits(), Ordering::Relaxed);
    }

    /// Current peak (0.0 - 1.0+)
    pub fn get_peak(&self) -> f32 {
        f32::from_bits(self.peak_level.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.peak_level.store(0, Ordering::Relaxed);
    }
}

impl Default for PeakMeter {
    fn default() -> Self {
        Self::new()
    }
}
