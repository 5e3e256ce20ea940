// src/looper/channel.rs
// Contract between a loop and the channels it drives

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU8, AtomicU32, Ordering};

use super::{ChannelMode, LoopMode};
use crate::audio::AudioChannel;
use crate::error::Result;
use crate::midi::MidiChannel;

/// The first planned transition of a loop, as seen by its channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextMode {
    pub mode: LoopMode,
    /// Triggers to wait before the transition applies.
    pub delay: u32,
    /// Samples until the next trigger, when known. Only provided for
    /// `delay == 0`.
    pub eta: Option<u32>,
}

/// Everything a channel needs to process one (sub-)cycle of its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessCycle {
    pub mode: LoopMode,
    pub next: Option<NextMode>,
    pub n_samples: u32,
    pub pos_before: u32,
    pub pos_after: u32,
    pub length_before: u32,
    pub length_after: u32,
}

/// Scalars of a channel that any thread may read or write without going
/// through the command queue.
#[derive(Debug)]
pub struct ChannelShared {
    mode: AtomicU8,
    start_offset: AtomicI32,
    pre_play_samples: AtomicU32,
    data_seq_nr: AtomicU32,
    length: AtomicU32,
    played_back_sample: AtomicI64, // -1: none
}

impl ChannelShared {
    pub fn new(mode: ChannelMode) -> Self {
        Self {
            mode: AtomicU8::new(mode as u8),
            start_offset: AtomicI32::new(0),
            pre_play_samples: AtomicU32::new(0),
            data_seq_nr: AtomicU32::new(0),
            length: AtomicU32::new(0),
            played_back_sample: AtomicI64::new(-1),
        }
    }

    pub fn mode(&self) -> ChannelMode {
        ChannelMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    pub fn set_mode(&self, mode: ChannelMode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    pub fn start_offset(&self) -> i32 {
        self.start_offset.load(Ordering::Relaxed)
    }

    pub fn set_start_offset(&self, offset: i32) {
        self.start_offset.store(offset, Ordering::Relaxed);
    }

    pub fn pre_play_samples(&self) -> u32 {
        self.pre_play_samples.load(Ordering::Relaxed)
    }

    pub fn set_pre_play_samples(&self, samples: u32) {
        self.pre_play_samples.store(samples, Ordering::Relaxed);
    }

    pub fn data_seq_nr(&self) -> u32 {
        self.data_seq_nr.load(Ordering::Acquire)
    }

    /// Mark the channel content as changed.
    pub fn bump_data_seq_nr(&self) {
        self.data_seq_nr.fetch_add(1, Ordering::AcqRel);
    }

    pub fn length(&self) -> u32 {
        self.length.load(Ordering::Relaxed)
    }

    pub(crate) fn set_length(&self, length: u32) {
        self.length.store(length, Ordering::Relaxed);
    }

    /// Channel position played back in the last cycle, if any.
    pub fn played_back_sample(&self) -> Option<u32> {
        u32::try_from(self.played_back_sample.load(Ordering::Relaxed)).ok()
    }

    pub(crate) fn set_played_back_sample(&self, sample: Option<i64>) {
        let value = sample.filter(|&s| s >= 0).unwrap_or(-1);
        self.played_back_sample.store(value, Ordering::Relaxed);
    }
}

/// Operations every channel kind offers its loop. Methods prefixed with
/// `proc_` run on the processing thread only.
pub trait LoopChannel {
    /// Drain queued commands, then record, play back, replace or
    /// pre-record exactly `cycle.n_samples` samples.
    fn proc_process(&mut self, cycle: &ProcessCycle) -> Result<()>;

    /// Samples until one of the bound external buffers runs out for the
    /// operations the given state implies.
    fn proc_get_next_poi(&self, mode: LoopMode, next: Option<NextMode>, length: u32, position: u32) -> Option<u32>;

    fn proc_handle_poi(&mut self, mode: LoopMode, length: u32, position: u32);

    fn mode(&self) -> ChannelMode;
    fn set_mode(&self, mode: ChannelMode);
    fn start_offset(&self) -> i32;
    fn set_start_offset(&self, offset: i32);
    fn pre_play_samples(&self) -> u32;
    fn set_pre_play_samples(&self, samples: u32);
    fn data_seq_nr(&self) -> u32;
    /// Length of the recorded content.
    fn length(&self) -> u32;
    fn proc_set_length(&mut self, length: u32);
}

/// A channel owned by a loop.
pub enum Channel {
    Audio(AudioChannel),
    Midi(MidiChannel),
}

impl Channel {
    pub fn as_audio_mut(&mut self) -> Option<&mut AudioChannel> {
        match self {
            Channel::Audio(chan) => Some(chan),
            Channel::Midi(_) => None,
        }
    }

    pub fn as_midi_mut(&mut self) -> Option<&mut MidiChannel> {
        match self {
            Channel::Midi(chan) => Some(chan),
            Channel::Audio(_) => None,
        }
    }

    fn inner(&self) -> &dyn LoopChannel {
        match self {
            Channel::Audio(chan) => chan as &dyn LoopChannel,
            Channel::Midi(chan) => chan as &dyn LoopChannel,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn LoopChannel {
        match self {
            Channel::Audio(chan) => chan as &mut dyn LoopChannel,
            Channel::Midi(chan) => chan as &mut dyn LoopChannel,
        }
    }
}

impl From<AudioChannel> for Channel {
    fn from(chan: AudioChannel) -> Self {
        Channel::Audio(chan)
    }
}

impl From<MidiChannel> for Channel {
    fn from(chan: MidiChannel) -> Self {
        Channel::Midi(chan)
    }
}

impl LoopChannel for Channel {
    fn proc_process(&mut self, cycle: &ProcessCycle) -> Result<()> {
        self.inner_mut().proc_process(cycle)
    }

    fn proc_get_next_poi(&self, mode: LoopMode, next: Option<NextMode>, length: u32, position: u32) -> Option<u32> {
        self.inner().proc_get_next_poi(mode, next, length, position)
    }

    fn proc_handle_poi(&mut self, mode: LoopMode, length: u32, position: u32) {
        self.inner_mut().proc_handle_poi(mode, length, position)
    }

    fn mode(&self) -> ChannelMode {
        self.inner().mode()
    }

    fn set_mode(&self, mode: ChannelMode) {
        self.inner().set_mode(mode)
    }

    fn start_offset(&self) -> i32 {
        self.inner().start_offset()
    }

    fn set_start_offset(&self, offset: i32) {
        self.inner().set_start_offset(offset)
    }

    fn pre_play_samples(&self) -> u32 {
        self.inner().pre_play_samples()
    }

    fn set_pre_play_samples(&self, samples: u32) {
        self.inner().set_pre_play_samples(samples)
    }

    fn data_seq_nr(&self) -> u32 {
        self.inner().data_seq_nr()
    }

    fn length(&self) -> u32 {
        self.inner().length()
    }

    fn proc_set_length(&mut self, length: u32) {
        self.inner_mut().proc_set_length(length)
    }
}
