// src/audio/channel.rs
// Chunked audio recording, playback and replace driven by a loop

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::buffer_pool::{AudioBuffer, BufferPool};
use super::peak_meter::PeakMeter;
use super::simd_mixer;
use crate::command_queue::CommandQueue;
use crate::config::{CommandQueueConfig, EngineConfig};
use crate::error::{BufferKind, EngineError, Result};
use crate::looper::channel::{ChannelShared, LoopChannel, NextMode, ProcessCycle};
use crate::looper::mode_map::{get_channel_process_params, ProcessFlags};
use crate::looper::{ChannelMode, LoopMode};

/// External buffer bound for the current cycle, consumed front to back as
/// the cycle is processed in parts.
#[derive(Debug)]
struct BoundBuffer {
    samples: Vec<f32>,
    consumed: usize,
}

impl BoundBuffer {
    fn remaining(&self) -> usize {
        self.samples.len().saturating_sub(self.consumed)
    }
}

/// Take the next `n` samples of a bound buffer, failing if it is missing or
/// too short.
fn window(bound: &Option<BoundBuffer>, kind: BufferKind, n: usize) -> Result<(usize, usize)> {
    let bound = bound.as_ref().ok_or(EngineError::MissingBuffer(kind))?;
    if bound.remaining() < n {
        return Err(EngineError::BufferTooSmall {
            kind,
            available: bound.remaining(),
            requested: n,
        });
    }
    Ok((bound.consumed, bound.consumed + n))
}

/// Grow `chunks` from the pool until `n_samples` fit.
fn ensure_available(pool: &BufferPool, chunks: &mut Vec<AudioBuffer>, n_samples: usize) {
    let size = pool.object_size();
    while chunks.len() * size < n_samples {
        chunks.push(pool.acquire());
    }
}

/// Mirror recorded input into the bound output buffer at its current
/// offset, so the input stays audible while it is recorded.
fn passthrough(playback: &mut Option<BoundBuffer>, src: &[f32]) {
    if let Some(out) = playback.as_mut() {
        let from = out.consumed;
        simd_mixer::copy_samples(&mut out.samples[from..], src);
    }
}

/// Copy `src` into the chunk list starting at `offset`, continuing into
/// the next chunk whenever one fills up.
fn write_chunks(chunks: &mut [AudioBuffer], chunk_size: usize, mut offset: usize, mut src: &[f32]) {
    while !src.is_empty() {
        let head = offset % chunk_size;
        let chunk = Arc::make_mut(&mut chunks[offset / chunk_size]);
        let n = simd_mixer::copy_samples(&mut chunk[head..chunk_size], src);
        offset += n;
        src = &src[n..];
    }
}

/// Mix chunk content starting at `offset` into `dest`. Returns the peak.
fn mix_from_chunks(chunks: &[AudioBuffer], chunk_size: usize, mut offset: usize, mut dest: &mut [f32], gain: f32) -> f32 {
    let mut peak = 0.0f32;
    while !dest.is_empty() {
        let head = offset % chunk_size;
        let n = (chunk_size - head).min(dest.len());
        let chunk = &chunks[offset / chunk_size];
        let (now, rest) = std::mem::take(&mut dest).split_at_mut(n);
        peak = peak.max(simd_mixer::add_scaled(now, &chunk[head..head + n], gain));
        offset += n;
        dest = rest;
    }
    peak
}

#[derive(Debug)]
pub struct AudioShared {
    channel: ChannelShared,
    gain: AtomicU32, // f32 bits
    output_peak: PeakMeter,
}

impl AudioShared {
    fn new(mode: ChannelMode) -> Self {
        Self {
            channel: ChannelShared::new(mode),
            gain: AtomicU32::new(1.0f32.to_bits()),
            output_peak: PeakMeter::new(),
        }
    }

    fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }
}

/// An audio channel: recorded samples in a list of fixed-size chunks drawn
/// from a `BufferPool`, plus a second chunk list that receives pre-recorded
/// audio until recording actually starts.
pub struct AudioChannel {
    pool: Arc<BufferPool>,
    chunk_size: usize,
    buffers: Vec<AudioBuffer>,
    data_length: u32,
    prerecord: Vec<AudioBuffer>,
    prerecord_length: u32,
    playback: Option<BoundBuffer>,
    recording: Option<BoundBuffer>,
    prev_flags: ProcessFlags,
    shared: Arc<AudioShared>,
    commands: Arc<CommandQueue<AudioChannel>>,
}

impl AudioChannel {
    pub fn new(
        pool: Arc<BufferPool>,
        initial_max_buffers: usize,
        mode: ChannelMode,
        commands: &CommandQueueConfig,
    ) -> Self {
        let mut buffers = Vec::with_capacity(initial_max_buffers.max(1));
        buffers.push(pool.acquire());
        Self {
            chunk_size: pool.object_size(),
            buffers,
            data_length: 0,
            prerecord: Vec::with_capacity(initial_max_buffers.max(1)),
            prerecord_length: 0,
            playback: None,
            recording: None,
            prev_flags: ProcessFlags::NONE,
            shared: Arc::new(AudioShared::new(mode)),
            commands: Arc::new(CommandQueue::new(commands)),
            pool,
        }
    }

    pub fn from_config(pool: Arc<BufferPool>, mode: ChannelMode, config: &EngineConfig) -> Self {
        let initial_max_buffers = config.pool.target_count.max(1);
        Self::new(pool, initial_max_buffers, mode, &config.channel_commands)
    }

    /// A handle for use from other threads.
    pub fn handle(&self) -> AudioChannelHandle {
        AudioChannelHandle {
            shared: Arc::clone(&self.shared),
            commands: Arc::clone(&self.commands),
            pool: Arc::clone(&self.pool),
        }
    }

    pub fn proc_handle_command_queue(&mut self) {
        let commands = Arc::clone(&self.commands);
        commands.proc_exec_all(self);
    }

    /// Bind the output buffer of this cycle. Returns the previously bound
    /// buffer so its allocation can be reused.
    pub fn proc_set_playback_buffer(&mut self, samples: Vec<f32>) -> Option<Vec<f32>> {
        self.playback
            .replace(BoundBuffer { samples, consumed: 0 })
            .map(|b| b.samples)
    }

    /// Bind the input buffer of this cycle.
    pub fn proc_set_recording_buffer(&mut self, samples: Vec<f32>) -> Option<Vec<f32>> {
        self.recording
            .replace(BoundBuffer { samples, consumed: 0 })
            .map(|b| b.samples)
    }

    pub fn proc_take_playback_buffer(&mut self) -> Option<Vec<f32>> {
        self.playback.take().map(|b| b.samples)
    }

    pub fn proc_take_recording_buffer(&mut self) -> Option<Vec<f32>> {
        self.recording.take().map(|b| b.samples)
    }

    pub fn playback_buffer(&self) -> Option<&[f32]> {
        self.playback.as_ref().map(|b| b.samples.as_slice())
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn n_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn gain(&self) -> f32 {
        self.shared.gain()
    }

    pub fn set_gain(&self, gain: f32) {
        self.shared.gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn output_peak(&self) -> f32 {
        self.shared.output_peak.get_peak()
    }

    pub fn reset_output_peak(&self) {
        self.shared.output_peak.reset();
    }

    pub fn played_back_sample(&self) -> Option<u32> {
        self.shared.channel.played_back_sample()
    }

    fn set_data_length(&mut self, length: u32) {
        self.data_length = length;
        self.shared.channel.set_length(length);
    }

    fn data_changed(&self) {
        self.shared.channel.bump_data_seq_nr();
    }

    /// Replace the content with `samples`, allocating on the calling thread.
    pub fn load_data(&mut self, samples: &[f32]) {
        let chunks = build_chunks(&self.pool, samples);
        self.install_data(chunks, samples.len() as u32);
    }

    /// Swap in new content. The old chunks are returned so the caller
    /// decides which thread frees them.
    fn install_data(&mut self, chunks: Vec<AudioBuffer>, length: u32) -> Vec<AudioBuffer> {
        let old = std::mem::replace(&mut self.buffers, chunks);
        self.set_data_length(length);
        self.prerecord_length = 0;
        self.shared.channel.set_start_offset(0);
        self.data_changed();
        old
    }

    /// Take over the content of `other`, sharing its chunks until either
    /// side writes to them. Both channels must use the same chunk size.
    pub fn copy_data_from(&mut self, other: &AudioChannel) -> Result<()> {
        if other.chunk_size != self.chunk_size {
            return Err(EngineError::BufferSizeMismatch {
                expected: self.chunk_size,
                actual: other.chunk_size,
            });
        }
        self.install_data(other.buffers.clone(), other.data_length);
        self.shared.channel.set_start_offset(other.shared.channel.start_offset());
        Ok(())
    }

    /// Recorded content, `length()` samples.
    pub fn get_data(&self) -> Vec<f32> {
        collect_chunks(&self.buffers, self.chunk_size, self.data_length as usize)
    }

    /// Reset to `length` samples of silence.
    pub fn proc_clear(&mut self, length: u32) {
        ensure_available(&self.pool, &mut self.buffers, length as usize);
        for chunk in self.buffers.iter_mut() {
            Arc::make_mut(chunk).fill(0.0);
        }
        self.set_data_length(length);
        self.shared.channel.set_start_offset(0);
        self.data_changed();
    }

    fn process_playback(&mut self, position: i64, n: usize) -> Result<()> {
        let (from, to) = window(&self.playback, BufferKind::Playback, n)?;
        let channel = &self.shared.channel;
        let first_audible = (channel.start_offset() as i64 - channel.pre_play_samples() as i64).max(0);
        let skip = ((first_audible - position).max(0) as usize).min(n);
        let data_pos = position + skip as i64;
        let data_length = self.data_length as i64;
        if data_pos >= data_length {
            return Ok(());
        }
        let count = (n - skip).min((data_length - data_pos) as usize);
        if count == 0 {
            return Ok(());
        }

        let gain = self.shared.gain();
        let Some(bound) = self.playback.as_mut() else {
            return Ok(());
        };
        let dest = &mut bound.samples[from + skip..(from + skip + count).min(to)];
        let peak = mix_from_chunks(&self.buffers, self.chunk_size, data_pos as usize, dest, gain);
        self.shared.output_peak.update(peak);
        Ok(())
    }

    fn process_record(&mut self, record_from: usize, n: usize) -> Result<()> {
        let (from, to) = window(&self.recording, BufferKind::Recording, n)?;
        let Some(bound) = self.recording.as_ref() else {
            return Ok(());
        };
        ensure_available(&self.pool, &mut self.buffers, record_from + n);
        write_chunks(&mut self.buffers, self.chunk_size, record_from, &bound.samples[from..to]);
        passthrough(&mut self.playback, &bound.samples[from..to]);
        self.set_data_length((record_from + n) as u32);
        if n > 0 {
            self.data_changed();
        }
        Ok(())
    }

    fn process_prerecord(&mut self, n: usize) -> Result<()> {
        let (from, to) = window(&self.recording, BufferKind::Recording, n)?;
        let Some(bound) = self.recording.as_ref() else {
            return Ok(());
        };
        let record_from = self.prerecord_length as usize;
        ensure_available(&self.pool, &mut self.prerecord, record_from + n);
        write_chunks(&mut self.prerecord, self.chunk_size, record_from, &bound.samples[from..to]);
        passthrough(&mut self.playback, &bound.samples[from..to]);
        self.prerecord_length = (record_from + n) as u32;
        Ok(())
    }

    /// Overwrite content at `position`, never past the loop length as it was
    /// before this cycle.
    fn process_replace(&mut self, position: i64, loop_length: u32, n: usize) -> Result<()> {
        let (from, _) = window(&self.recording, BufferKind::Recording, n)?;
        let Some(bound) = self.recording.as_ref() else {
            return Ok(());
        };
        // Content before index 0 cannot be replaced.
        let skip = ((-position).max(0) as usize).min(n);
        let data_pos = position + skip as i64;
        let loop_pos = data_pos - self.shared.channel.start_offset() as i64;
        let limit = (loop_length as i64 - loop_pos).max(0) as usize;
        let count = (n - skip).min(limit);
        if count == 0 {
            return Ok(());
        }
        let data_pos = data_pos as usize;
        ensure_available(&self.pool, &mut self.buffers, data_pos + count);
        write_chunks(
            &mut self.buffers,
            self.chunk_size,
            data_pos,
            &bound.samples[from + skip..from + skip + count],
        );
        if data_pos + count > self.data_length as usize {
            self.set_data_length((data_pos + count) as u32);
        }
        self.data_changed();
        Ok(())
    }

    fn end_prerecord(&mut self, promote: bool) {
        if promote {
            log::debug!("pre-record end: carry over {} samples", self.prerecord_length);
            std::mem::swap(&mut self.buffers, &mut self.prerecord);
            let length = self.prerecord_length;
            self.set_data_length(length);
            self.shared.channel.set_start_offset(length as i32);
            self.data_changed();
        } else {
            log::debug!("pre-record end: discard");
        }
        // Whatever is left is no longer needed; the pool frees or reuses it
        // off this thread.
        for buffer in self.prerecord.drain(..) {
            self.pool.release(buffer);
        }
        self.prerecord_length = 0;
    }
}

/// Split `samples` into freshly allocated chunks of the pool's size.
fn build_chunks(pool: &BufferPool, samples: &[f32]) -> Vec<AudioBuffer> {
    let mut chunks: Vec<AudioBuffer> = samples
        .chunks(pool.object_size())
        .map(|part| {
            let mut buffer = pool.allocate();
            Arc::make_mut(&mut buffer)[..part.len()].copy_from_slice(part);
            buffer
        })
        .collect();
    if chunks.is_empty() {
        chunks.push(pool.allocate());
    }
    chunks
}

fn collect_chunks(chunks: &[AudioBuffer], chunk_size: usize, length: usize) -> Vec<f32> {
    let mut data = Vec::with_capacity(length);
    for chunk in chunks {
        let n = (length - data.len()).min(chunk_size);
        data.extend_from_slice(&chunk[..n]);
        if data.len() == length {
            break;
        }
    }
    data
}

impl LoopChannel for AudioChannel {
    fn proc_process(&mut self, cycle: &ProcessCycle) -> Result<()> {
        self.proc_handle_command_queue();

        let params = get_channel_process_params(
            cycle.mode,
            cycle.next,
            cycle.pos_before as i64,
            self.shared.channel.start_offset(),
            self.shared.channel.mode(),
        );
        let flags = params.flags;
        let n = cycle.n_samples as usize;

        if self.prev_flags.contains(ProcessFlags::PRE_RECORD) && !flags.contains(ProcessFlags::PRE_RECORD) {
            self.end_prerecord(flags.contains(ProcessFlags::RECORD));
        }

        if flags.contains(ProcessFlags::PLAYBACK) {
            self.shared.channel.set_played_back_sample(Some(params.position));
            self.process_playback(params.position, n)?;
        } else {
            self.shared.channel.set_played_back_sample(None);
        }
        if flags.contains(ProcessFlags::RECORD) {
            let record_from = cycle.length_before as i64 + self.shared.channel.start_offset() as i64;
            self.process_record(record_from.max(0) as usize, n)?;
        }
        if flags.contains(ProcessFlags::REPLACE) {
            self.process_replace(params.position, cycle.length_before, n)?;
        }
        if flags.contains(ProcessFlags::PRE_RECORD) {
            if !self.prev_flags.contains(ProcessFlags::PRE_RECORD) {
                log::debug!("pre-record start");
            }
            self.process_prerecord(n)?;
        }

        self.prev_flags = flags;
        for bound in [self.playback.as_mut(), self.recording.as_mut()].into_iter().flatten() {
            bound.consumed = (bound.consumed + n).min(bound.samples.len());
        }
        Ok(())
    }

    fn proc_get_next_poi(&self, mode: LoopMode, next: Option<NextMode>, _length: u32, position: u32) -> Option<u32> {
        let channel_mode = self.shared.channel.mode();
        if channel_mode == ChannelMode::Disabled {
            return None;
        }
        let params = get_channel_process_params(
            mode,
            next,
            position as i64,
            self.shared.channel.start_offset(),
            channel_mode,
        );
        let remaining = |bound: &Option<BoundBuffer>| {
            bound
                .as_ref()
                .map(|b| b.remaining() as u32)
                .filter(|&r| r > 0)
        };
        let mut poi: Option<u32> = None;
        let mut merge = |candidate: Option<u32>| {
            if let Some(c) = candidate {
                poi = Some(poi.map_or(c, |p| p.min(c)));
            }
        };
        if params.flags.contains(ProcessFlags::PLAYBACK) {
            merge(remaining(&self.playback));
        }
        if params.flags.intersects(ProcessFlags::RECORD | ProcessFlags::PRE_RECORD) {
            merge(remaining(&self.recording));
        }
        poi
    }

    fn proc_handle_poi(&mut self, _mode: LoopMode, _length: u32, _position: u32) {}

    fn mode(&self) -> ChannelMode {
        self.shared.channel.mode()
    }

    fn set_mode(&self, mode: ChannelMode) {
        self.shared.channel.set_mode(mode);
    }

    fn start_offset(&self) -> i32 {
        self.shared.channel.start_offset()
    }

    fn set_start_offset(&self, offset: i32) {
        self.shared.channel.set_start_offset(offset);
    }

    fn pre_play_samples(&self) -> u32 {
        self.shared.channel.pre_play_samples()
    }

    fn set_pre_play_samples(&self, samples: u32) {
        self.shared.channel.set_pre_play_samples(samples);
    }

    fn data_seq_nr(&self) -> u32 {
        self.shared.channel.data_seq_nr()
    }

    fn length(&self) -> u32 {
        self.data_length
    }

    fn proc_set_length(&mut self, length: u32) {
        self.set_data_length(length);
        self.data_changed();
    }
}

/// Thread-safe view of an `AudioChannel`. Scalars are read and written
/// directly; everything else is executed on the processing thread.
#[derive(Clone)]
pub struct AudioChannelHandle {
    shared: Arc<AudioShared>,
    commands: Arc<CommandQueue<AudioChannel>>,
    pool: Arc<BufferPool>,
}

impl AudioChannelHandle {
    pub fn mode(&self) -> ChannelMode {
        self.shared.channel.mode()
    }

    pub fn set_mode(&self, mode: ChannelMode) {
        self.shared.channel.set_mode(mode);
    }

    pub fn start_offset(&self) -> i32 {
        self.shared.channel.start_offset()
    }

    pub fn set_start_offset(&self, offset: i32) {
        self.shared.channel.set_start_offset(offset);
    }

    pub fn pre_play_samples(&self) -> u32 {
        self.shared.channel.pre_play_samples()
    }

    pub fn set_pre_play_samples(&self, samples: u32) {
        self.shared.channel.set_pre_play_samples(samples);
    }

    pub fn data_seq_nr(&self) -> u32 {
        self.shared.channel.data_seq_nr()
    }

    pub fn length(&self) -> u32 {
        self.shared.channel.length()
    }

    pub fn gain(&self) -> f32 {
        self.shared.gain()
    }

    pub fn set_gain(&self, gain: f32) {
        self.shared.gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn output_peak(&self) -> f32 {
        self.shared.output_peak.get_peak()
    }

    pub fn reset_output_peak(&self) {
        self.shared.output_peak.reset();
    }

    pub fn played_back_sample(&self) -> Option<u32> {
        self.shared.channel.played_back_sample()
    }

    /// Replace the channel content. Chunks are built on this thread; only
    /// the swap happens on the processing thread.
    pub fn load_data(&self, samples: &[f32]) -> Result<()> {
        let chunks = build_chunks(&self.pool, samples);
        let length = samples.len() as u32;
        let replaced = self
            .commands
            .exec(move |chan: &mut AudioChannel| chan.install_data(chunks, length))?;
        drop(replaced);
        Ok(())
    }

    /// Copy out the recorded content. Only the chunk references are taken
    /// on the processing thread.
    pub fn get_data(&self) -> Result<Vec<f32>> {
        let (chunks, chunk_size, length) = self
            .commands
            .exec(|chan: &mut AudioChannel| (chan.buffers.clone(), chan.chunk_size, chan.data_length))?;
        Ok(collect_chunks(&chunks, chunk_size, length as usize))
    }

    pub fn clear(&self, length: u32) -> Result<()> {
        self.commands.exec(move |chan: &mut AudioChannel| chan.proc_clear(length))?;
        Ok(())
    }

    pub fn set_length(&self, length: u32) -> Result<()> {
        self.commands
            .exec(move |chan: &mut AudioChannel| chan.proc_set_length(length))?;
        Ok(())
    }
}
