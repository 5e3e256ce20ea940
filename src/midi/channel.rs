// src/midi/channel.rs
// MIDI recording and playback driven by a loop

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use super::buffer::MidiBuffer;
use super::state_diff::{DiffAction, DiffSide, MidiStateDiffTracker};
use super::state_tracker::MidiStateTracker;
use super::storage::{MidiCursor, MidiStorage, TruncateSide};
use super::ALL_SOUND_OFF_CHANNEL_0;
use crate::command_queue::CommandQueue;
use crate::config::{CommandQueueConfig, EngineConfig};
use crate::error::{BufferKind, EngineError, Result};
use crate::looper::channel::{ChannelShared, LoopChannel, NextMode, ProcessCycle};
use crate::looper::mode_map::{get_channel_process_params, ProcessFlags};
use crate::looper::{ChannelMode, LoopMode};

/// One message as exchanged with the outside world. A negative time marks a
/// state message: it describes the MIDI state in effect before the first
/// recorded message rather than an event in the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiWireEvent {
    pub time: i64,
    pub data: Vec<u8>,
}

impl MidiWireEvent {
    pub fn new(time: i64, data: &[u8]) -> Self {
        Self {
            time,
            data: data.to_vec(),
        }
    }

    pub fn is_state(&self) -> bool {
        self.time < 0
    }
}

/// Output buffer of this cycle, filled front to back.
#[derive(Debug)]
struct PlaybackTarget {
    buffer: MidiBuffer,
    frames_processed: u32,
}

/// Input buffer of this cycle. `events_processed` tracks how far its events
/// have been consumed.
#[derive(Debug)]
struct RecordSource {
    buffer: MidiBuffer,
    frames_processed: u32,
    events_processed: usize,
}

fn frames_left(n_frames: u32, processed: u32) -> u32 {
    n_frames.saturating_sub(processed)
}

fn check_frames(kind: BufferKind, available: u32, n: u32) -> Result<()> {
    if available < n {
        return Err(EngineError::BufferTooSmall {
            kind,
            available: available as usize,
            requested: n as usize,
        });
    }
    Ok(())
}

/// Destination of a record pass: the main store or the pre-record store.
struct RecordInto<'a> {
    storage: &'a mut MidiStorage,
    length: &'a mut u32,
    start_state: &'a mut MidiStateTracker,
    start_valid: &'a mut bool,
}

/// Record the events of the next `n` frames of `source` at `record_from`.
/// Returns whether anything was stored.
fn record_events(
    source: &mut RecordSource,
    input_state: &mut MidiStateTracker,
    into: RecordInto<'_>,
    record_from: u32,
    n: u32,
) -> bool {
    let RecordInto {
        storage,
        length,
        start_state,
        start_valid,
    } = into;

    let before = storage.n_events();
    storage.truncate(record_from, TruncateSide::Tail, |_| {});
    let mut changed = storage.n_events() != before;

    let end = source.frames_processed + n;
    while let Some((time, data)) = source.buffer.get(source.events_processed) {
        if time >= end {
            break;
        }
        if time >= source.frames_processed {
            if storage.is_empty() {
                // State at the moment recording starts.
                start_state.copy_relevant_state(input_state);
                *start_valid = true;
            }
            if storage.append(record_from + (time - source.frames_processed), data) {
                changed = true;
            } else {
                log::warn!(
                    "MIDI storage full, dropping message at {}",
                    record_from + (time - source.frames_processed)
                );
            }
        }
        input_state.process_msg(data);
        source.events_processed += 1;
    }

    *length = record_from + n;
    changed
}

#[derive(Debug)]
struct MidiShared {
    channel: ChannelShared,
    n_events_triggered: AtomicU32,
    n_notes_active: AtomicU32,
    storage_capacity: AtomicUsize,
}

impl MidiShared {
    fn new(mode: ChannelMode, storage_bytes: usize) -> Self {
        Self {
            channel: ChannelShared::new(mode),
            n_events_triggered: AtomicU32::new(0),
            n_notes_active: AtomicU32::new(0),
            storage_capacity: AtomicUsize::new(storage_bytes),
        }
    }
}

/// A MIDI channel.
///
/// Recorded messages live in a `MidiStorage` with times in channel
/// samples. Playback walks the storage with a cursor that stays put while
/// playback is contiguous. When playback starts or jumps, All Sound Off is
/// sent, the cursor is re-seeked, and the controller and program state that
/// was in effect when recording started is restored right before the first
/// audible message.
pub struct MidiChannel {
    storage: MidiStorage,
    prerecord_storage: MidiStorage,
    cursor: MidiCursor,
    data_length: u32,
    prerecord_length: u32,

    output_state: MidiStateTracker,
    input_state: MidiStateTracker,
    track_start_state: MidiStateTracker,
    track_start_valid: bool,
    prerecord_start_state: MidiStateTracker,
    prerecord_start_valid: bool,
    pre_playback: MidiStateDiffTracker,
    pre_playback_active: bool,

    playback: Option<PlaybackTarget>,
    recording: Option<RecordSource>,
    prev_flags: ProcessFlags,
    prev_pos_after: u32,

    shared: Arc<MidiShared>,
    commands: Arc<CommandQueue<MidiChannel>>,
}

impl MidiChannel {
    pub fn new(storage_bytes: usize, mode: ChannelMode, commands: &CommandQueueConfig) -> Self {
        let mut storage = MidiStorage::new(storage_bytes);
        let mut prerecord_storage = MidiStorage::new(storage_bytes);
        // Both stores hand out the same first cursor id, so they can be
        // swapped without re-registering.
        let cursor = storage.create_cursor();
        prerecord_storage.create_cursor();
        let controls_only = || MidiStateTracker::new(false, true, true);

        Self {
            storage,
            prerecord_storage,
            cursor,
            data_length: 0,
            prerecord_length: 0,
            output_state: MidiStateTracker::default(),
            input_state: MidiStateTracker::default(),
            track_start_state: MidiStateTracker::default(),
            track_start_valid: false,
            prerecord_start_state: MidiStateTracker::default(),
            prerecord_start_valid: false,
            pre_playback: MidiStateDiffTracker::new(controls_only(), controls_only(), DiffAction::ClearDiff),
            pre_playback_active: false,
            playback: None,
            recording: None,
            prev_flags: ProcessFlags::NONE,
            prev_pos_after: 0,
            shared: Arc::new(MidiShared::new(mode, storage_bytes)),
            commands: Arc::new(CommandQueue::new(commands)),
        }
    }

    pub fn from_config(mode: ChannelMode, config: &EngineConfig) -> Self {
        Self::new(config.midi.storage_bytes, mode, &config.channel_commands)
    }

    pub fn handle(&self) -> MidiChannelHandle {
        MidiChannelHandle {
            shared: Arc::clone(&self.shared),
            commands: Arc::clone(&self.commands),
        }
    }

    pub fn proc_handle_command_queue(&mut self) {
        let commands = Arc::clone(&self.commands);
        commands.proc_exec_all(self);
    }

    /// Bind the output buffer of this cycle. Returns the previous one.
    pub fn proc_set_playback_buffer(&mut self, buffer: MidiBuffer) -> Option<MidiBuffer> {
        self.playback
            .replace(PlaybackTarget {
                buffer,
                frames_processed: 0,
            })
            .map(|t| t.buffer)
    }

    /// Bind the input buffer of this cycle. Returns the previous one.
    pub fn proc_set_recording_buffer(&mut self, buffer: MidiBuffer) -> Option<MidiBuffer> {
        self.recording
            .replace(RecordSource {
                buffer,
                frames_processed: 0,
                events_processed: 0,
            })
            .map(|s| s.buffer)
    }

    pub fn proc_take_playback_buffer(&mut self) -> Option<MidiBuffer> {
        self.playback.take().map(|t| t.buffer)
    }

    pub fn proc_take_recording_buffer(&mut self) -> Option<MidiBuffer> {
        self.recording.take().map(|s| s.buffer)
    }

    pub fn playback_buffer(&self) -> Option<&MidiBuffer> {
        self.playback.as_ref().map(|t| &t.buffer)
    }

    /// Messages sent since the last call.
    pub fn n_events_triggered(&self) -> u32 {
        self.shared.n_events_triggered.swap(0, Ordering::Relaxed)
    }

    /// Notes currently sounding on the output.
    pub fn n_notes_active(&self) -> u32 {
        self.shared.n_notes_active.load(Ordering::Relaxed)
    }

    pub fn played_back_sample(&self) -> Option<u32> {
        self.shared.channel.played_back_sample()
    }

    /// State of everything received on the input so far, recorded or not.
    pub fn input_state(&self) -> &MidiStateTracker {
        &self.input_state
    }

    pub fn n_events(&self) -> usize {
        self.storage.n_events()
    }

    fn set_data_length(&mut self, length: u32) {
        self.data_length = length;
        self.shared.channel.set_length(length);
    }

    fn data_changed(&self) {
        self.shared.channel.bump_data_seq_nr();
    }

    /// Drop all content and state.
    pub fn clear(&mut self) {
        self.storage.clear();
        self.storage.cursor_reset(self.cursor);
        self.prerecord_storage.clear();
        self.prerecord_length = 0;
        self.output_state.clear();
        self.track_start_valid = false;
        self.prerecord_start_valid = false;
        self.pre_playback_active = false;
        self.shared.n_events_triggered.store(0, Ordering::Relaxed);
        self.set_data_length(0);
        self.shared.channel.set_start_offset(0);
        self.data_changed();
    }

    /// Start state messages (time -1) followed by all recorded messages.
    pub fn retrieve_contents(&self) -> Vec<MidiWireEvent> {
        let start_state = self.track_start_valid.then_some(&self.track_start_state);
        contents_to_wire(&self.storage, start_state)
    }

    /// Replace the content. Messages with a negative time form the start
    /// state; the rest must be in non-decreasing time order.
    pub fn set_contents(&mut self, events: &[MidiWireEvent], length: u32) {
        let capacity = self.shared.storage_capacity.load(Ordering::Relaxed);
        let (storage, start_state) = build_contents(events, capacity);
        self.install_contents(storage, start_state, length);
    }

    /// Swap in new content. Returns the replaced storage and start state so
    /// the caller decides where they are freed.
    fn install_contents(
        &mut self,
        mut storage: MidiStorage,
        mut start_state: MidiStateTracker,
        length: u32,
    ) -> (MidiStorage, MidiStateTracker) {
        std::mem::swap(&mut self.storage, &mut storage);
        std::mem::swap(&mut self.track_start_state, &mut start_state);
        self.track_start_valid = true;
        self.storage.cursor_reset(self.cursor);
        self.pre_playback_active = false;
        self.shared
            .storage_capacity
            .store(self.storage.bytes_capacity(), Ordering::Relaxed);
        self.set_data_length(length);
        self.data_changed();
        (storage, start_state)
    }

    fn send(&mut self, data: &[u8]) {
        let Some(target) = self.playback.as_mut() else {
            return;
        };
        target.buffer.push(target.frames_processed, data);
        self.output_state.process_msg(data);
    }

    fn send_all_sound_off(&mut self) {
        log::debug!("playback interrupted, sending All Sound Off");
        self.send(&ALL_SOUND_OFF_CHANNEL_0);
    }

    fn process_playback(&mut self, position: i64, n: u32, restart: bool) -> Result<()> {
        let target = self.playback.as_ref().ok_or(EngineError::MissingBuffer(BufferKind::Playback))?;
        check_frames(
            BufferKind::Playback,
            frames_left(target.buffer.n_frames(), target.frames_processed),
            n,
        )?;

        if restart {
            self.storage.cursor_reset(self.cursor);
            self.pre_playback_active = self.track_start_valid;
            if self.pre_playback_active {
                self.pre_playback
                    .reset_sides(&self.output_state, &self.track_start_state);
            }
        }

        let channel = &self.shared.channel;
        let valid_from = position.max(channel.start_offset() as i64 - channel.pre_play_samples() as i64);
        let valid_to = position + n as i64;

        let Self {
            storage,
            cursor,
            playback,
            output_state,
            pre_playback,
            pre_playback_active,
            shared,
            ..
        } = self;
        let Some(target) = playback.as_mut() else {
            return Ok(());
        };

        // Messages before the position only move the state to restore.
        storage.cursor_find_time_forward(*cursor, position.max(0) as u32, |record| {
            if *pre_playback_active {
                pre_playback.process_b(record.data);
            }
        });

        let mut sent = 0;
        while let Some(record) = storage.cursor_get(*cursor) {
            let time = record.time as i64;
            if time >= valid_to {
                break;
            }
            if time >= valid_from {
                let frame = (time - position) as u32 + target.frames_processed;
                // The saved state goes out right before the first message
                // actually sent, at the same frame.
                if *pre_playback_active {
                    log::debug!("restoring channel state for playback at {}", time);
                    pre_playback.resolve_to(DiffSide::A, |msg| {
                        target.buffer.push(frame, msg);
                        output_state.process_msg(msg);
                    });
                    *pre_playback_active = false;
                }
                target.buffer.push(frame, record.data);
                output_state.process_msg(record.data);
                sent += 1;
            } else if *pre_playback_active {
                pre_playback.process_b(record.data);
            }
            storage.cursor_next(*cursor);
        }
        shared.n_events_triggered.fetch_add(sent, Ordering::Relaxed);
        Ok(())
    }

    fn recording_source(&mut self, n: u32) -> Result<&mut RecordSource> {
        let source = self
            .recording
            .as_mut()
            .ok_or(EngineError::MissingBuffer(BufferKind::Recording))?;
        check_frames(
            BufferKind::Recording,
            frames_left(source.buffer.n_frames(), source.frames_processed),
            n,
        )?;
        Ok(source)
    }

    fn process_record(&mut self, record_from: u32, n: u32) -> Result<()> {
        self.recording_source(n)?;
        let Self {
            recording,
            input_state,
            storage,
            data_length,
            track_start_state,
            track_start_valid,
            ..
        } = self;
        let Some(source) = recording.as_mut() else {
            return Ok(());
        };
        let changed = record_events(
            source,
            input_state,
            RecordInto {
                storage,
                length: data_length,
                start_state: track_start_state,
                start_valid: track_start_valid,
            },
            record_from,
            n,
        );
        let length = self.data_length;
        self.shared.channel.set_length(length);
        if changed || n > 0 {
            self.data_changed();
        }
        Ok(())
    }

    fn process_prerecord(&mut self, n: u32) -> Result<()> {
        self.recording_source(n)?;
        let record_from = self.prerecord_length;
        let Self {
            recording,
            input_state,
            prerecord_storage,
            prerecord_length,
            prerecord_start_state,
            prerecord_start_valid,
            ..
        } = self;
        let Some(source) = recording.as_mut() else {
            return Ok(());
        };
        record_events(
            source,
            input_state,
            RecordInto {
                storage: prerecord_storage,
                length: prerecord_length,
                start_state: prerecord_start_state,
                start_valid: prerecord_start_valid,
            },
            record_from,
            n,
        );
        Ok(())
    }

    /// Track input messages that arrive while not recording.
    fn process_input(&mut self, n: u32) {
        let Some(source) = self.recording.as_mut() else {
            return;
        };
        let end = source.frames_processed + n;
        while let Some((time, data)) = source.buffer.get(source.events_processed) {
            if time >= end {
                break;
            }
            self.input_state.process_msg(data);
            source.events_processed += 1;
        }
    }

    fn end_prerecord(&mut self, promote: bool) {
        if promote {
            log::debug!(
                "pre-record end: carry over {} messages ({} samples)",
                self.prerecord_storage.n_events(),
                self.prerecord_length
            );
            std::mem::swap(&mut self.storage, &mut self.prerecord_storage);
            std::mem::swap(&mut self.track_start_state, &mut self.prerecord_start_state);
            self.track_start_valid = self.prerecord_start_valid;
            self.storage.cursor_reset(self.cursor);
            let length = self.prerecord_length;
            self.set_data_length(length);
            self.shared.channel.set_start_offset(length as i32);
            self.data_changed();
        } else {
            log::debug!("pre-record end: discard");
        }
        self.prerecord_storage.clear();
        self.prerecord_length = 0;
        self.prerecord_start_valid = false;
    }
}

fn contents_to_wire(storage: &MidiStorage, start_state: Option<&MidiStateTracker>) -> Vec<MidiWireEvent> {
    let mut events: Vec<MidiWireEvent> = start_state
        .map(|state| {
            state
                .state_as_messages()
                .into_iter()
                .map(|data| MidiWireEvent { time: -1, data })
                .collect()
        })
        .unwrap_or_default();
    events.reserve(storage.n_events());
    storage.for_each_msg(|record| events.push(MidiWireEvent::new(record.time as i64, record.data)));
    events
}

/// Build a storage and start state from wire events, growing the storage
/// beyond `capacity` if the events need it.
fn build_contents(events: &[MidiWireEvent], capacity: usize) -> (MidiStorage, MidiStateTracker) {
    let mut start_state = MidiStateTracker::default();
    let needed: usize = events
        .iter()
        .filter(|e| !e.is_state())
        .map(|e| e.data.len() + 6)
        .sum();
    let mut storage = MidiStorage::new(capacity.max(needed));
    storage.create_cursor();

    for event in events {
        if event.is_state() {
            start_state.process_msg(&event.data);
        } else if let Ok(time) = u32::try_from(event.time) {
            if !storage.append(time, &event.data) {
                log::warn!("dropping out-of-order message at {}", time);
            }
        }
    }
    (storage, start_state)
}

impl LoopChannel for MidiChannel {
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
        let n = cycle.n_samples;

        let was_playing = self.prev_flags.contains(ProcessFlags::PLAYBACK);
        let playing = flags.contains(ProcessFlags::PLAYBACK);
        let interrupted = was_playing && (!playing || cycle.pos_before != self.prev_pos_after);
        if interrupted && n > 0 {
            self.send_all_sound_off();
        }

        if self.prev_flags.contains(ProcessFlags::PRE_RECORD) && !flags.contains(ProcessFlags::PRE_RECORD) {
            self.end_prerecord(flags.contains(ProcessFlags::RECORD));
        }

        if playing {
            self.shared.channel.set_played_back_sample(Some(params.position));
            self.process_playback(params.position, n, !was_playing || interrupted)?;
        } else {
            self.shared.channel.set_played_back_sample(None);
        }

        if flags.contains(ProcessFlags::RECORD) {
            let record_from = cycle.length_before as i64 + self.shared.channel.start_offset() as i64;
            self.process_record(record_from.max(0) as u32, n)?;
        } else if flags.contains(ProcessFlags::PRE_RECORD) {
            if !self.prev_flags.contains(ProcessFlags::PRE_RECORD) {
                log::debug!("pre-record start");
            }
            self.process_prerecord(n)?;
        } else {
            self.process_input(n);
        }

        self.prev_flags = flags;
        self.prev_pos_after = cycle.pos_after;
        if let Some(target) = self.playback.as_mut() {
            target.frames_processed = (target.frames_processed + n).min(target.buffer.n_frames());
        }
        if let Some(source) = self.recording.as_mut() {
            source.frames_processed = (source.frames_processed + n).min(source.buffer.n_frames());
        }
        self.shared
            .n_notes_active
            .store(self.output_state.n_notes_active() as u32, Ordering::Relaxed);
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
        let mut poi: Option<u32> = None;
        let mut merge = |candidate: Option<u32>| {
            if let Some(c) = candidate.filter(|&c| c > 0) {
                poi = Some(poi.map_or(c, |p| p.min(c)));
            }
        };
        if params.flags.contains(ProcessFlags::PLAYBACK) {
            merge(
                self.playback
                    .as_ref()
                    .map(|t| frames_left(t.buffer.n_frames(), t.frames_processed)),
            );
        }
        if params.flags.intersects(ProcessFlags::RECORD | ProcessFlags::PRE_RECORD) {
            merge(
                self.recording
                    .as_ref()
                    .map(|s| frames_left(s.buffer.n_frames(), s.frames_processed)),
            );
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
        self.storage.truncate(length, TruncateSide::Tail, |_| {});
        self.set_data_length(length);
        self.data_changed();
    }
}

/// Thread-safe view of a `MidiChannel`.
#[derive(Clone)]
pub struct MidiChannelHandle {
    shared: Arc<MidiShared>,
    commands: Arc<CommandQueue<MidiChannel>>,
}

impl MidiChannelHandle {
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

    pub fn played_back_sample(&self) -> Option<u32> {
        self.shared.channel.played_back_sample()
    }

    /// Messages sent since the last call.
    pub fn n_events_triggered(&self) -> u32 {
        self.shared.n_events_triggered.swap(0, Ordering::Relaxed)
    }

    pub fn n_notes_active(&self) -> u32 {
        self.shared.n_notes_active.load(Ordering::Relaxed)
    }

    /// Copy out the content. The copy target is allocated here; the
    /// processing thread only copies records into it.
    pub fn retrieve_contents(&self) -> Result<Vec<MidiWireEvent>> {
        let mut snapshot = MidiStorage::new(self.shared.storage_capacity.load(Ordering::Relaxed));
        let mut start_state = MidiStateTracker::default();
        let (snapshot, start_state, valid) = self.commands.exec(move |chan: &mut MidiChannel| {
            if !chan.storage.copy_to(&mut snapshot) {
                log::warn!("content grew during retrieval, result is incomplete");
            }
            start_state.copy_relevant_state(&chan.track_start_state);
            (snapshot, start_state, chan.track_start_valid)
        })?;
        Ok(contents_to_wire(&snapshot, valid.then_some(&start_state)))
    }

    /// Replace the content. The new storage is built on this thread.
    pub fn set_contents(&self, events: &[MidiWireEvent], length: u32) -> Result<()> {
        let capacity = self.shared.storage_capacity.load(Ordering::Relaxed);
        let (storage, start_state) = build_contents(events, capacity);
        let replaced = self
            .commands
            .exec(move |chan: &mut MidiChannel| chan.install_contents(storage, start_state, length))?;
        drop(replaced);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.commands.exec(|chan: &mut MidiChannel| chan.clear())?;
        Ok(())
    }

    pub fn set_length(&self, length: u32) -> Result<()> {
        self.commands
            .exec(move |chan: &mut MidiChannel| chan.proc_set_length(length))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    const NOTE_ON_60: [u8; 3] = [0x90, 60, 100];
    const NOTE_OFF_60: [u8; 3] = [0x80, 60, 64];
    const NOTE_ON_62: [u8; 3] = [0x90, 62, 100];

    fn channel() -> MidiChannel {
        let _ = env_logger::builder().is_test(true).try_init();
        MidiChannel::new(1024, ChannelMode::Direct, &CommandQueueConfig::for_channels())
    }

    fn cycle(mode: LoopMode, n: u32, pos: u32, length: u32) -> ProcessCycle {
        let (pos_after, length_after) = match mode {
            LoopMode::Recording => (pos, length + n),
            LoopMode::Playing => (pos + n, length),
            _ => (pos, length),
        };
        ProcessCycle {
            mode,
            next: None,
            n_samples: n,
            pos_before: pos,
            pos_after,
            length_before: length,
            length_after,
        }
    }

    fn input(n_frames: u32, events: &[(u32, &[u8])]) -> MidiBuffer {
        let mut buf = MidiBuffer::new(n_frames);
        for &(time, data) in events {
            buf.push(time, data);
        }
        buf
    }

    fn output(chan: &MidiChannel) -> Vec<(u32, Vec<u8>)> {
        chan.playback_buffer().map(|b| b.to_vec()).unwrap_or_default()
    }

    #[test]
    fn test_record_then_play_back() {
        let mut chan = channel();
        chan.proc_set_recording_buffer(input(8, &[(2, &NOTE_ON_60), (5, &NOTE_OFF_60)]));
        chan.proc_process(&cycle(LoopMode::Recording, 8, 0, 0)).unwrap();
        assert_eq!(chan.length(), 8);
        assert_eq!(chan.n_events(), 2);

        chan.proc_set_playback_buffer(MidiBuffer::new(8));
        chan.proc_process(&cycle(LoopMode::Playing, 8, 0, 8)).unwrap();
        assert_eq!(
            output(&chan),
            vec![(2, NOTE_ON_60.to_vec()), (5, NOTE_OFF_60.to_vec())]
        );
        assert_eq!(chan.n_events_triggered(), 2);
        assert_eq!(chan.n_events_triggered(), 0);
        assert_eq!(chan.n_notes_active(), 0);
    }

    #[test]
    fn test_jump_sends_all_sound_off_first() {
        let mut chan = channel();
        chan.set_contents(
            &[
                MidiWireEvent::new(2, &NOTE_ON_60),
                MidiWireEvent::new(5, &NOTE_OFF_60),
                MidiWireEvent::new(6, &NOTE_ON_62),
            ],
            10,
        );
        chan.proc_set_playback_buffer(MidiBuffer::new(4));
        chan.proc_process(&cycle(LoopMode::Playing, 4, 0, 10)).unwrap();
        assert_eq!(output(&chan), vec![(2, NOTE_ON_60.to_vec())]);
        assert_eq!(chan.n_notes_active(), 1);

        // Continue at 6 instead of 4.
        chan.proc_set_playback_buffer(MidiBuffer::new(4));
        chan.proc_process(&cycle(LoopMode::Playing, 4, 6, 10)).unwrap();
        assert_eq!(
            output(&chan),
            vec![(0, ALL_SOUND_OFF_CHANNEL_0.to_vec()), (0, NOTE_ON_62.to_vec())]
        );
        assert_eq!(chan.n_notes_active(), 1);
    }

    #[test]
    fn test_contiguous_playback_continues_cursor() {
        let mut chan = channel();
        chan.set_contents(
            &[MidiWireEvent::new(1, &NOTE_ON_60), MidiWireEvent::new(5, &NOTE_OFF_60)],
            8,
        );
        chan.proc_set_playback_buffer(MidiBuffer::new(4));
        chan.proc_process(&cycle(LoopMode::Playing, 4, 0, 8)).unwrap();
        chan.proc_set_playback_buffer(MidiBuffer::new(4));
        chan.proc_process(&cycle(LoopMode::Playing, 4, 4, 8)).unwrap();
        assert_eq!(output(&chan), vec![(1, NOTE_OFF_60.to_vec())]);
    }

    #[test]
    fn test_start_state_restored_before_first_message() {
        let mut chan = channel();
        chan.set_contents(
            &[
                MidiWireEvent::new(-1, &[0xB0, 7, 100]),
                MidiWireEvent::new(4, &NOTE_ON_60),
            ],
            8,
        );
        chan.proc_set_playback_buffer(MidiBuffer::new(8));
        chan.proc_process(&cycle(LoopMode::Playing, 8, 0, 8)).unwrap();
        assert_eq!(
            output(&chan),
            vec![(4, vec![0xB0, 7, 100]), (4, NOTE_ON_60.to_vec())]
        );
    }

    #[test]
    fn test_start_state_waits_for_cycle_with_first_message() {
        let mut chan = channel();
        chan.set_contents(
            &[
                MidiWireEvent::new(-1, &[0xB0, 7, 100]),
                MidiWireEvent::new(6, &NOTE_ON_60),
            ],
            8,
        );
        chan.proc_set_playback_buffer(MidiBuffer::new(4));
        chan.proc_process(&cycle(LoopMode::Playing, 4, 0, 8)).unwrap();
        assert_eq!(output(&chan), vec![]);

        chan.proc_set_playback_buffer(MidiBuffer::new(4));
        chan.proc_process(&cycle(LoopMode::Playing, 4, 4, 8)).unwrap();
        assert_eq!(
            output(&chan),
            vec![(2, vec![0xB0, 7, 100]), (2, NOTE_ON_60.to_vec())]
        );
    }

    #[test]
    fn test_skipped_messages_feed_restored_state() {
        let mut chan = channel();
        chan.set_contents(
            &[
                MidiWireEvent::new(1, &[0xC0, 5]),
                MidiWireEvent::new(6, &NOTE_ON_60),
            ],
            8,
        );
        // Start past the program change: it is restored with the note.
        chan.proc_set_playback_buffer(MidiBuffer::new(4));
        chan.proc_process(&cycle(LoopMode::Playing, 4, 4, 8)).unwrap();
        assert_eq!(output(&chan), vec![(2, vec![0xC0, 5]), (2, NOTE_ON_60.to_vec())]);
    }

    #[test]
    fn test_set_and_retrieve_contents() {
        let mut chan = channel();
        let contents = vec![
            MidiWireEvent::new(-1, &[0xB0, 7, 100]),
            MidiWireEvent::new(0, &NOTE_ON_60),
            MidiWireEvent::new(3, &NOTE_OFF_60),
        ];
        let before = chan.data_seq_nr();
        chan.set_contents(&contents, 8);
        assert_eq!(chan.length(), 8);
        assert!(chan.data_seq_nr() > before);

        let seq = chan.data_seq_nr();
        assert_eq!(chan.retrieve_contents(), contents);
        assert_eq!(chan.data_seq_nr(), seq);

        chan.clear();
        assert!(chan.retrieve_contents().is_empty());
        assert_eq!(chan.length(), 0);
        assert!(chan.data_seq_nr() > seq);
    }

    #[test]
    fn test_recording_captures_start_state() {
        let mut chan = channel();
        chan.proc_set_recording_buffer(input(8, &[(1, &[0xB1, 10, 40]), (3, &NOTE_ON_60)]));
        chan.proc_process(&cycle(LoopMode::Stopped, 2, 0, 0)).unwrap();
        assert_eq!(chan.input_state().cc_value(1, 10), Some(40));
        chan.proc_process(&cycle(LoopMode::Recording, 6, 0, 0)).unwrap();

        assert_eq!(
            chan.retrieve_contents(),
            vec![
                MidiWireEvent::new(-1, &[0xB1, 10, 40]),
                MidiWireEvent::new(1, &NOTE_ON_60),
            ]
        );
    }

    #[test]
    fn test_prerecord_is_promoted() {
        let mut chan = channel();
        chan.proc_set_recording_buffer(input(8, &[(1, &NOTE_ON_60), (5, &NOTE_OFF_60)]));
        let mut pre = cycle(LoopMode::Stopped, 3, 0, 0);
        pre.next = Some(NextMode {
            mode: LoopMode::Recording,
            delay: 0,
            eta: Some(3),
        });
        chan.proc_process(&pre).unwrap();
        assert_eq!(chan.n_events(), 0);

        chan.proc_process(&cycle(LoopMode::Recording, 5, 0, 0)).unwrap();
        assert_eq!(chan.start_offset(), 3);
        assert_eq!(chan.length(), 8);
        assert_eq!(
            chan.retrieve_contents(),
            vec![MidiWireEvent::new(1, &NOTE_ON_60), MidiWireEvent::new(5, &NOTE_OFF_60)]
        );
    }

    #[test]
    fn test_set_length_truncates() {
        let mut chan = channel();
        chan.set_contents(
            &[MidiWireEvent::new(1, &NOTE_ON_60), MidiWireEvent::new(5, &NOTE_OFF_60)],
            8,
        );
        chan.proc_set_length(4);
        assert_eq!(chan.length(), 4);
        assert_eq!(chan.retrieve_contents(), vec![MidiWireEvent::new(1, &NOTE_ON_60)]);
    }

    #[test]
    fn test_missing_buffers_are_errors() {
        let mut chan = channel();
        assert_eq!(
            chan.proc_process(&cycle(LoopMode::Playing, 4, 0, 8)),
            Err(EngineError::MissingBuffer(BufferKind::Playback))
        );
        chan.proc_set_recording_buffer(MidiBuffer::new(2));
        assert_eq!(
            chan.proc_process(&cycle(LoopMode::Recording, 4, 0, 0)),
            Err(EngineError::BufferTooSmall {
                kind: BufferKind::Recording,
                available: 2,
                requested: 4
            })
        );
    }

    #[test]
    fn test_next_poi() {
        let mut chan = channel();
        assert_eq!(chan.proc_get_next_poi(LoopMode::Playing, None, 8, 0), None);
        chan.proc_set_playback_buffer(MidiBuffer::new(16));
        assert_eq!(chan.proc_get_next_poi(LoopMode::Playing, None, 8, 0), Some(16));
        assert_eq!(chan.proc_get_next_poi(LoopMode::Recording, None, 8, 0), None);
    }

    #[test]
    fn test_handle_contents_from_other_thread() {
        let mut chan = channel();
        let handle = chan.handle();
        let contents = vec![
            MidiWireEvent::new(-1, &[0xC2, 9]),
            MidiWireEvent::new(10, &NOTE_ON_60),
        ];
        let expected = contents.clone();
        let worker = thread::spawn(move || {
            handle.set_contents(&contents, 20).unwrap();
            handle.retrieve_contents().unwrap()
        });
        while !worker.is_finished() {
            chan.proc_handle_command_queue();
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(worker.join().unwrap(), expected);
        assert_eq!(chan.length(), 20);
    }
}
