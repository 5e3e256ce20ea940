// src/looper/basic_loop.rs
// Loop state machine: mode, position, length, planned transitions and sync

use std::collections::VecDeque;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use super::channel::{Channel, LoopChannel, NextMode, ProcessCycle};
use super::LoopMode;
use crate::command_queue::CommandQueue;
use crate::config::{CommandQueueConfig, EngineConfig};
use crate::error::{EngineError, Result};

/// Reasons a loop has to stop processing at some sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PoiFlags(u8);

impl PoiFlags {
    pub const NONE: Self = Self(0);
    /// A trigger planned with `proc_plan_trigger`.
    pub const TRIGGER: Self = Self(1);
    pub const LOOP_END: Self = Self(2);
    /// A channel's bound buffer runs out.
    pub const CHANNEL_POI: Self = Self(4);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for PoiFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PoiFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointOfInterest {
    /// Samples from now.
    pub when: u32,
    pub flags: PoiFlags,
}

/// The earlier of two POIs. Simultaneous POIs merge their flags.
pub fn dominant_poi(a: Option<PointOfInterest>, b: Option<PointOfInterest>) -> Option<PointOfInterest> {
    match (a, b) {
        (Some(a), Some(b)) if a.when == b.when => Some(PointOfInterest {
            when: a.when,
            flags: a.flags | b.flags,
        }),
        (Some(a), Some(b)) => Some(if a.when < b.when { a } else { b }),
        (a, None) => a,
        (None, b) => b,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlannedTransition {
    mode: LoopMode,
    countdown: i64,
}

/// Loop state readable from any thread. Only the processing thread writes.
#[derive(Debug)]
struct LoopShared {
    mode: AtomicU8,
    position: AtomicU32,
    length: AtomicU32,
    triggering_now: AtomicBool,
    next_planned_mode: AtomicU8,   // LoopMode::Invalid: none
    next_planned_delay: AtomicI32, // -1: none
    next_trigger_eta: AtomicI64,   // -1: unknown
}

impl LoopShared {
    fn new() -> Self {
        Self {
            mode: AtomicU8::new(LoopMode::Stopped as u8),
            position: AtomicU32::new(0),
            length: AtomicU32::new(0),
            triggering_now: AtomicBool::new(false),
            next_planned_mode: AtomicU8::new(LoopMode::Invalid as u8),
            next_planned_delay: AtomicI32::new(-1),
            next_trigger_eta: AtomicI64::new(-1),
        }
    }

    fn mode(&self) -> LoopMode {
        LoopMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    fn position(&self) -> u32 {
        self.position.load(Ordering::Acquire)
    }

    fn length(&self) -> u32 {
        self.length.load(Ordering::Acquire)
    }

    fn is_triggering_now(&self) -> bool {
        self.triggering_now.load(Ordering::Acquire)
    }

    fn next_trigger_eta(&self) -> Option<u32> {
        u32::try_from(self.next_trigger_eta.load(Ordering::Acquire)).ok()
    }

    fn first_planned_transition(&self) -> Option<(LoopMode, u32)> {
        let mode = LoopMode::from_u8(self.next_planned_mode.load(Ordering::Acquire));
        let delay = u32::try_from(self.next_planned_delay.load(Ordering::Acquire)).ok()?;
        (mode != LoopMode::Invalid).then_some((mode, delay))
    }
}

/// A loop: a mode, a position within a length, and the channels that
/// record and play back content along with it.
///
/// Driving contract per cycle: bind channel buffers, `proc_update_poi`,
/// then `proc_process` in steps never longer than `proc_get_next_poi`,
/// each followed by `proc_handle_poi` and `proc_handle_sync`.
/// `process_loops` does this for a set of loops.
pub struct BasicLoop {
    shared: Arc<LoopShared>,
    commands: Arc<CommandQueue<BasicLoop>>,
    next_poi: Option<PointOfInterest>,
    next_trigger_eta: Option<u32>,
    planned_trigger: Option<u32>,
    planned: VecDeque<PlannedTransition>,
    sync_source: Option<Weak<LoopShared>>,
    already_triggered: bool,
    channels: Vec<Channel>,
}

impl BasicLoop {
    pub fn new(commands: &CommandQueueConfig) -> Self {
        Self {
            shared: Arc::new(LoopShared::new()),
            commands: Arc::new(CommandQueue::new(commands)),
            next_poi: None,
            next_trigger_eta: None,
            planned_trigger: None,
            planned: VecDeque::with_capacity(16),
            sync_source: None,
            already_triggered: false,
            channels: Vec::with_capacity(8),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.loop_commands)
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
            commands: Arc::clone(&self.commands),
        }
    }

    /// Run queued commands. The POI is recomputed when any ran, so it
    /// always reflects the state the next `proc_process` works on.
    pub fn proc_handle_command_queue(&mut self) {
        let commands = Arc::clone(&self.commands);
        let n = commands.proc_exec_all(self);
        if n > 0 {
            log::trace!("loop executed {} commands", n);
            self.proc_update_poi();
        }
    }

    pub fn mode(&self) -> LoopMode {
        self.shared.mode()
    }

    pub fn position(&self) -> u32 {
        self.shared.position()
    }

    pub fn length(&self) -> u32 {
        self.shared.length()
    }

    fn store_mode(&self, mode: LoopMode) {
        self.shared.mode.store(mode as u8, Ordering::Release);
    }

    fn store_position(&self, position: u32) {
        self.shared.position.store(position, Ordering::Release);
    }

    fn store_length(&self, length: u32) {
        self.shared.length.store(length, Ordering::Release);
    }

    fn set_triggering_now(&self, value: bool) {
        self.shared.triggering_now.store(value, Ordering::Release);
    }

    pub fn proc_get_next_poi(&self) -> Option<u32> {
        self.next_poi.map(|poi| poi.when)
    }

    pub fn next_poi(&self) -> Option<PointOfInterest> {
        self.next_poi
    }

    pub fn proc_predicted_next_trigger_eta(&self) -> Option<u32> {
        self.next_trigger_eta
    }

    /// Whether this loop triggered during the current cycle and wants its
    /// followers to trigger as well.
    pub fn proc_is_triggering_now(&self) -> bool {
        self.shared.is_triggering_now()
    }

    fn sync_source(&self) -> Option<Arc<LoopShared>> {
        self.sync_source.as_ref().and_then(Weak::upgrade)
    }

    pub fn has_sync_source(&self) -> bool {
        self.sync_source().is_some()
    }

    pub fn set_sync_source(&mut self, source: Option<&LoopHandle>) {
        self.set_sync_source_shared(source.map(|s| Arc::downgrade(&s.shared)));
    }

    fn set_sync_source_shared(&mut self, source: Option<Weak<LoopShared>>) {
        self.sync_source = source;
        self.proc_update_trigger_eta();
    }

    fn set_next_trigger_eta(&mut self, eta: Option<u32>) {
        self.next_trigger_eta = eta;
        self.shared
            .next_trigger_eta
            .store(eta.map_or(-1, i64::from), Ordering::Release);
    }

    pub fn proc_update_trigger_eta(&mut self) {
        let (mode, position, length) = (self.mode(), self.position(), self.length());
        let own = (mode.is_playing() && position < length).then(|| length - position);
        let from_source = self.sync_source().and_then(|s| s.next_trigger_eta());
        let eta = match (own, from_source) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.set_next_trigger_eta(eta);
    }

    /// The first planned transition as channels see it.
    fn next_mode(&self) -> Option<NextMode> {
        self.planned.front().map(|p| NextMode {
            mode: p.mode,
            delay: p.countdown.max(0) as u32,
            eta: self.next_trigger_eta,
        })
    }

    fn update_planned_transition_cache(&self) {
        let (mode, delay) = self
            .planned
            .front()
            .map_or((LoopMode::Invalid, -1), |p| (p.mode, p.countdown as i32));
        self.shared.next_planned_mode.store(mode as u8, Ordering::Release);
        self.shared.next_planned_delay.store(delay, Ordering::Release);
    }

    /// Recompute the next POI from loop end, a planned trigger and the
    /// channels. A POI planned as a trigger is kept.
    pub fn proc_update_poi(&mut self) {
        if self.mode().is_playing() && self.length() == 0 {
            self.proc_handle_transition(LoopMode::Stopped);
        }

        let mut poi = self.next_poi.and_then(|mut p| {
            p.flags.remove(PoiFlags::LOOP_END | PoiFlags::CHANNEL_POI);
            (!p.flags.is_empty()).then_some(p)
        });

        let (mode, position, length) = (self.mode(), self.position(), self.length());
        if mode.is_playing() && position < length {
            poi = dominant_poi(
                poi,
                Some(PointOfInterest {
                    when: length - position,
                    flags: PoiFlags::LOOP_END,
                }),
            );
        }
        if let Some(when) = self.planned_trigger {
            poi = dominant_poi(
                poi,
                Some(PointOfInterest {
                    when,
                    flags: PoiFlags::TRIGGER,
                }),
            );
        }

        let next = self.next_mode();
        for channel in &self.channels {
            let channel_poi = channel
                .proc_get_next_poi(mode, next, length, position)
                .map(|when| PointOfInterest {
                    when,
                    flags: PoiFlags::CHANNEL_POI,
                });
            poi = dominant_poi(poi, channel_poi);
        }
        self.next_poi = poi;
    }

    /// Ask for a trigger `when` samples from now.
    pub fn proc_plan_trigger(&mut self, when: u32) {
        self.planned_trigger = Some(when);
        self.proc_update_poi();
    }

    /// Handle the POI if it is reached right now.
    pub fn proc_handle_poi(&mut self) {
        let Some(poi) = self.next_poi.filter(|p| p.when == 0) else {
            return;
        };

        if poi.flags.contains(PoiFlags::TRIGGER) {
            self.planned_trigger = None;
            self.proc_trigger(true);
        }
        if poi.flags.contains(PoiFlags::LOOP_END) {
            self.store_position(0);
            let source_playing = self.sync_source().is_some_and(|s| s.mode().is_playing());
            if !source_playing {
                self.proc_trigger(true);
            }
        }
        self.next_poi = None;

        let (mode, length, position) = (self.mode(), self.length(), self.position());
        for channel in self.channels.iter_mut() {
            channel.proc_handle_poi(mode, length, position);
        }
        self.proc_update_poi();
        self.proc_update_trigger_eta();
    }

    /// Drain the command queue, then process `n_samples`. Commands may move
    /// the POI closer; processing past it is refused before anything moves.
    pub fn proc_process(&mut self, n_samples: u32) -> Result<()> {
        self.proc_handle_command_queue();
        self.proc_process_drained(n_samples)
    }

    /// `proc_process` for a driver that has just drained the queue itself.
    pub(crate) fn proc_process_drained(&mut self, n_samples: u32) -> Result<()> {
        if n_samples == 0 {
            return Err(EngineError::ZeroSamples);
        }
        if let Some(poi) = self.next_poi.filter(|p| n_samples > p.when) {
            return Err(EngineError::ProcessPastPoi {
                requested: n_samples,
                allowed: poi.when,
            });
        }

        self.set_triggering_now(false);
        self.already_triggered = false;

        let mode = self.mode();
        let (pos_before, length_before) = (self.position(), self.length());
        let (mut pos_after, mut length_after) = (pos_before, length_before);
        let mut channel_mode = mode;
        match mode {
            LoopMode::Recording => length_after += n_samples,
            LoopMode::Replacing => {
                pos_after += n_samples;
                length_after = length_after.max(pos_after);
            }
            LoopMode::Playing | LoopMode::PlayingDryThroughWet | LoopMode::RecordingDryIntoWet => {
                pos_after = (pos_after + n_samples).min(length_after);
                if pos_after == pos_before {
                    channel_mode = LoopMode::Stopped;
                }
            }
            _ => {}
        }

        let next = self.next_mode().map(|n| NextMode {
            eta: if n.delay == 0 { n.eta } else { None },
            ..n
        });
        let cycle = ProcessCycle {
            mode: channel_mode,
            next,
            n_samples,
            pos_before,
            pos_after,
            length_before,
            length_after,
        };
        for channel in self.channels.iter_mut() {
            channel.proc_process(&cycle)?;
        }

        if let Some(poi) = self.next_poi.as_mut() {
            poi.when = poi.when.saturating_sub(n_samples);
        }
        if let Some(when) = self.planned_trigger.as_mut() {
            *when = when.saturating_sub(n_samples);
        }
        self.store_position(pos_after);
        self.store_length(length_after);
        let eta = self
            .next_trigger_eta
            .map(|eta| eta.saturating_sub(n_samples))
            .filter(|&eta| eta > 0);
        self.set_next_trigger_eta(eta);
        Ok(())
    }

    /// Trigger at most once per cycle: count down planned transitions and
    /// apply those that are due.
    pub fn proc_trigger(&mut self, propagate: bool) {
        if self.already_triggered {
            return;
        }
        self.already_triggered = true;
        if propagate {
            self.set_triggering_now(true);
        }

        if self.mode().is_playing() && self.position() >= self.length() {
            self.store_position(0);
        }

        for planned in self.planned.iter_mut() {
            planned.countdown -= 1;
        }
        while let Some(planned) = self.planned.front().copied().filter(|p| p.countdown < 0) {
            self.planned.pop_front();
            log::debug!("applying planned transition to {:?}", planned.mode);
            self.proc_handle_transition(planned.mode);
        }
        self.update_planned_transition_cache();
    }

    /// Trigger if the sync source triggered this cycle. Returns whether
    /// this call triggered the loop.
    pub fn proc_handle_sync(&mut self) -> bool {
        let source_triggering = self.sync_source().is_some_and(|s| s.is_triggering_now());
        if source_triggering && !self.already_triggered {
            self.proc_trigger(true);
            return true;
        }
        false
    }

    pub fn proc_handle_transition(&mut self, mode: LoopMode) {
        let current = self.mode();
        if current == mode {
            return;
        }
        log::debug!("loop transition {:?} -> {:?}", current, mode);
        if !(current.is_playing() && mode.is_playing()) {
            self.set_position(0);
        }
        if mode == LoopMode::Recording {
            // Channels are not cleared: recording overwrites from the start.
            self.set_length(0);
        }
        self.store_mode(mode);
        if mode == LoopMode::Stopped {
            self.store_position(0);
        }
        if mode.is_playing() && self.position() == 0 {
            self.set_triggering_now(true);
        }
        self.next_poi = None;
        self.proc_update_poi();
        self.proc_update_trigger_eta();
    }

    /// Plan a transition after `delay` more triggers.
    ///
    /// Applies right away when `wait_for_sync` is false or when the loop has
    /// no sync source. The second case holds for every target mode,
    /// Playing included: an unsynced loop never receives a trigger, so a
    /// queued transition would never fire.
    pub fn plan_transition(&mut self, mode: LoopMode, delay: u32, wait_for_sync: bool) {
        if !wait_for_sync || !self.has_sync_source() {
            self.planned.clear();
            self.proc_handle_transition(mode);
        } else {
            let entry = PlannedTransition {
                mode,
                countdown: delay as i64,
            };
            match self.planned.iter().position(|p| p.countdown >= entry.countdown) {
                Some(idx) => {
                    self.planned[idx] = entry;
                    self.planned.truncate(idx + 1);
                }
                None => self.planned.push_back(entry),
            }
        }
        self.update_planned_transition_cache();
        self.proc_update_trigger_eta();
    }

    pub fn clear_planned_transitions(&mut self) {
        self.planned.clear();
        self.update_planned_transition_cache();
    }

    pub fn n_planned_transitions(&self) -> usize {
        self.planned.len()
    }

    /// Mode and remaining delay of the planned transition at `idx`.
    pub fn planned_transition(&self, idx: usize) -> Result<(LoopMode, u32)> {
        self.planned
            .get(idx)
            .map(|p| (p.mode, p.countdown.max(0) as u32))
            .ok_or(EngineError::TransitionOutOfRange {
                index: idx,
                len: self.planned.len(),
            })
    }

    pub fn first_planned_transition(&self) -> Option<(LoopMode, u32)> {
        self.shared.first_planned_transition()
    }

    pub fn set_position(&mut self, position: u32) {
        if position == self.position() {
            return;
        }
        self.next_poi = None;
        self.set_next_trigger_eta(None);
        self.store_position(position);
        self.proc_update_poi();
        self.proc_update_trigger_eta();
    }

    /// Set the length. A position past the new end moves to its last
    /// sample.
    pub fn set_length(&mut self, length: u32) {
        if length == self.length() {
            return;
        }
        self.store_length(length);
        if self.position() >= length {
            self.set_position(length.saturating_sub(1));
        }
        self.next_poi = None;
        self.set_next_trigger_eta(None);
        self.proc_update_poi();
        self.proc_update_trigger_eta();
    }

    pub fn set_mode(&mut self, mode: LoopMode) {
        self.proc_handle_transition(mode);
    }

    pub fn add_channel(&mut self, channel: impl Into<Channel>) -> usize {
        self.channels.push(channel.into());
        self.proc_update_poi();
        self.channels.len() - 1
    }

    pub fn remove_channel(&mut self, idx: usize) -> Result<Channel> {
        if idx >= self.channels.len() {
            return Err(EngineError::NoSuchChannel(idx));
        }
        let channel = self.channels.remove(idx);
        self.proc_update_poi();
        Ok(channel)
    }

    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, idx: usize) -> Option<&Channel> {
        self.channels.get(idx)
    }

    pub fn channel_mut(&mut self, idx: usize) -> Option<&mut Channel> {
        self.channels.get_mut(idx)
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.channels.iter_mut()
    }
}

/// Thread-safe view of a `BasicLoop`. Reads come from atomics; changes run
/// on the processing thread at the start of its next cycle.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
    commands: Arc<CommandQueue<BasicLoop>>,
}

impl LoopHandle {
    pub fn mode(&self) -> LoopMode {
        self.shared.mode()
    }

    pub fn position(&self) -> u32 {
        self.shared.position()
    }

    pub fn length(&self) -> u32 {
        self.shared.length()
    }

    pub fn next_trigger_eta(&self) -> Option<u32> {
        self.shared.next_trigger_eta()
    }

    pub fn first_planned_transition(&self) -> Option<(LoopMode, u32)> {
        self.shared.first_planned_transition()
    }

    pub fn plan_transition(&self, mode: LoopMode, delay: u32, wait_for_sync: bool) -> Result<()> {
        self.commands
            .exec(move |lp: &mut BasicLoop| lp.plan_transition(mode, delay, wait_for_sync))?;
        Ok(())
    }

    pub fn set_mode(&self, mode: LoopMode) -> Result<()> {
        self.commands.exec(move |lp: &mut BasicLoop| lp.set_mode(mode))?;
        Ok(())
    }

    pub fn set_position(&self, position: u32) -> Result<()> {
        self.commands
            .exec(move |lp: &mut BasicLoop| lp.set_position(position))?;
        Ok(())
    }

    pub fn set_length(&self, length: u32) -> Result<()> {
        self.commands.exec(move |lp: &mut BasicLoop| lp.set_length(length))?;
        Ok(())
    }

    pub fn clear_planned_transitions(&self) -> Result<()> {
        self.commands
            .exec(|lp: &mut BasicLoop| lp.clear_planned_transitions())?;
        Ok(())
    }

    pub fn n_planned_transitions(&self) -> Result<usize> {
        Ok(self.commands.exec(|lp: &mut BasicLoop| lp.n_planned_transitions())?)
    }

    pub fn planned_transition(&self, idx: usize) -> Result<(LoopMode, u32)> {
        self.commands
            .exec(move |lp: &mut BasicLoop| lp.planned_transition(idx))?
    }

    pub fn set_sync_source(&self, source: Option<&LoopHandle>) -> Result<()> {
        let source = source.map(|s| Arc::downgrade(&s.shared));
        self.commands
            .exec(move |lp: &mut BasicLoop| lp.set_sync_source_shared(source))?;
        Ok(())
    }

    /// Hand a channel to the loop. Returns its index.
    pub fn add_channel(&self, channel: impl Into<Channel>) -> Result<usize> {
        let channel = channel.into();
        Ok(self.commands.exec(move |lp: &mut BasicLoop| lp.add_channel(channel))?)
    }

    /// Take a channel back out of the loop. It is freed on this thread.
    pub fn remove_channel(&self, idx: usize) -> Result<Channel> {
        self.commands
            .exec(move |lp: &mut BasicLoop| lp.remove_channel(idx))?
    }
}
