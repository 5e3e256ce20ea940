// src/midi/state_tracker.rs
// Tracks sounding notes and controller state of a MIDI stream

use super::{MidiMessage, CC_ALL_NOTES_OFF, CC_ALL_SOUND_OFF, PITCH_WHEEL_CENTER};

const N_CHANNELS: usize = 16;
const N_KEYS: usize = 128;

/// One field of tracked state that a message changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// `velocity` is `None` once the note is released.
    Note {
        channel: u8,
        note: u8,
        velocity: Option<u8>,
    },
    Cc {
        channel: u8,
        controller: u8,
        value: u8,
    },
    Program {
        channel: u8,
        program: u8,
    },
    PitchWheel {
        channel: u8,
        value: u16,
    },
    Pressure {
        channel: u8,
        value: u8,
    },
}

/// Note, controller, program, pitch wheel and channel pressure state of all
/// 16 channels. Each group is optional: notes, controls (CCs, pitch wheel,
/// pressure) and programs can be tracked independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiStateTracker {
    notes: Option<Box<[[Option<u8>; N_KEYS]; N_CHANNELS]>>,
    n_notes_active: usize,
    controls: Option<Box<[[u8; N_KEYS]; N_CHANNELS]>>,
    pitch_wheel: Option<[u16; N_CHANNELS]>,
    pressure: Option<[u8; N_CHANNELS]>,
    programs: Option<[u8; N_CHANNELS]>,
}

/// Controllers 120 and up are channel mode messages, not state.
fn is_channel_mode(controller: u8) -> bool {
    controller >= CC_ALL_SOUND_OFF
}

impl MidiStateTracker {
    pub fn new(track_notes: bool, track_controls: bool, track_programs: bool) -> Self {
        Self {
            notes: track_notes.then(|| Box::new([[None; N_KEYS]; N_CHANNELS])),
            n_notes_active: 0,
            controls: track_controls.then(|| Box::new([[0; N_KEYS]; N_CHANNELS])),
            pitch_wheel: track_controls.then_some([PITCH_WHEEL_CENTER; N_CHANNELS]),
            pressure: track_controls.then_some([0; N_CHANNELS]),
            programs: track_programs.then_some([0; N_CHANNELS]),
        }
    }

    pub fn tracking_notes(&self) -> bool {
        self.notes.is_some()
    }

    pub fn tracking_controls(&self) -> bool {
        self.controls.is_some()
    }

    pub fn tracking_programs(&self) -> bool {
        self.programs.is_some()
    }

    pub fn n_notes_active(&self) -> usize {
        self.n_notes_active
    }

    pub fn note_velocity(&self, channel: u8, note: u8) -> Option<u8> {
        self.notes
            .as_ref()
            .and_then(|n| n[channel as usize & 0x0F][note as usize & 0x7F])
    }

    pub fn cc_value(&self, channel: u8, controller: u8) -> Option<u8> {
        self.controls
            .as_ref()
            .map(|c| c[channel as usize & 0x0F][controller as usize & 0x7F])
    }

    pub fn program(&self, channel: u8) -> Option<u8> {
        self.programs.map(|p| p[channel as usize & 0x0F])
    }

    pub fn pitch_wheel(&self, channel: u8) -> Option<u16> {
        self.pitch_wheel.map(|p| p[channel as usize & 0x0F])
    }

    pub fn pressure(&self, channel: u8) -> Option<u8> {
        self.pressure.map(|p| p[channel as usize & 0x0F])
    }

    /// Back to defaults: no notes, controllers and programs at 0, pitch
    /// wheel centered. Tracking flags are kept.
    pub fn clear(&mut self) {
        if let Some(notes) = self.notes.as_mut() {
            **notes = [[None; N_KEYS]; N_CHANNELS];
        }
        self.n_notes_active = 0;
        if let Some(controls) = self.controls.as_mut() {
            **controls = [[0; N_KEYS]; N_CHANNELS];
        }
        if let Some(pitch) = self.pitch_wheel.as_mut() {
            *pitch = [PITCH_WHEEL_CENTER; N_CHANNELS];
        }
        if let Some(pressure) = self.pressure.as_mut() {
            *pressure = [0; N_CHANNELS];
        }
        if let Some(programs) = self.programs.as_mut() {
            *programs = [0; N_CHANNELS];
        }
    }

    /// Copy every group that both trackers track. Does not allocate.
    pub fn copy_relevant_state(&mut self, other: &MidiStateTracker) {
        if let (Some(mine), Some(theirs)) = (self.notes.as_mut(), other.notes.as_ref()) {
            **mine = **theirs;
            self.n_notes_active = other.n_notes_active;
        }
        if let (Some(mine), Some(theirs)) = (self.controls.as_mut(), other.controls.as_ref()) {
            **mine = **theirs;
        }
        if let (Some(mine), Some(theirs)) = (self.pitch_wheel.as_mut(), other.pitch_wheel) {
            *mine = theirs;
        }
        if let (Some(mine), Some(theirs)) = (self.pressure.as_mut(), other.pressure) {
            *mine = theirs;
        }
        if let (Some(mine), Some(theirs)) = (self.programs.as_mut(), other.programs) {
            *mine = theirs;
        }
    }

    pub fn process_msg(&mut self, data: &[u8]) {
        self.process_msg_with(data, |_| {});
    }

    /// Update state from one raw message, reporting each field that
    /// actually changed. Unknown or untracked messages are ignored.
    pub fn process_msg_with<F>(&mut self, data: &[u8], mut changed: F)
    where
        F: FnMut(StateChange),
    {
        let Some(msg) = MidiMessage::parse(data) else {
            return;
        };
        match msg {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => self.set_note(channel, note, Some(velocity), &mut changed),
            MidiMessage::NoteOff { channel, note } => {
                self.set_note(channel, note, None, &mut changed)
            }
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => {
                if controller == CC_ALL_NOTES_OFF || controller == CC_ALL_SOUND_OFF {
                    for note in 0..N_KEYS as u8 {
                        self.set_note(channel, note, None, &mut changed);
                    }
                }
                if is_channel_mode(controller) {
                    return;
                }
                if let Some(controls) = self.controls.as_mut() {
                    let slot = &mut controls[channel as usize][controller as usize];
                    if *slot != value {
                        *slot = value;
                        changed(StateChange::Cc {
                            channel,
                            controller,
                            value,
                        });
                    }
                }
            }
            MidiMessage::ProgramChange { channel, program } => {
                if let Some(programs) = self.programs.as_mut() {
                    if programs[channel as usize] != program {
                        programs[channel as usize] = program;
                        changed(StateChange::Program { channel, program });
                    }
                }
            }
            MidiMessage::ChannelPressure { channel, value } => {
                if let Some(pressure) = self.pressure.as_mut() {
                    if pressure[channel as usize] != value {
                        pressure[channel as usize] = value;
                        changed(StateChange::Pressure { channel, value });
                    }
                }
            }
            MidiMessage::PitchWheel { channel, value } => {
                if let Some(pitch) = self.pitch_wheel.as_mut() {
                    if pitch[channel as usize] != value {
                        pitch[channel as usize] = value;
                        changed(StateChange::PitchWheel { channel, value });
                    }
                }
            }
        }
    }

    fn set_note<F>(&mut self, channel: u8, note: u8, velocity: Option<u8>, changed: &mut F)
    where
        F: FnMut(StateChange),
    {
        let Some(notes) = self.notes.as_mut() else {
            return;
        };
        let slot = &mut notes[channel as usize][note as usize];
        if *slot == velocity {
            return;
        }
        match (slot.is_some(), velocity.is_some()) {
            (false, true) => self.n_notes_active += 1,
            (true, false) => self.n_notes_active -= 1,
            _ => {}
        }
        *slot = velocity;
        changed(StateChange::Note {
            channel,
            note,
            velocity,
        });
    }

    /// Messages that bring a default tracker into this state: controllers,
    /// programs, pressure and pitch wheel that differ from their defaults,
    /// then every sounding note.
    pub fn state_as_messages(&self) -> Vec<Vec<u8>> {
        let mut msgs = Vec::new();
        let mut push = |msg: MidiMessage| {
            let (bytes, len) = msg.encode();
            msgs.push(bytes[..len].to_vec());
        };
        for channel in 0..N_CHANNELS as u8 {
            let ch = channel as usize;
            if let Some(controls) = self.controls.as_ref() {
                for (controller, &value) in controls[ch].iter().enumerate() {
                    if value != 0 {
                        push(MidiMessage::ControlChange {
                            channel,
                            controller: controller as u8,
                            value,
                        });
                    }
                }
            }
            if let Some(program) = self.program(channel).filter(|&p| p != 0) {
                push(MidiMessage::ProgramChange { channel, program });
            }
            if let Some(value) = self.pressure(channel).filter(|&p| p != 0) {
                push(MidiMessage::ChannelPressure { channel, value });
            }
            if let Some(value) = self.pitch_wheel(channel).filter(|&p| p != PITCH_WHEEL_CENTER) {
                push(MidiMessage::PitchWheel { channel, value });
            }
        }
        if let Some(notes) = self.notes.as_ref() {
            for (ch, keys) in notes.iter().enumerate() {
                for (note, velocity) in keys.iter().enumerate() {
                    if let Some(velocity) = *velocity {
                        push(MidiMessage::NoteOn {
                            channel: ch as u8,
                            note: note as u8,
                            velocity,
                        });
                    }
                }
            }
        }
        msgs
    }
}

impl Default for MidiStateTracker {
    fn default() -> Self {
        Self::new(true, true, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changes(tracker: &mut MidiStateTracker, data: &[u8]) -> Vec<StateChange> {
        let mut out = Vec::new();
        tracker.process_msg_with(data, |c| out.push(c));
        out
    }

    #[test]
    fn test_note_tracking() {
        let mut tracker = MidiStateTracker::default();
        tracker.process_msg(&[0x90, 60, 100]);
        tracker.process_msg(&[0x91, 62, 80]);
        assert_eq!(tracker.n_notes_active(), 2);
        assert_eq!(tracker.note_velocity(0, 60), Some(100));

        // Velocity zero releases the note.
        tracker.process_msg(&[0x90, 60, 0]);
        assert_eq!(tracker.note_velocity(0, 60), None);
        assert_eq!(tracker.n_notes_active(), 1);
    }

    #[test]
    fn test_reports_only_changes() {
        let mut tracker = MidiStateTracker::default();
        assert_eq!(
            changes(&mut tracker, &[0xB2, 7, 90]),
            vec![StateChange::Cc {
                channel: 2,
                controller: 7,
                value: 90
            }]
        );
        assert!(changes(&mut tracker, &[0xB2, 7, 90]).is_empty());
        // Releasing a note that never sounded changes nothing.
        assert!(changes(&mut tracker, &[0x80, 10, 64]).is_empty());
        assert_eq!(
            changes(&mut tracker, &[0xE0, 0, 0x50]),
            vec![StateChange::PitchWheel {
                channel: 0,
                value: 0x50 << 7
            }]
        );
    }

    #[test]
    fn test_all_notes_off_clears_channel() {
        let mut tracker = MidiStateTracker::default();
        tracker.process_msg(&[0x90, 60, 100]);
        tracker.process_msg(&[0x90, 64, 100]);
        tracker.process_msg(&[0x91, 60, 100]);

        let released = changes(&mut tracker, &[0xB0, CC_ALL_NOTES_OFF, 0]);
        assert_eq!(released.len(), 2);
        assert_eq!(tracker.n_notes_active(), 1);
        assert_eq!(tracker.note_velocity(1, 60), Some(100));

        tracker.process_msg(&[0xB1, CC_ALL_SOUND_OFF, 0]);
        assert_eq!(tracker.n_notes_active(), 0);
        assert_eq!(tracker.cc_value(1, CC_ALL_SOUND_OFF), Some(0));
    }

    #[test]
    fn test_untracked_groups() {
        let mut tracker = MidiStateTracker::new(false, true, false);
        tracker.process_msg(&[0x90, 60, 100]);
        tracker.process_msg(&[0xC0, 5]);
        assert_eq!(tracker.n_notes_active(), 0);
        assert_eq!(tracker.note_velocity(0, 60), None);
        assert_eq!(tracker.program(0), None);
        tracker.process_msg(&[0xD3, 40]);
        assert_eq!(tracker.pressure(3), Some(40));
    }

    #[test]
    fn test_state_as_messages_rebuilds_state() {
        let mut tracker = MidiStateTracker::default();
        for msg in [
            vec![0xB0, 1, 64],
            vec![0xC2, 9],
            vec![0xE1, 0x10, 0x50],
            vec![0xD0, 33],
            vec![0x90, 60, 100],
        ] {
            tracker.process_msg(&msg);
        }
        let msgs = tracker.state_as_messages();
        assert_eq!(msgs.len(), 5);
        assert_eq!(msgs.last(), Some(&vec![0x90, 60, 100]));

        let mut rebuilt = MidiStateTracker::default();
        for msg in &msgs {
            rebuilt.process_msg(msg);
        }
        assert_eq!(rebuilt, tracker);
    }

    #[test]
    fn test_copy_relevant_state() {
        let mut source = MidiStateTracker::default();
        source.process_msg(&[0x90, 60, 100]);
        source.process_msg(&[0xB0, 7, 11]);

        let mut controls_only = MidiStateTracker::new(false, true, true);
        controls_only.copy_relevant_state(&source);
        assert_eq!(controls_only.cc_value(0, 7), Some(11));
        assert_eq!(controls_only.n_notes_active(), 0);

        source.clear();
        assert_eq!(source.n_notes_active(), 0);
        assert_eq!(source.cc_value(0, 7), Some(0));
        assert_eq!(source.pitch_wheel(0), Some(PITCH_WHEEL_CENTER));
    }
}
