// src/midi/state_diff.rs
// Incremental difference between two MIDI state trackers

use super::state_tracker::{MidiStateTracker, StateChange};
use super::{MidiMessage, CHANNEL_PRESSURE, CONTROL_CHANGE, NOTE_ON, PITCH_WHEEL, PROGRAM_CHANGE};

/// One bit per `(status, data byte)` key, status 0x80..=0xFF.
const DIFF_WORDS: usize = 128 * 128 / 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffSide {
    A,
    B,
}

/// What to do with the diff set when building a tracker pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffAction {
    /// Compare both trackers fully.
    ScanDiff,
    /// Start from an empty diff.
    ClearDiff,
    /// Leave the diff as it is.
    Keep,
}

fn key_index(status: u8, byte: u8) -> usize {
    (((status - 0x80) as usize) << 7) | (byte & 0x7F) as usize
}

fn key_of(change: &StateChange) -> (u8, u8) {
    match *change {
        StateChange::Note { channel, note, .. } => (NOTE_ON | channel, note),
        StateChange::Cc {
            channel,
            controller,
            ..
        } => (CONTROL_CHANGE | channel, controller),
        StateChange::Program { channel, .. } => (PROGRAM_CHANGE | channel, 0),
        StateChange::Pressure { channel, .. } => (CHANNEL_PRESSURE | channel, 0),
        StateChange::PitchWheel { channel, .. } => (PITCH_WHEEL | channel, 0),
    }
}

/// Whether `a` and `b` both track the group `status` belongs to and
/// disagree on its value for `byte`.
fn differs(a: &MidiStateTracker, b: &MidiStateTracker, status: u8, byte: u8) -> bool {
    let channel = status & 0x0F;
    match status & 0xF0 {
        NOTE_ON => {
            a.tracking_notes()
                && b.tracking_notes()
                && a.note_velocity(channel, byte) != b.note_velocity(channel, byte)
        }
        CONTROL_CHANGE => {
            a.tracking_controls()
                && b.tracking_controls()
                && a.cc_value(channel, byte) != b.cc_value(channel, byte)
        }
        PROGRAM_CHANGE => {
            a.tracking_programs() && b.tracking_programs() && a.program(channel) != b.program(channel)
        }
        CHANNEL_PRESSURE => {
            a.tracking_controls()
                && b.tracking_controls()
                && a.pressure(channel) != b.pressure(channel)
        }
        PITCH_WHEEL => {
            a.tracking_controls()
                && b.tracking_controls()
                && a.pitch_wheel(channel) != b.pitch_wheel(channel)
        }
        _ => false,
    }
}

/// The message that moves a tracker to `from`'s value for one key.
fn corrective_message(from: &MidiStateTracker, status: u8, byte: u8) -> Option<MidiMessage> {
    let channel = status & 0x0F;
    match status & 0xF0 {
        NOTE_ON => Some(match from.note_velocity(channel, byte) {
            Some(velocity) => MidiMessage::NoteOn {
                channel,
                note: byte,
                velocity,
            },
            None => MidiMessage::NoteOff {
                channel,
                note: byte,
            },
        }),
        CONTROL_CHANGE => from.cc_value(channel, byte).map(|value| MidiMessage::ControlChange {
            channel,
            controller: byte,
            value,
        }),
        PROGRAM_CHANGE => from
            .program(channel)
            .map(|program| MidiMessage::ProgramChange { channel, program }),
        CHANNEL_PRESSURE => from
            .pressure(channel)
            .map(|value| MidiMessage::ChannelPressure { channel, value }),
        PITCH_WHEEL => from
            .pitch_wheel(channel)
            .map(|value| MidiMessage::PitchWheel { channel, value }),
        _ => None,
    }
}

/// Two trackers and the set of keys on which they currently disagree.
///
/// Messages must be fed through `process_a` / `process_b` so that the diff
/// stays current; each message costs O(1) per changed field. The diff lives
/// in a fixed bitmap, so nothing here allocates after construction.
#[derive(Debug, Clone)]
pub struct MidiStateDiffTracker {
    a: MidiStateTracker,
    b: MidiStateTracker,
    diff: [u64; DIFF_WORDS],
}

impl MidiStateDiffTracker {
    pub fn new(a: MidiStateTracker, b: MidiStateTracker, action: DiffAction) -> Self {
        let mut tracker = Self {
            a,
            b,
            diff: [0; DIFF_WORDS],
        };
        if action == DiffAction::ScanDiff {
            tracker.rescan_diff();
        }
        tracker
    }

    pub fn a(&self) -> &MidiStateTracker {
        &self.a
    }

    pub fn b(&self) -> &MidiStateTracker {
        &self.b
    }

    fn set_key(&mut self, status: u8, byte: u8, differs: bool) {
        set_bit(&mut self.diff, key_index(status, byte), differs);
    }

    pub fn process_a(&mut self, data: &[u8]) {
        self.process(DiffSide::A, data);
    }

    pub fn process_b(&mut self, data: &[u8]) {
        self.process(DiffSide::B, data);
    }

    fn process(&mut self, side: DiffSide, data: &[u8]) {
        let Self { a, b, diff } = self;
        let (changed, other) = match side {
            DiffSide::A => (a, &*b),
            DiffSide::B => (b, &*a),
        };
        changed.process_msg_with(data, |change| {
            let (status, byte) = key_of(&change);
            let differs = match change {
                StateChange::Note { velocity, .. } => {
                    other.tracking_notes() && other.note_velocity(status & 0x0F, byte) != velocity
                }
                StateChange::Cc { value, .. } => {
                    other.tracking_controls() && other.cc_value(status & 0x0F, byte) != Some(value)
                }
                StateChange::Program { program, .. } => {
                    other.tracking_programs() && other.program(status & 0x0F) != Some(program)
                }
                StateChange::Pressure { value, .. } => {
                    other.tracking_controls() && other.pressure(status & 0x0F) != Some(value)
                }
                StateChange::PitchWheel { value, .. } => {
                    other.tracking_controls() && other.pitch_wheel(status & 0x0F) != Some(value)
                }
            };
            set_bit(diff, key_index(status, byte), differs);
        });
    }

    /// Load new state into both sides (as far as each side tracks it) and
    /// rescan. Does not allocate.
    pub fn reset_sides(&mut self, a: &MidiStateTracker, b: &MidiStateTracker) {
        self.a.copy_relevant_state(a);
        self.b.copy_relevant_state(b);
        self.rescan_diff();
    }

    /// Recompute the diff from scratch.
    pub fn rescan_diff(&mut self) {
        self.diff = [0; DIFF_WORDS];
        for channel in 0..16u8 {
            for byte in 0..128u8 {
                for status in [NOTE_ON | channel, CONTROL_CHANGE | channel] {
                    if differs(&self.a, &self.b, status, byte) {
                        self.set_key(status, byte, true);
                    }
                }
            }
            for status in [
                PROGRAM_CHANGE | channel,
                CHANNEL_PRESSURE | channel,
                PITCH_WHEEL | channel,
            ] {
                if differs(&self.a, &self.b, status, 0) {
                    self.set_key(status, 0, true);
                }
            }
        }
    }

    pub fn clear_diff(&mut self) {
        self.diff = [0; DIFF_WORDS];
    }

    /// Differing `(status | channel, byte)` keys in ascending order.
    pub fn get_diff(&self) -> Vec<[u8; 2]> {
        let mut keys = Vec::new();
        for_each_key(&self.diff, |status, byte| keys.push([status, byte]));
        keys
    }

    pub fn set_diff(&mut self, keys: &[[u8; 2]]) {
        self.clear_diff();
        for &[status, byte] in keys {
            if status >= 0x80 {
                self.set_key(status, byte, true);
            }
        }
    }

    /// Emit, for every differing key, the message that makes `side` match
    /// the other tracker, and apply it to `side`. Afterwards the diff is
    /// empty.
    pub fn resolve_to<F>(&mut self, side: DiffSide, mut send: F)
    where
        F: FnMut(&[u8]),
    {
        let diff = self.diff;
        for_each_key(&diff, |status, byte| {
            let from = match side {
                DiffSide::A => &self.b,
                DiffSide::B => &self.a,
            };
            let Some(msg) = corrective_message(from, status, byte) else {
                return;
            };
            let (bytes, len) = msg.encode();
            log::trace!("resolving {:02x} {:02x} with {:02x?}", status, byte, &bytes[..len]);
            send(&bytes[..len]);
            self.process(side, &bytes[..len]);
        });
    }
}

fn set_bit(diff: &mut [u64; DIFF_WORDS], idx: usize, on: bool) {
    let mask = 1u64 << (idx % 64);
    if on {
        diff[idx / 64] |= mask;
    } else {
        diff[idx / 64] &= !mask;
    }
}

fn for_each_key<F>(diff: &[u64; DIFF_WORDS], mut f: F)
where
    F: FnMut(u8, u8),
{
    for (word_idx, &word) in diff.iter().enumerate() {
        let mut bits = word;
        while bits != 0 {
            let idx = word_idx * 64 + bits.trailing_zeros() as usize;
            bits &= bits - 1;
            f((0x80 + (idx >> 7)) as u8, (idx & 0x7F) as u8);
        }
    }
}
