pub mod buffer;
pub mod channel;
pub mod state_diff;
pub mod state_tracker;
pub mod storage;

pub use buffer::MidiBuffer;
pub use channel::{MidiChannel, MidiChannelHandle, MidiWireEvent};
pub use state_diff::{DiffAction, DiffSide, MidiStateDiffTracker};
pub use state_tracker::{MidiStateTracker, StateChange};
pub use storage::{CursorFindResult, MidiCursor, MidiRecord, MidiStorage, TruncateSide};

pub const NOTE_OFF: u8 = 0x80;
pub const NOTE_ON: u8 = 0x90;
pub const CONTROL_CHANGE: u8 = 0xB0;
pub const PROGRAM_CHANGE: u8 = 0xC0;
pub const CHANNEL_PRESSURE: u8 = 0xD0;
pub const PITCH_WHEEL: u8 = 0xE0;

pub const CC_ALL_SOUND_OFF: u8 = 120;
pub const CC_ALL_NOTES_OFF: u8 = 123;

pub const PITCH_WHEEL_CENTER: u16 = 0x2000;

/// All Sound Off on MIDI channel 0.
pub const ALL_SOUND_OFF_CHANNEL_0: [u8; 3] = [CONTROL_CHANGE, CC_ALL_SOUND_OFF, 0];

/// A channel voice message, decoded from raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, value: u8 },
    PitchWheel { channel: u8, value: u16 },
}

impl MidiMessage {
    /// Decode a channel voice message. Anything else (system messages,
    /// poly pressure, truncated data) yields `None`.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let status = *data.first()?;
        let channel = status & 0x0F;
        let byte = |i: usize| data.get(i).map(|b| b & 0x7F);
        match status & 0xF0 {
            NOTE_ON => {
                let note = byte(1)?;
                let velocity = byte(2)?;
                if velocity == 0 {
                    Some(Self::NoteOff { channel, note })
                } else {
                    Some(Self::NoteOn {
                        channel,
                        note,
                        velocity,
                    })
                }
            }
            NOTE_OFF => Some(Self::NoteOff {
                channel,
                note: byte(1)?,
            }),
            CONTROL_CHANGE => Some(Self::ControlChange {
                channel,
                controller: byte(1)?,
                value: byte(2)?,
            }),
            PROGRAM_CHANGE => Some(Self::ProgramChange {
                channel,
                program: byte(1)?,
            }),
            CHANNEL_PRESSURE => Some(Self::ChannelPressure {
                channel,
                value: byte(1)?,
            }),
            PITCH_WHEEL => {
                let lsb = byte(1)? as u16;
                let msb = byte(2)? as u16;
                Some(Self::PitchWheel {
                    channel,
                    value: lsb | (msb << 7),
                })
            }
            _ => None,
        }
    }

    /// Encode into a fixed buffer, returning the used length.
    pub fn encode(&self) -> ([u8; 3], usize) {
        match *self {
            Self::NoteOn {
                channel,
                note,
                velocity,
            } => ([NOTE_ON | channel, note, velocity], 3),
            Self::NoteOff { channel, note } => ([NOTE_OFF | channel, note, 64], 3),
            Self::ControlChange {
                channel,
                controller,
                value,
            } => ([CONTROL_CHANGE | channel, controller, value], 3),
            Self::ProgramChange { channel, program } => ([PROGRAM_CHANGE | channel, program, 0], 2),
            Self::ChannelPressure { channel, value } => ([CHANNEL_PRESSURE | channel, value, 0], 2),
            Self::PitchWheel { channel, value } => (
                [
                    PITCH_WHEEL | channel,
                    (value & 0x7F) as u8,
                    ((value >> 7) & 0x7F) as u8,
                ],
                3,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_on_zero_velocity_is_note_off() {
        assert_eq!(
            MidiMessage::parse(&[0x93, 60, 0]),
            Some(MidiMessage::NoteOff { channel: 3, note: 60 })
        );
    }

    #[test]
    fn test_pitch_wheel_decoding() {
        assert_eq!(
            MidiMessage::parse(&[0xE1, 0x00, 0x40]),
            Some(MidiMessage::PitchWheel {
                channel: 1,
                value: 0x2000
            })
        );
        let (bytes, len) = MidiMessage::PitchWheel {
            channel: 1,
            value: 0x3FFF,
        }
        .encode();
        assert_eq!(&bytes[..len], &[0xE1, 0x7F, 0x7F]);
    }

    #[test]
    fn test_ignores_system_and_truncated_messages() {
        assert_eq!(MidiMessage::parse(&[0xF8]), None);
        assert_eq!(MidiMessage::parse(&[0x90, 60]), None);
        assert_eq!(MidiMessage::parse(&[]), None);
    }

    #[test]
    fn test_program_change_is_two_bytes() {
        let (bytes, len) = MidiMessage::ProgramChange {
            channel: 2,
            program: 5,
        }
        .encode();
        assert_eq!(&bytes[..len], &[0xC2, 5]);
    }
}
