// src/looper/mode_map.rs
// Maps loop and channel modes onto the operations a channel performs

use std::ops::{BitAnd, BitOr, BitOrAssign};

use super::channel::NextMode;
use super::{ChannelMode, LoopMode};

/// Set of operations a channel performs in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProcessFlags(u8);

impl ProcessFlags {
    pub const NONE: Self = Self(0);
    pub const PLAYBACK: Self = Self(1);
    pub const RECORD: Self = Self(2);
    pub const REPLACE: Self = Self(4);
    pub const PRE_RECORD: Self = Self(8);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for ProcessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ProcessFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ProcessFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Flags and channel-local position for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelProcessParams {
    pub flags: ProcessFlags,
    pub position: i64,
}

pub fn loop_mode_to_channel_process_flags(loop_mode: LoopMode, channel_mode: ChannelMode) -> ProcessFlags {
    use ChannelMode::*;
    use LoopMode::*;

    match (channel_mode, loop_mode) {
        (Disabled, _) => ProcessFlags::NONE,
        (Dry, Playing) => ProcessFlags::NONE,
        (Dry, PlayingDryThroughWet | RecordingDryIntoWet) => ProcessFlags::PLAYBACK,
        (Wet, PlayingDryThroughWet) => ProcessFlags::NONE,
        (Wet, RecordingDryIntoWet) => ProcessFlags::REPLACE,
        (Direct, PlayingDryThroughWet) => ProcessFlags::PLAYBACK,
        (Direct, RecordingDryIntoWet) => ProcessFlags::REPLACE,
        (_, Playing) => ProcessFlags::PLAYBACK,
        (_, Recording) => ProcessFlags::RECORD,
        (_, Replacing) => ProcessFlags::REPLACE,
        _ => ProcessFlags::NONE,
    }
}

/// Work out what a channel does this cycle, including pre-play and
/// pre-record ahead of an imminent transition.
///
/// A next mode only counts when it applies on the very next trigger
/// (`delay == 0`) and the time until that trigger is known.
pub fn get_channel_process_params(
    loop_mode: LoopMode,
    next: Option<NextMode>,
    position: i64,
    start_offset: i32,
    channel_mode: ChannelMode,
) -> ChannelProcessParams {
    let mut params = ChannelProcessParams {
        flags: loop_mode_to_channel_process_flags(loop_mode, channel_mode),
        position: position + start_offset as i64,
    };

    let imminent = next
        .filter(|n| n.delay == 0)
        .and_then(|n| n.eta.map(|eta| (n.mode, eta)));
    let Some((next_mode, eta)) = imminent else {
        return params;
    };
    let next_flags = loop_mode_to_channel_process_flags(next_mode, channel_mode);

    if params.flags.is_empty() && next_flags.contains(ProcessFlags::PLAYBACK) {
        // Pre-play so that the content before start_offset ends exactly
        // when the transition happens.
        params.position = start_offset as i64 - eta as i64;
        params.flags |= ProcessFlags::PLAYBACK;
    } else if !params.flags.contains(ProcessFlags::RECORD) && next_flags.contains(ProcessFlags::RECORD) {
        params.flags |= ProcessFlags::PRE_RECORD;
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next(mode: LoopMode, delay: u32, eta: Option<u32>) -> Option<NextMode> {
        Some(NextMode { mode, delay, eta })
    }

    #[test]
    fn test_mode_table() {
        use ChannelMode::*;
        use LoopMode::*;
        let cases = [
            (Disabled, Playing, ProcessFlags::NONE),
            (Dry, Playing, ProcessFlags::NONE),
            (Dry, RecordingDryIntoWet, ProcessFlags::PLAYBACK),
            (Wet, PlayingDryThroughWet, ProcessFlags::NONE),
            (Wet, RecordingDryIntoWet, ProcessFlags::REPLACE),
            (Wet, Playing, ProcessFlags::PLAYBACK),
            (Direct, PlayingDryThroughWet, ProcessFlags::PLAYBACK),
            (Direct, Recording, ProcessFlags::RECORD),
            (Direct, Replacing, ProcessFlags::REPLACE),
            (Direct, PlayingMuted, ProcessFlags::NONE),
            (Direct, Stopped, ProcessFlags::NONE),
        ];
        for (channel_mode, loop_mode, expected) in cases {
            assert_eq!(
                loop_mode_to_channel_process_flags(loop_mode, channel_mode),
                expected,
                "{:?} in {:?}",
                channel_mode,
                loop_mode
            );
        }
    }

    #[test]
    fn test_position_includes_start_offset() {
        let params = get_channel_process_params(LoopMode::Playing, None, 10, 5, ChannelMode::Direct);
        assert_eq!(params.position, 15);
        assert_eq!(params.flags, ProcessFlags::PLAYBACK);
    }

    #[test]
    fn test_pre_play_before_imminent_playback() {
        let params = get_channel_process_params(
            LoopMode::Stopped,
            next(LoopMode::Playing, 0, Some(30)),
            0,
            100,
            ChannelMode::Direct,
        );
        assert_eq!(params.flags, ProcessFlags::PLAYBACK);
        assert_eq!(params.position, 70);

        // Not imminent: nothing happens.
        let params = get_channel_process_params(
            LoopMode::Stopped,
            next(LoopMode::Playing, 1, Some(30)),
            0,
            100,
            ChannelMode::Direct,
        );
        assert!(params.flags.is_empty());
    }

    #[test]
    fn test_pre_record_before_imminent_recording() {
        let params = get_channel_process_params(
            LoopMode::Playing,
            next(LoopMode::Recording, 0, Some(8)),
            4,
            0,
            ChannelMode::Direct,
        );
        assert_eq!(params.flags, ProcessFlags::PLAYBACK | ProcessFlags::PRE_RECORD);
        assert_eq!(params.position, 4);

        // Unknown eta disables the look-ahead.
        let params = get_channel_process_params(
            LoopMode::Stopped,
            next(LoopMode::Recording, 0, None),
            0,
            0,
            ChannelMode::Direct,
        );
        assert!(params.flags.is_empty());
    }
}
