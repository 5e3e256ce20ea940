pub mod basic_loop;
pub mod channel;
pub mod mode_map;
pub mod process;

pub use basic_loop::{dominant_poi, BasicLoop, LoopHandle, PoiFlags, PointOfInterest};
pub use channel::{Channel, ChannelShared, LoopChannel, NextMode, ProcessCycle};
pub use mode_map::{ChannelProcessParams, ProcessFlags};
pub use process::process_loops;

/// Mode of a loop. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum LoopMode {
    #[default]
    Stopped = 0,
    Playing = 1,
    PlayingMuted = 2,
    Recording = 3,
    Replacing = 4,
    PlayingDryThroughWet = 5,
    RecordingDryIntoWet = 6,
    Invalid = 7,
}

impl LoopMode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopMode::Stopped,
            1 => LoopMode::Playing,
            2 => LoopMode::PlayingMuted,
            3 => LoopMode::Recording,
            4 => LoopMode::Replacing,
            5 => LoopMode::PlayingDryThroughWet,
            6 => LoopMode::RecordingDryIntoWet,
            _ => LoopMode::Invalid,
        }
    }

    /// Modes in which the position advances through existing content.
    pub fn is_playing(self) -> bool {
        matches!(
            self,
            LoopMode::Playing
                | LoopMode::Replacing
                | LoopMode::PlayingDryThroughWet
                | LoopMode::RecordingDryIntoWet
        )
    }
}

/// How a channel reacts to its loop's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ChannelMode {
    Disabled = 0,
    Dry = 1,
    Wet = 2,
    #[default]
    Direct = 3,
}

impl ChannelMode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ChannelMode::Dry,
            2 => ChannelMode::Wet,
            3 => ChannelMode::Direct,
            _ => ChannelMode::Disabled,
        }
    }
}
