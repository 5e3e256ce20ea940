pub mod audio;
pub mod command_queue;
pub mod config;
pub mod error;
pub mod looper;
pub mod midi;

pub use audio::{AudioChannel, AudioChannelHandle, BufferPool};
pub use command_queue::CommandQueue;
pub use config::EngineConfig;
pub use error::{BufferKind, CommandError, EngineError, Result};
pub use looper::{
    process_loops, BasicLoop, Channel, ChannelMode, LoopChannel, LoopHandle, LoopMode, PoiFlags,
    PointOfInterest,
};
pub use midi::{MidiBuffer, MidiChannel, MidiChannelHandle, MidiWireEvent};
