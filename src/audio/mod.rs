pub mod buffer_pool;
pub mod channel;
pub mod peak_meter;
pub mod simd_mixer;

pub use buffer_pool::{AudioBuffer, BufferPool};
pub use channel::{AudioChannel, AudioChannelHandle};
pub use peak_meter::PeakMeter;
