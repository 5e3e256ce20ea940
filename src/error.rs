// src/error.rs
// Error types shared by the real-time engine

use std::time::Duration;
use thiserror::Error;

/// Which external buffer a channel operation needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Playback,
    Recording,
}

impl std::fmt::Display for BufferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferKind::Playback => write!(f, "playback"),
            BufferKind::Recording => write!(f, "recording"),
        }
    }
}

/// Failures of the cross-thread command queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The queue stayed full for the whole enqueue timeout.
    #[error("command queue full, gave up after {0:?}")]
    EnqueueTimeout(Duration),

    /// The command was queued but not executed in time.
    #[error("command not executed within {0:?}")]
    ExecTimeout(Duration),

    /// The processing side of the queue is gone.
    #[error("command queue disconnected")]
    Disconnected,
}

/// Errors raised by loops and channels.
///
/// Everything except `Command` is a contract violation: the caller scheduled
/// processing incorrectly and the current operation is aborted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("attempted to process a loop by 0 samples")]
    ZeroSamples,

    #[error("attempted to process {requested} samples, next point of interest is at {allowed}")]
    ProcessPastPoi { requested: u32, allowed: u32 },

    #[error("no {0} buffer bound for this cycle")]
    MissingBuffer(BufferKind),

    #[error("{kind} buffer has {available} samples left, {requested} requested")]
    BufferTooSmall {
        kind: BufferKind,
        available: usize,
        requested: usize,
    },

    #[error("buffer pool needs a buffer size of at least 1 sample")]
    ZeroBufferSize,

    #[error("channel requires buffers of {expected} samples, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("planned transition {index} out of range ({len} planned)")]
    TransitionOutOfRange { index: usize, len: usize },

    #[error("channel {0} does not exist")]
    NoSuchChannel(usize),

    #[error(transparent)]
    Command(#[from] CommandError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
