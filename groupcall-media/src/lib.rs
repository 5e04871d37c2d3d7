//! # Group Call Media
//!
//! The media streaming pipeline of a group call session. Each stream decodes
//! a source at its natural pace on a dedicated production thread and exposes
//! a bounded queue of fixed-size, format-normalized buffers that the
//! transport engine drains from its real-time threads without ever blocking.
//!
//! Audio is normalized to 48 kHz stereo s16le and sliced into exactly the
//! byte length the engine last requested; video is normalized to RGBA
//! frames, one per production iteration. An audio stream can be paired with
//! a companion video stream for best-effort lip sync.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod audio;
pub mod error;
pub mod queue;
pub mod source;
pub mod video;

pub use audio::AudioStream;
pub use error::MediaError;
pub use queue::FrameQueue;
pub use source::{
    AudioSource, FileAudioSource, FileVideoSource, VideoFrame, VideoInfo, VideoSource,
};
pub use video::VideoStream;

use std::sync::Arc;

/// Target sample rate for outgoing audio
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;

/// Target channel count for outgoing audio
pub const AUDIO_CHANNELS: usize = 2;

/// Requested-length fallback used until the engine's first `read` teaches
/// the stream the real buffer length (10 ms of 48 kHz stereo s16le).
pub const DEFAULT_AUDIO_CHUNK_LEN: usize = 1920;

/// Bounded depth of a stream's frame queue. Larger values trade memory for
/// tolerance to decoder jitter.
pub const DEFAULT_QUEUE_DEPTH: usize = 10;

/// Callback invoked once when a non-repeating stream reaches the end of its
/// source; receives the source identifier.
pub type EndOfStream = Arc<dyn Fn(&str) + Send + Sync>;
