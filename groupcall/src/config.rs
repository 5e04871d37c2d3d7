//! Configuration types and defaults

pub use groupcall_media::audio::LIP_SYNC_THRESHOLD;
pub use groupcall_media::{
    AUDIO_CHANNELS, AUDIO_SAMPLE_RATE, DEFAULT_AUDIO_CHUNK_LEN, DEFAULT_QUEUE_DEPTH,
};

use std::time::Duration;

/// Session-level configuration.
///
/// The defaults match the platform's expectations and are usually what you
/// want; the timeouts mostly matter for tests and flaky networks.
#[derive(Debug, Clone)]
pub struct GroupCallConfig {
    /// Wait budget for the two bounded waits of the session: the
    /// join-payload confirmation during a reconnect, and the disconnect
    /// confirmation during a stop.
    pub operation_timeout: Duration,
    /// How often the speaking action is sent to the chat while connected.
    pub speaking_indicator_interval: Duration,
}

impl Default for GroupCallConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(10),
            speaking_indicator_interval: Duration::from_millis(450),
        }
    }
}
