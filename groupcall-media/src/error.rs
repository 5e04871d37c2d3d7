//! Error types for the media pipeline

use groupcall_core::GroupCallError;
use thiserror::Error;

/// Errors raised while opening or driving a media source
#[derive(Error, Debug)]
pub enum MediaError {
    /// The source could not be opened
    #[error("Cannot open {source_id}: {reason}")]
    Open {
        /// Source locator
        source_id: String,
        /// Failure description
        reason: String,
    },

    /// The container has no decodable audio track
    #[error("No audio track in {source_id}")]
    NoAudioTrack {
        /// Source locator
        source_id: String,
    },

    /// The decoder rejected the stream
    #[error("Decode failed: {reason}")]
    Decode {
        /// Failure description
        reason: String,
    },

    /// The resampler could not be built or driven
    #[error("Resample failed: {reason}")]
    Resample {
        /// Failure description
        reason: String,
    },

    /// Seeking back to the start of the source failed
    #[error("Seek failed: {reason}")]
    Seek {
        /// Failure description
        reason: String,
    },
}

impl From<MediaError> for GroupCallError {
    fn from(err: MediaError) -> Self {
        GroupCallError::Media {
            reason: err.to_string(),
        }
    }
}
