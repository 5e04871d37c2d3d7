//! # Group Call Core
//!
//! Shared foundation for the group call session crates: the transport-engine
//! boundary (commands the session issues, callbacks the engine fires, the
//! pull-based media contract), the join parameter exchange types, and the
//! SSRC representation codec used between the signaling layer and the engine.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod ssrc;

pub use engine::{
    AudioDeviceModule, ConnectionMode, DtlsFingerprint, EngineEvents, IceCandidate, JoinPayload,
    MediaSource, ParticipantDescriptor, RemoteParameters, TransportEngine,
};
pub use error::GroupCallError;
pub use ssrc::{to_signed, to_unsigned};
