//! # Group Call
//!
//! Session orchestration for group audio/video calls on a messaging
//! platform. A [`GroupCall`] joins the active call of a chat, exchanges
//! connection parameters between the platform's signaling layer and a
//! native transport engine, tracks which SSRC belongs to which participant,
//! and feeds the engine fixed-size PCM and raw-video buffers from file
//! sources on the engine's own real-time cadence.
//!
//! The two external collaborators are consumed through traits: a
//! [`SignalingBridge`] adapts one concrete platform client, and a
//! [`TransportEngine`] wraps the native real-time engine. The session heals
//! SSRC collisions by renegotiating the join transparently, survives
//! network flaps, and guards teardown against late signaling callbacks.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use groupcall::{GroupCall, MediaMode};
//! # async fn example(
//! #     engine: std::sync::Arc<dyn groupcall::TransportEngine>,
//! #     bridge: std::sync::Arc<dyn groupcall::SignalingBridge>,
//! # ) -> Result<(), groupcall::GroupCallError> {
//! let call = GroupCall::builder(engine, bridge)
//!     .media_mode(MediaMode::Combined)
//!     .build();
//!
//! call.start("somechat", None, None, true).await?;
//! call.play_audio(Some("music.mp3".into()), true).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dispatcher;
pub mod participant;
pub mod session;

pub use config::GroupCallConfig;
pub use dispatcher::{Action, Dispatcher, Handler, SessionEvent};
pub use participant::{Participant, ParticipantCache};
pub use session::{GroupCall, GroupCallBuilder, MediaMode, SessionState};

// The boundary types sessions are built over
pub use groupcall_core::{
    to_signed, to_unsigned, AudioDeviceModule, ConnectionMode, DtlsFingerprint, EngineEvents,
    GroupCallError, IceCandidate, JoinPayload, MediaSource, ParticipantDescriptor,
    RemoteParameters, TransportEngine,
};
pub use groupcall_media::{AudioStream, MediaError, VideoStream};
pub use groupcall_signaling::{
    CallDescriptor, ParticipantUpdate, PeerId, SignalingBridge, SignalingError, SignalingUpdate,
    SubscriptionKey, UpdateSink,
};
