//! # Group Call Signaling
//!
//! The platform-side boundary of a group call session: the
//! [`SignalingBridge`] contract a messaging-platform client implements, and
//! the types that cross it. The session core never talks to the platform
//! directly; every RPC and every update subscription goes through the bridge.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod types;

pub use bridge::{SignalingBridge, UpdateSink};
pub use types::{
    CallDescriptor, ParticipantUpdate, PeerId, SignalingError, SignalingUpdate, SubscriptionKey,
};
