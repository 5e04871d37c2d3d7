//! Types crossing the signaling boundary

use groupcall_core::GroupCallError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque identity of a peer on the platform: the local user, a join-as
/// presentation identity, or a remote participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque handle of an active call, as fetched from the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDescriptor {
    /// Platform call identifier, in its canonical signed form
    pub id: i64,
    /// Access token the platform pairs with the identifier
    pub access_hash: i64,
}

/// Key under which the bridge registers its update subscription.
///
/// Derived deterministically from the call descriptor's canonical signed
/// identifier; there is exactly one subscription per active call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionKey(pub i64);

impl SubscriptionKey {
    /// Derive the subscription key for a call.
    pub fn for_call(call: &CallDescriptor) -> Self {
        Self(call.id)
    }
}

/// One entry of a participant-list delta. The platform sends only changed
/// participants, not the full list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantUpdate {
    /// Peer identity of the participant, as joined
    pub peer: PeerId,
    /// Audio SSRC in the signed wire form
    pub source: i64,
    /// Muted for all users
    pub muted: bool,
    /// The participant left the call
    pub left: bool,
    /// Muted for all users but allowed to unmute themselves
    pub can_self_unmute: bool,
    /// The participant is the local user
    pub is_self: bool,
    /// Volume in platform units, when set
    pub volume: Option<u32>,
}

/// Asynchronous updates the platform delivers for a subscribed call
#[derive(Debug, Clone)]
pub enum SignalingUpdate {
    /// A participant-list delta arrived
    ParticipantsUpdated {
        /// Changed participants only
        participants: Vec<ParticipantUpdate>,
    },
    /// The platform answered a join request with remote parameters
    CallParamsUpdated {
        /// Raw JSON parameter payload, `{"transport": {...}}`
        params: String,
    },
    /// The call was discarded server-side
    CallDiscarded,
}

/// Errors surfaced by the signaling bridge
#[derive(Error, Debug)]
pub enum SignalingError {
    /// The chat has no active call
    #[error("Chat {chat} has no active call")]
    CallNotFound {
        /// Chat reference that was resolved
        chat: String,
    },

    /// The platform rejected the join because the SSRC is already taken.
    /// Expected under concurrent (re)join races; recoverable by emitting a
    /// fresh join payload.
    #[error("SSRC already in use by another session")]
    DuplicateSsrc,

    /// Any other RPC failure
    #[error("Platform RPC failed: {reason}")]
    Rpc {
        /// Failure description
        reason: String,
    },
}

impl From<SignalingError> for GroupCallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::CallNotFound { chat } => GroupCallError::CallNotFound { chat },
            other => GroupCallError::Signaling {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_key_is_the_canonical_call_id() {
        let call = CallDescriptor {
            id: -7_654_321,
            access_hash: 42,
        };
        assert_eq!(SubscriptionKey::for_call(&call), SubscriptionKey(-7_654_321));
        // Same call, same key: registration is deterministic.
        assert_eq!(SubscriptionKey::for_call(&call), SubscriptionKey::for_call(&call));
    }

    #[test]
    fn call_not_found_maps_to_the_session_error() {
        let err: GroupCallError = SignalingError::CallNotFound {
            chat: "chess-club".to_string(),
        }
        .into();
        assert!(matches!(err, GroupCallError::CallNotFound { chat } if chat == "chess-club"));
    }
}
