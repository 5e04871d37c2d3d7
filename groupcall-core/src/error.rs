//! Error types for group call sessions

use std::time::Duration;
use thiserror::Error;

/// Main error type for group call session operations
#[derive(Error, Debug)]
pub enum GroupCallError {
    /// The chat has no active call to join
    #[error("Chat {chat} has no active call")]
    CallNotFound {
        /// Chat reference that was resolved
        chat: String,
    },

    /// A control operation was invoked before any session exists
    #[error("Operation {operation} requires an active call session")]
    CallBeforeStart {
        /// Operation that was rejected
        operation: String,
    },

    /// The engine did not produce a join payload within the wait budget
    #[error("Reconnect timed out after {timeout:?} waiting for a join payload")]
    ReconnectTimeout {
        /// Wait budget that was exhausted
        timeout: Duration,
    },

    /// The engine did not confirm disconnection within the wait budget
    #[error("Stop timed out after {timeout:?} waiting for disconnection")]
    DisconnectTimeout {
        /// Wait budget that was exhausted
        timeout: Duration,
    },

    /// A handler was registered for an action the dispatcher does not serve
    #[error("Invalid dispatcher action: {action}")]
    InvalidAction {
        /// Action that was rejected
        action: String,
    },

    /// A signaling RPC failed
    #[error("Signaling failure: {reason}")]
    Signaling {
        /// Reason reported by the bridge
        reason: String,
    },

    /// The transport engine rejected a command
    #[error("Transport engine failure: {reason}")]
    Engine {
        /// Reason reported by the engine
        reason: String,
    },

    /// A media stream could not be created or driven
    #[error("Media failure: {reason}")]
    Media {
        /// Reason reported by the media pipeline
        reason: String,
    },

    /// Remote connection parameters could not be parsed
    #[error("Malformed remote parameters: {reason}")]
    MalformedParameters {
        /// Parse failure description
        reason: String,
    },
}
