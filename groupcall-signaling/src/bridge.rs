//! The signaling bridge contract.
//!
//! A bridge adapts one concrete messaging-platform client to the session
//! core. It is the only component allowed to issue platform RPCs, and it
//! owns exactly one update subscription per active call.

use crate::types::{
    CallDescriptor, ParticipantUpdate, PeerId, SignalingError, SignalingUpdate, SubscriptionKey,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Channel end a bridge pushes call updates into once registered
pub type UpdateSink = mpsc::UnboundedSender<SignalingUpdate>;

/// Platform operations the session depends on.
///
/// All state the bridge holds for a session (resolved chat, call descriptor,
/// join-as identity) is torn down by [`reset`]; a bridge instance is reused
/// across sessions of the same client.
///
/// [`reset`]: SignalingBridge::reset
#[async_trait]
pub trait SignalingBridge: Send + Sync {
    /// Resolve a chat reference in any supported form and fetch its active
    /// call descriptor.
    async fn resolve_and_fetch_call(&self, group: &str) -> Result<CallDescriptor, SignalingError>;

    /// Resolve the identity to present in the participant list. Defaults to
    /// the caller's own peer, or the platform-configured default join-as
    /// identity when one exists.
    async fn resolve_join_as(&self, hint: Option<PeerId>) -> Result<PeerId, SignalingError>;

    /// The local user's own peer identity.
    fn my_peer(&self) -> Option<PeerId>;

    /// Register the update subscription for a call. Updates flow into
    /// `sink` until [`unregister_update_handlers`] is called. Registering
    /// while a subscription exists replaces it.
    ///
    /// [`unregister_update_handlers`]: SignalingBridge::unregister_update_handlers
    fn register_update_handlers(&self, key: SubscriptionKey, sink: UpdateSink);

    /// Drop the current update subscription, if any.
    fn unregister_update_handlers(&self);

    /// Submit a join request with the engine-produced parameter JSON.
    /// Returns the own SSRC in signed wire form on success.
    async fn join_call(
        &self,
        invite_hash: Option<&str>,
        params_json: &str,
        muted: bool,
    ) -> Result<i64, SignalingError>;

    /// Leave the call server-side. Best effort; the platform evicts absent
    /// members on its own timeout regardless.
    async fn leave_call(&self) -> Result<(), SignalingError>;

    /// Fetch the full current participant list of the call.
    async fn fetch_participants(&self) -> Result<Vec<ParticipantUpdate>, SignalingError>;

    /// Edit a call member. `volume` is in platform units (percent already
    /// scaled by the caller); requires call-management permission for peers
    /// other than the own join-as identity.
    async fn edit_call_member(
        &self,
        peer: &PeerId,
        volume: Option<u32>,
        muted: Option<bool>,
    ) -> Result<(), SignalingError>;

    /// Send the periodic speaking indicator to the chat.
    async fn send_speaking_indicator(&self) -> Result<(), SignalingError>;

    /// Drop all per-session bridge state.
    fn reset(&self);
}
