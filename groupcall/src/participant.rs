//! Participant bookkeeping.
//!
//! The session keeps an SSRC-keyed cache of everyone in the call so it can
//! answer the engine's descriptor requests without a platform round trip.
//! The cache holds the latest state the platform reported; a participant
//! marked as left is removed immediately, and the full list can be refetched
//! through the bridge whenever the cache misses.

use dashmap::DashMap;
use groupcall_core::{to_unsigned, ParticipantDescriptor};
use groupcall_signaling::{ParticipantUpdate, PeerId};

/// One endpoint of the call as the session tracks it
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    /// Peer identity of the participant, as joined
    pub peer: PeerId,
    /// Audio SSRC in the unsigned engine form
    pub ssrc: u32,
    /// Muted for all users
    pub muted: bool,
    /// Muted for all users but allowed to unmute themselves
    pub can_self_unmute: bool,
    /// The participant is the local user
    pub is_self: bool,
    /// Volume in platform units, when set
    pub volume: Option<u32>,
}

impl Participant {
    fn from_update(update: &ParticipantUpdate) -> Self {
        Self {
            peer: update.peer.clone(),
            ssrc: to_unsigned(update.source),
            muted: update.muted,
            can_self_unmute: update.can_self_unmute,
            is_self: update.is_self,
            volume: update.volume,
        }
    }

    /// The descriptor form the engine tracks.
    pub fn descriptor(&self) -> ParticipantDescriptor {
        ParticipantDescriptor {
            audio_ssrc: self.ssrc,
            muted: self.muted,
            volume: self.volume,
        }
    }
}

/// SSRC-keyed cache of the call's participants
#[derive(Debug, Default)]
pub struct ParticipantCache {
    by_ssrc: DashMap<u32, Participant>,
}

impl ParticipantCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a participant-list delta. Left participants are dropped from
    /// the cache; their SSRCs are returned so the caller can remove them
    /// from the engine's tracked set in one batch.
    pub fn apply(&self, delta: &[ParticipantUpdate]) -> Vec<u32> {
        let mut removed = Vec::new();
        for update in delta {
            let ssrc = to_unsigned(update.source);
            if update.left {
                self.by_ssrc.remove(&ssrc);
                removed.push(ssrc);
            } else {
                self.by_ssrc.insert(ssrc, Participant::from_update(update));
            }
        }
        removed
    }

    /// Replace the whole cache with a freshly fetched participant list.
    pub fn replace_all(&self, list: &[ParticipantUpdate]) {
        self.by_ssrc.clear();
        for update in list {
            if !update.left {
                self.by_ssrc
                    .insert(to_unsigned(update.source), Participant::from_update(update));
            }
        }
    }

    /// Look up one participant by SSRC.
    pub fn get(&self, ssrc: u32) -> Option<Participant> {
        self.by_ssrc.get(&ssrc).map(|p| p.clone())
    }

    /// Descriptors for a batch of SSRCs. `None` when any of them misses the
    /// cache, telling the caller to refetch the full list first.
    pub fn descriptors(&self, ssrcs: &[u32]) -> Option<Vec<ParticipantDescriptor>> {
        ssrcs
            .iter()
            .map(|ssrc| self.by_ssrc.get(ssrc).map(|p| p.descriptor()))
            .collect()
    }

    /// Descriptor snapshot of everyone currently cached.
    pub fn snapshot(&self) -> Vec<ParticipantDescriptor> {
        self.by_ssrc.iter().map(|p| p.descriptor()).collect()
    }

    /// Everyone currently cached.
    pub fn participants(&self) -> Vec<Participant> {
        self.by_ssrc.iter().map(|p| p.clone()).collect()
    }

    /// Whether an SSRC is currently tracked.
    pub fn contains(&self, ssrc: u32) -> bool {
        self.by_ssrc.contains_key(&ssrc)
    }

    /// Number of tracked participants.
    pub fn len(&self) -> usize {
        self.by_ssrc.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.by_ssrc.is_empty()
    }

    /// Drop every cached participant.
    pub fn clear(&self) {
        self.by_ssrc.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(peer: &str, source: i64, left: bool) -> ParticipantUpdate {
        ParticipantUpdate {
            peer: PeerId::from(peer),
            source,
            muted: false,
            left,
            can_self_unmute: true,
            is_self: false,
            volume: None,
        }
    }

    #[test]
    fn apply_inserts_and_updates_by_ssrc() {
        let cache = ParticipantCache::new();
        cache.apply(&[update("alice", 100, false), update("bob", 200, false)]);
        assert_eq!(cache.len(), 2);

        let mut changed = update("alice", 100, false);
        changed.muted = true;
        cache.apply(&[changed]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(100).unwrap().muted);
    }

    #[test]
    fn left_participants_are_removed_and_reported() {
        let cache = ParticipantCache::new();
        cache.apply(&[update("alice", 100, false), update("bob", 200, false)]);

        let removed = cache.apply(&[update("bob", 200, true)]);
        assert_eq!(removed, vec![200]);
        assert!(!cache.contains(200));
        assert!(cache.contains(100));
    }

    #[test]
    fn negative_wire_ssrcs_key_by_their_unsigned_form() {
        let cache = ParticipantCache::new();
        cache.apply(&[update("carol", -1, false)]);
        assert!(cache.contains(u32::MAX));
        assert_eq!(cache.get(u32::MAX).unwrap().ssrc, u32::MAX);
    }

    #[test]
    fn descriptors_miss_when_any_ssrc_is_unknown() {
        let cache = ParticipantCache::new();
        cache.apply(&[update("alice", 100, false)]);

        assert_eq!(cache.descriptors(&[100]).unwrap().len(), 1);
        assert!(cache.descriptors(&[100, 999]).is_none());
    }

    #[test]
    fn replace_all_drops_stale_entries() {
        let cache = ParticipantCache::new();
        cache.apply(&[update("alice", 100, false)]);
        cache.replace_all(&[update("bob", 200, false)]);

        assert!(!cache.contains(100));
        assert!(cache.contains(200));
        assert_eq!(cache.len(), 1);
    }
}
