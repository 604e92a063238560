//! Peer records held by the directory

use firestrike_crypto::ContentId;
use std::collections::BTreeSet;

/// A known peer
///
/// Peers are identified by the opaque address string their transport
/// listens on. The address is never parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Peer address
    pub peer_id: String,

    /// Hex-encoded public key as announced by the peer
    pub public_key: String,

    /// Last successful contact (Unix timestamp)
    pub last_seen: u64,

    /// Content ids this peer is known to hold
    pub content_ids: BTreeSet<ContentId>,
}

impl PeerRecord {
    pub fn new(peer_id: impl Into<String>, public_key: impl Into<String>, now: u64) -> Self {
        PeerRecord {
            peer_id: peer_id.into(),
            public_key: public_key.into(),
            last_seen: now,
            content_ids: BTreeSet::new(),
        }
    }

    /// Record a successful contact
    pub fn touch(&mut self, now: u64) {
        // Clocks may step backwards; never move last_seen into the past
        self.last_seen = self.last_seen.max(now);
    }

    /// Check whether the peer has gone quiet for longer than `timeout_secs`
    pub fn is_stale(&self, now: u64, timeout_secs: u64) -> bool {
        now.saturating_sub(self.last_seen) > timeout_secs
    }

    pub fn holds(&self, content_id: &ContentId) -> bool {
        self.content_ids.contains(content_id)
    }
}
