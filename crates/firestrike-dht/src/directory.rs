//! Bounded peer directory
//!
//! Peers are kept in insertion order. When the directory is full a new
//! peer is rejected; existing entries only leave through
//! [`PeerDirectory::remove`] or [`PeerDirectory::evict_stale`].
//!
//! The directory itself is not synchronized. Owners share it behind a lock
//! and take a [`PeerDirectory::snapshot`] before doing network I/O so the
//! lock is never held across a slow peer.

use crate::now;
use crate::peer_record::PeerRecord;
use crate::{MAX_PEERS, PEER_TIMEOUT_SECS};
use firestrike_crypto::ContentId;
use std::collections::{BTreeSet, VecDeque};
use tracing::debug;

/// Result of [`PeerDirectory::observe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// New peer added
    Inserted,
    /// Known peer; last_seen refreshed
    Refreshed,
    /// Directory full; peer not added
    Rejected,
    /// The peer is this node
    Ignored,
}

/// Set of known peers
#[derive(Debug, Clone)]
pub struct PeerDirectory {
    peers: VecDeque<PeerRecord>,
    capacity: usize,
    timeout_secs: u64,
    /// Our own address, never admitted
    local_peer: Option<String>,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new(MAX_PEERS, PEER_TIMEOUT_SECS)
    }
}

impl PeerDirectory {
    /// Create an empty directory
    pub fn new(capacity: usize, timeout_secs: u64) -> Self {
        PeerDirectory {
            peers: VecDeque::with_capacity(capacity),
            capacity,
            timeout_secs,
            local_peer: None,
        }
    }

    /// Set the local node's address so it is never recorded as a peer
    pub fn set_local_peer(&mut self, peer_id: impl Into<String>) {
        let peer_id = peer_id.into();
        self.peers.retain(|p| p.peer_id != peer_id);
        self.local_peer = Some(peer_id);
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.get(peer_id).is_some()
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }

    fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerRecord> {
        self.peers.iter_mut().find(|p| p.peer_id == peer_id)
    }

    /// Insert or refresh a peer at the current time
    pub fn observe(&mut self, peer_id: &str, public_key: &str) -> ObserveOutcome {
        self.observe_at(peer_id, public_key, now())
    }

    /// Insert or refresh a peer at `now`
    ///
    /// A refreshed peer keeps its position and adopts the announced public
    /// key.
    pub fn observe_at(&mut self, peer_id: &str, public_key: &str, now: u64) -> ObserveOutcome {
        if self.local_peer.as_deref() == Some(peer_id) {
            return ObserveOutcome::Ignored;
        }

        if let Some(record) = self.get_mut(peer_id) {
            record.touch(now);
            if !public_key.is_empty() {
                record.public_key = public_key.to_string();
            }
            return ObserveOutcome::Refreshed;
        }

        if self.is_full() {
            debug!("Peer directory full, rejecting {}", peer_id);
            return ObserveOutcome::Rejected;
        }

        self.peers.push_back(PeerRecord::new(peer_id, public_key, now));
        debug!("Added peer {}", peer_id);
        ObserveOutcome::Inserted
    }

    /// Refresh last_seen for a known peer
    ///
    /// Returns false if the peer is unknown.
    pub fn touch(&mut self, peer_id: &str) -> bool {
        self.touch_at(peer_id, now())
    }

    pub fn touch_at(&mut self, peer_id: &str, now: u64) -> bool {
        match self.get_mut(peer_id) {
            Some(record) => {
                record.touch(now);
                true
            }
            None => false,
        }
    }

    /// Remove a peer
    pub fn remove(&mut self, peer_id: &str) -> Option<PeerRecord> {
        let pos = self.peers.iter().position(|p| p.peer_id == peer_id)?;
        self.peers.remove(pos)
    }

    /// Remove and return every peer not contacted within the timeout
    pub fn evict_stale(&mut self, now: u64) -> BTreeSet<String> {
        let timeout = self.timeout_secs;
        let mut evicted = BTreeSet::new();

        self.peers.retain(|p| {
            if p.is_stale(now, timeout) {
                evicted.insert(p.peer_id.clone());
                false
            } else {
                true
            }
        });

        if !evicted.is_empty() {
            debug!("Evicted {} stale peers", evicted.len());
        }
        evicted
    }

    /// Point-in-time copy of all peers in insertion order
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.iter().cloned().collect()
    }

    /// Record that a peer holds a content id
    ///
    /// Returns false if the peer is unknown.
    pub fn mark_holds(&mut self, peer_id: &str, content_id: ContentId) -> bool {
        match self.get_mut(peer_id) {
            Some(record) => {
                record.content_ids.insert(content_id);
                true
            }
            None => false,
        }
    }

    /// Addresses of peers known to hold a content id, in insertion order
    pub fn holders_of(&self, content_id: &ContentId) -> Vec<String> {
        self.peers
            .iter()
            .filter(|p| p.holds(content_id))
            .map(|p| p.peer_id.clone())
            .collect()
    }
}
