//! FireStrike DHT
//!
//! The per-node state behind the distribution protocol:
//! - Durable content-addressed storage of encrypted objects
//! - A bounded directory of known peers with liveness tracking
//!
//! This is a flat best-effort overlay. Lookups walk the directory in
//! insertion order rather than routing by distance.

pub mod directory;
pub mod error;
pub mod peer_record;
pub mod storage;

pub use directory::{ObserveOutcome, PeerDirectory};
pub use error::{DhtError, Result};
pub use peer_record::PeerRecord;
pub use storage::{ContentStore, IndexEntry, StoredObject};

use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum number of peers held in the directory
pub const MAX_PEERS: usize = 50;

/// Seconds without contact after which a peer is stale
pub const PEER_TIMEOUT_SECS: u64 = 300;

/// Seconds between liveness sweeps
pub const PING_INTERVAL_SECS: u64 = 60;

/// Number of peers an upload pushes to
pub const DEFAULT_FANOUT: usize = 3;

/// Get current timestamp
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
