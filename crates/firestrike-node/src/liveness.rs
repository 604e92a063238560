//! Periodic peer liveness sweep

use crate::client::PeerClient;
use firestrike_dht::{now, PeerDirectory};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Peers that answered
    pub alive: usize,
    /// Peers removed because they did not answer
    pub removed: Vec<String>,
    /// Peers removed by the staleness check afterwards
    pub expired: Vec<String>,
}

/// Periodic peer liveness check
///
/// Every peer in the directory is pinged. A peer that fails to answer with
/// a pong is removed at once; afterwards stale entries are evicted.
#[derive(Clone)]
pub(crate) struct LivenessMonitor {
    pub directory: Arc<RwLock<PeerDirectory>>,
    pub client: PeerClient,
    pub local_address: String,
    pub public_key: String,
    pub interval: Duration,
}

impl LivenessMonitor {
    /// Run sweeps until `shutdown` fires
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // interval() panics on a zero period
        let mut ticker = interval(self.interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        debug!("Liveness monitor started (interval: {:?})", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                report = self.sweep() => {
                    if !report.removed.is_empty() || !report.expired.is_empty() {
                        info!(
                            "Liveness sweep: {} alive, {} unresponsive, {} expired",
                            report.alive,
                            report.removed.len(),
                            report.expired.len()
                        );
                    }
                }
            }
        }

        debug!("Liveness monitor stopped");
    }

    /// Ping every known peer once
    pub async fn sweep(&self) -> SweepReport {
        let peers = self.directory.read().await.snapshot();

        let results = join_all(peers.iter().map(|peer| {
            self.client.ping(&peer.peer_id, &self.local_address, &self.public_key)
        }))
        .await;

        let mut report = SweepReport::default();
        let mut directory = self.directory.write().await;

        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(public_key) => {
                    directory.observe(&peer.peer_id, &public_key);
                    report.alive += 1;
                }
                Err(e) => {
                    warn!("Removing unresponsive peer {}: {}", peer.peer_id, e);
                    directory.remove(&peer.peer_id);
                    report.removed.push(peer.peer_id.clone());
                }
            }
        }

        report.expired = directory.evict_stale(now()).into_iter().collect();
        report
    }
}
