//! A BEP5 peer swarm: the set of endpoints currently announcing on one
//! infohash, refreshed periodically via `get_peers`.
//!
//! Grounded on `original_source/src/bittorrent/bep5_announcer.cpp`'s
//! swarm-refresh loop and `is_martian.h`'s filtering of announced peers.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::id::Id;
use crate::mainline::MainlineDht;
use crate::martian::is_martian;

/// How often a swarm refreshes its peer list on success.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// How soon a swarm retries after a failed refresh.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Live membership of one BEP5 swarm, continuously refreshed in the
/// background until dropped.
pub struct Swarm {
    infohash: Id,
    peers: watch::Receiver<Arc<HashSet<SocketAddr>>>,
    cancel: CancellationToken,
}

impl Swarm {
    pub fn join(dht: MainlineDht, infohash: Id) -> Self {
        let (tx, rx) = watch::channel(Arc::new(HashSet::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(refresh_loop(dht, infohash, tx, cancel.clone()));

        Self { infohash, peers: rx, cancel }
    }

    pub fn infohash(&self) -> Id {
        self.infohash
    }

    pub fn peers(&self) -> Arc<HashSet<SocketAddr>> {
        self.peers.borrow().clone()
    }

    /// Wait until the peer set changes from what the caller last observed.
    pub async fn changed(&mut self) {
        let _ = self.peers.changed().await;
    }
}

impl Drop for Swarm {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn refresh_loop(
    dht: MainlineDht,
    infohash: Id,
    tx: watch::Sender<Arc<HashSet<SocketAddr>>>,
    cancel: CancellationToken,
) {
    loop {
        let next_sleep = match dht.tracker_get_peers(infohash).await {
            Ok(found) => {
                let filtered: HashSet<SocketAddr> =
                    found.into_iter().filter(|addr| !is_martian(addr)).collect();
                debug!(?infohash, count = filtered.len(), "swarm refreshed");
                let _ = tx.send(Arc::new(filtered));
                REFRESH_INTERVAL
            }
            Err(err) => {
                debug!(?infohash, ?err, "swarm refresh failed, retrying shortly");
                RETRY_INTERVAL
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(next_sleep) => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn swarm_starts_empty() {
        let dht = MainlineDht::bind(&["127.0.0.1:0".parse().unwrap()], vec![]).await.unwrap();
        let swarm = Swarm::join(dht, Id::random());
        assert!(swarm.peers().is_empty());
    }
}
