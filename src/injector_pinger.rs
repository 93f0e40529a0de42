//! Periodically probes the injector swarm to detect when an origin becomes
//! reachable again, and kicks off a helper-swarm announce once it is.
//!
//! Grounded on `original_source/src/bittorrent/bep5_announcer.cpp`'s
//! wake/retry cadence.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bep5_client::Bep5Client;
use crate::mainline::MainlineDht;

/// Normal wake cadence between probe rounds.
pub const WAKE_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Wake cadence after a round finds nothing reachable, so a fresh failure
/// gets rechecked soon rather than waiting out the full interval.
pub const FAILURE_RETRY_INTERVAL: Duration = Duration::from_secs(10);
/// Cap on concurrent probes in a single round.
pub const MAX_PARALLEL_PROBES: usize = 30;
/// How long a round is allowed to run before giving up on stragglers.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Watches an injector swarm and announces this node's helper swarm once
/// the injector is reachable, so downstream clients discover a fresh path
/// rather than retrying a dead one.
pub struct InjectorPinger {
    cancel: CancellationToken,
}

impl InjectorPinger {
    pub fn start(dht: MainlineDht, client: Arc<Bep5Client>, helper_swarm_name: String) -> Self {
        let cancel = CancellationToken::new();
        tokio::spawn(run(dht, client, helper_swarm_name, cancel.clone()));
        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for InjectorPinger {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(dht: MainlineDht, client: Arc<Bep5Client>, helper_swarm_name: String, cancel: CancellationToken) {
    loop {
        let reachable;
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = probe_round(&client) => {
                reachable = result;
                if result {
                    info!("injector reachable, announcing helper swarm");
                    let infohash = MainlineDht::swarm_infohash(&helper_swarm_name);
                    if let Err(err) = dht.tracker_announce(infohash, None).await {
                        debug!(?err, "helper swarm announce failed");
                    }
                }
            }
        }

        let wake = if reachable { WAKE_INTERVAL } else { FAILURE_RETRY_INTERVAL };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wake) => {}
        }
    }
}

/// One probe round: race TCP connects against up to [MAX_PARALLEL_PROBES]
/// randomly sampled members of the injector swarm, bounded by
/// [WATCHDOG_TIMEOUT].
async fn probe_round(client: &Bep5Client) -> bool {
    let mut peers = client.injector_peers();
    if peers.is_empty() {
        return false;
    }
    peers.shuffle(&mut rand::thread_rng());
    peers.truncate(MAX_PARALLEL_PROBES);

    let mut attempts = JoinSet::new();
    for addr in peers {
        attempts.spawn(async move { TcpStream::connect(addr).await.is_ok() });
    }

    let deadline = tokio::time::sleep(WATCHDOG_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return false,
            joined = attempts.join_next() => {
                match joined {
                    Some(Ok(true)) => return true,
                    Some(_) => continue,
                    None => return false,
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn probe_round_with_no_known_injectors_fails() {
        let dht = MainlineDht::bind(&["127.0.0.1:0".parse().unwrap()], vec![]).await.unwrap();
        let client = Bep5Client::new(dht, "test-injector", &[]);
        assert!(!probe_round(&client).await);
    }
}
