//! Bep5-based peer discovery and connection racing: maintains the
//! injector swarm and any helper swarms, and races TCP connects against
//! their members to find one reachable peer quickly.
//!
//! Grounded on `original_source/src/bittorrent/bep5_announcer.cpp` for the
//! swarm-membership side and on the fan-out-with-backoff connect pattern in
//! `examples/other_examples/68f2fa4b_paidforby-ouisync__lib-src-network-mod.rs.rs`.

use std::net::SocketAddr;
use std::sync::Mutex as SyncMutex;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::debug;

use crate::id::Id;
use crate::mainline::MainlineDht;
use crate::swarm::Swarm;
use crate::{Error, Result};

/// Candidates at or past this index pay a staggered delay; the first ten
/// all start at once.
const UNSTAGGERED_CANDIDATES: usize = 10;

/// Per-candidate delay increment past [UNSTAGGERED_CANDIDATES].
const STAGGER_DELAY: Duration = Duration::from_millis(100);

/// A client that discovers and connects to peers of one or more BEP5
/// swarms: an injector swarm (origin content publishers) plus any number
/// of helper swarms (caching relays).
pub struct Bep5Client {
    injector_swarm: Swarm,
    helper_swarms: Vec<Swarm>,
    last_working: SyncMutex<Option<SocketAddr>>,
}

impl Bep5Client {
    pub fn new(dht: MainlineDht, injector_swarm_name: &str, helper_swarm_names: &[String]) -> Self {
        let injector_infohash = MainlineDht::swarm_infohash(injector_swarm_name);
        let injector_swarm = Swarm::join(dht.clone(), injector_infohash);

        let helper_swarms = helper_swarm_names
            .iter()
            .map(|name| Swarm::join(dht.clone(), MainlineDht::swarm_infohash(name)))
            .collect();

        Self {
            injector_swarm,
            helper_swarms,
            last_working: SyncMutex::new(None),
        }
    }

    pub fn injector_infohash(&self) -> Id {
        self.injector_swarm.infohash()
    }

    /// Current known members of the injector swarm.
    pub fn injector_peers(&self) -> Vec<SocketAddr> {
        self.injector_swarm.peers().iter().copied().collect()
    }

    pub fn last_working_endpoint(&self) -> Option<SocketAddr> {
        *self.last_working.lock().unwrap()
    }

    /// Every known candidate endpoint: shuffled injector swarm members
    /// first, then shuffled helper swarm members, with the last-known-
    /// working endpoint (if any) swapped to the front (spec.md §4.7 point
    /// 1).
    fn candidates(&self) -> Vec<SocketAddr> {
        let mut injectors: Vec<SocketAddr> = self.injector_swarm.peers().iter().copied().collect();
        injectors.shuffle(&mut rand::thread_rng());

        let mut helpers: Vec<SocketAddr> = self
            .helper_swarms
            .iter()
            .flat_map(|swarm| swarm.peers().iter().copied().collect::<Vec<_>>())
            .collect();
        helpers.shuffle(&mut rand::thread_rng());

        let mut out = injectors;
        out.extend(helpers);
        out.dedup();

        if let Some(last) = self.last_working_endpoint() {
            out.retain(|addr| *addr != last);
            out.insert(0, last);
        }

        out
    }

    /// Race a TCP connect against every known candidate, staggering starts
    /// past the first ten so an early success short-circuits the rest, and
    /// return the first stream that connects.
    pub async fn connect(&self) -> Result<TcpStream> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(Error::NetworkUnreachable);
        }

        let mut attempts = JoinSet::new();
        for (j, addr) in candidates.into_iter().enumerate() {
            let delay = STAGGER_DELAY * j.saturating_sub(UNSTAGGERED_CANDIDATES) as u32;
            attempts.spawn(async move {
                tokio::time::sleep(delay).await;
                TcpStream::connect(addr).await.map(|stream| (addr, stream))
            });
        }

        while let Some(joined) = attempts.join_next().await {
            if let Ok(Ok((addr, stream))) = joined {
                *self.last_working.lock().unwrap() = Some(addr);
                debug!(?addr, "connected to overlay peer");
                attempts.abort_all();
                return Ok(stream);
            }
        }

        Err(Error::NetworkUnreachable)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_races_candidates_and_returns_reachable_one() {
        let dht = MainlineDht::bind(&["127.0.0.1:0".parse().unwrap()], vec![]).await.unwrap();
        let client = Bep5Client::new(dht, "test-injector", &[]);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        *client.last_working.lock().unwrap() = Some(good_addr);
        let stream = client.connect().await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), good_addr);
    }

    #[tokio::test]
    async fn connect_fails_with_no_candidates() {
        let dht = MainlineDht::bind(&["127.0.0.1:0".parse().unwrap()], vec![]).await.unwrap();
        let client = Bep5Client::new(dht, "test-injector", &[]);
        assert!(client.connect().await.is_err());
    }
}
