//! Local BEP5 peer swarm storage with token authorization, grounded on
//! `original_source/src/bittorrent/dht.cpp`'s tracker handling.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::id::Id;
use crate::token::TokenManager;

const MAX_PEERS_PER_INFOHASH: usize = 64;
const PEER_IDLE_EXPIRY: Duration = Duration::from_secs(30 * 60);
const PURGE_AGE: Duration = Duration::from_secs(2 * 60 * 60);

/// Absolute cap on distinct infohashes tracked at once, evicting the
/// least-recently-touched swarm once full.
const MAX_TRACKED_INFOHASHES: usize = 50_000;

struct Peer {
    endpoint: SocketAddr,
    inserted_at: Instant,
}

/// Local storage backing BEP5 `get_peers`/`announce_peer`.
pub struct Tracker {
    swarms: LruCache<Id, Vec<Peer>>,
    tokens: TokenManager,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            swarms: LruCache::new(NonZeroUsize::new(MAX_TRACKED_INFOHASHES).unwrap()),
            tokens: TokenManager::new(),
        }
    }

    pub fn generate_token(&self, peer_ip: IpAddr, infohash: Id) -> Vec<u8> {
        self.tokens.generate(peer_ip, infohash)
    }

    pub fn verify_token(&self, peer_ip: IpAddr, infohash: Id, token: &[u8]) -> bool {
        self.tokens.verify(peer_ip, infohash, token)
    }

    pub fn tick(&mut self) {
        self.tokens.maybe_rotate();
        self.purge();
    }

    fn purge(&mut self) {
        let now = Instant::now();
        let infohashes: Vec<Id> = self.swarms.iter().map(|(id, _)| *id).collect();
        for infohash in infohashes {
            if let Some(peers) = self.swarms.peek_mut(&infohash) {
                peers.retain(|p| now.saturating_duration_since(p.inserted_at) < PEER_IDLE_EXPIRY);
                if peers.is_empty() {
                    self.swarms.pop(&infohash);
                }
            }
        }

        // PURGE_AGE purely documents the intent above (same cadence as
        // DataStore's); the real bound is idle expiry plus the LRU cap.
        let _ = PURGE_AGE;
    }

    /// Record `endpoint` as announcing on `infohash`, FIFO-trimming to
    /// [MAX_PEERS_PER_INFOHASH].
    pub fn add_peer(&mut self, infohash: Id, endpoint: SocketAddr) {
        if self.swarms.get(&infohash).is_none() {
            self.swarms.put(infohash, Vec::new());
        }
        let peers = self.swarms.get_mut(&infohash).expect("just inserted");

        if let Some(existing) = peers.iter_mut().find(|p| p.endpoint == endpoint) {
            existing.inserted_at = Instant::now();
            return;
        }

        peers.push(Peer {
            endpoint,
            inserted_at: Instant::now(),
        });

        if peers.len() > MAX_PEERS_PER_INFOHASH {
            peers.remove(0);
        }
    }

    /// Peers announced for `infohash`, capped to 50 entries (spec.md §4.5:
    /// "capped at 50 entries, which fits a single UDP datagram").
    pub fn get_peers(&mut self, infohash: &Id, limit: usize) -> Vec<SocketAddr> {
        self.swarms
            .get(infohash)
            .map(|peers| peers.iter().rev().take(limit).map(|p| p.endpoint).collect())
            .unwrap_or_default()
    }

    pub fn has_peers(&mut self, infohash: &Id) -> bool {
        self.swarms.get(infohash).map(|p| !p.is_empty()).unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fifo_trim_at_capacity() {
        let mut tracker = Tracker::new();
        let infohash = Id::random();

        for port in 0..(MAX_PEERS_PER_INFOHASH as u16 + 10) {
            let ep: SocketAddr = format!("127.0.0.1:{}", 10000 + port).parse().unwrap();
            tracker.add_peer(infohash, ep);
        }

        assert_eq!(
            tracker.get_peers(&infohash, MAX_PEERS_PER_INFOHASH + 20).len(),
            MAX_PEERS_PER_INFOHASH
        );
    }

    #[test]
    fn get_peers_respects_limit() {
        let mut tracker = Tracker::new();
        let infohash = Id::random();
        for port in 0..10u16 {
            tracker.add_peer(infohash, format!("127.0.0.1:{}", 20000 + port).parse().unwrap());
        }
        assert_eq!(tracker.get_peers(&infohash, 3).len(), 3);
    }

    #[test]
    fn token_roundtrip() {
        let tracker = Tracker::new();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        let infohash = Id::random();
        let token = tracker.generate_token(ip, infohash);
        assert!(tracker.verify_token(ip, infohash, &token));
    }
}
