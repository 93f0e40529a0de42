//! Concurrency limiting and jittered retry scheduling, grounded on
//! `original_source/src/bittorrent/peer_limiter.h` and the resleep jitter in
//! `original_source/src/bittorrent/bep5_announcer.cpp`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, SemaphorePermit};

/// Caps the number of concurrent in-flight attempts against a single
/// resource (a swarm's candidate peers, a set of injector endpoints), the
/// way the original's peer limiter bounds simultaneous connect attempts so
/// a large swarm doesn't open hundreds of sockets at once.
pub struct Scheduler {
    semaphore: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.semaphore
            .acquire()
            .await
            .expect("semaphore is never closed")
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Identity-keyed extension of [Scheduler]: on top of the shared global
/// cap, every distinct peer endpoint gets its own single-slot semaphore, so
/// two in-flight requests against the same endpoint share one slot and the
/// second waits for the first rather than running alongside it.
pub struct PeerLimiter {
    global: Scheduler,
    per_peer: SyncMutex<HashMap<SocketAddr, Arc<Semaphore>>>,
}

/// Holds both the global and per-peer permits for one [PeerLimiter::acquire]
/// call; releases both on drop.
pub struct PeerPermit<'a> {
    _global: SemaphorePermit<'a>,
    _peer: OwnedSemaphorePermit,
}

impl PeerLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            global: Scheduler::new(max_concurrent),
            per_peer: SyncMutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, peer: SocketAddr) -> PeerPermit<'_> {
        let peer_semaphore = {
            let mut map = self.per_peer.lock().unwrap();
            Arc::clone(map.entry(peer).or_insert_with(|| Arc::new(Semaphore::new(1))))
        };

        let peer_permit = peer_semaphore
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        let global_permit = self.global.acquire().await;

        PeerPermit { _global: global_permit, _peer: peer_permit }
    }

    pub fn available(&self) -> usize {
        self.global.available()
    }
}

/// Sleep a uniformly-random duration in `[min, max)`, the way
/// `bep5_announcer.cpp` resleeps for 5-30 minutes between announces so
/// many nodes sharing a swarm don't all wake up in lockstep.
pub async fn jittered_sleep(min: Duration, max: Duration) {
    let span = max.saturating_sub(min);
    let extra = if span.is_zero() {
        Duration::ZERO
    } else {
        let millis = rand::thread_rng().gen_range(0..span.as_millis().max(1) as u64);
        Duration::from_millis(millis)
    };
    tokio::time::sleep(min + extra).await;
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn scheduler_bounds_concurrency() {
        let scheduler = Scheduler::new(2);
        let _a = scheduler.acquire().await;
        let _b = scheduler.acquire().await;
        assert_eq!(scheduler.available(), 0);
    }

    #[tokio::test]
    async fn peer_limiter_shares_one_slot_per_endpoint() {
        let limiter = Arc::new(PeerLimiter::new(4));
        let peer: SocketAddr = "127.0.0.1:6881".parse().unwrap();

        let _held = limiter.acquire(peer).await;

        let limiter2 = Arc::clone(&limiter);
        let second = tokio::spawn(async move {
            let _permit = limiter2.acquire(peer).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished(), "second request for the same peer must wait");

        drop(_held);
        second.await.unwrap();
    }

    #[tokio::test]
    async fn peer_limiter_does_not_serialize_distinct_endpoints() {
        let limiter = PeerLimiter::new(4);
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();

        let _a = limiter.acquire(a).await;
        let _b = tokio::time::timeout(Duration::from_millis(50), limiter.acquire(b))
            .await
            .expect("distinct endpoints must not block each other");
    }

    #[tokio::test]
    async fn jittered_sleep_respects_floor() {
        let start = tokio::time::Instant::now();
        jittered_sleep(Duration::from_millis(5), Duration::from_millis(10)).await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
