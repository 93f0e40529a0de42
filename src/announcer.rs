//! Periodic and on-demand re-announcement of this node's own swarm
//! membership, ported from `original_source/src/bittorrent/bep5_announcer.cpp`.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::id::Id;
use crate::mainline::MainlineDht;
use crate::scheduler::jittered_sleep;

const RESLEEP_MIN: Duration = Duration::from_secs(5 * 60);
const RESLEEP_MAX: Duration = Duration::from_secs(30 * 60);
const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Re-announces `infohash` on a uniform-random 5-30 minute cadence,
/// retrying quickly (10s) after a failed attempt rather than waiting out a
/// full cycle.
pub struct Bep5PeriodicAnnouncer {
    cancel: CancellationToken,
}

impl Bep5PeriodicAnnouncer {
    pub fn start(dht: MainlineDht, infohash: Id, port: Option<u16>) -> Self {
        let cancel = CancellationToken::new();
        tokio::spawn(run(dht, infohash, port, cancel.clone()));
        Self { cancel }
    }
}

impl Drop for Bep5PeriodicAnnouncer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(dht: MainlineDht, infohash: Id, port: Option<u16>, cancel: CancellationToken) {
    loop {
        match dht.tracker_announce(infohash, port).await {
            Ok(()) => {
                debug!(?infohash, "periodic announce succeeded");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = jittered_sleep(RESLEEP_MIN, RESLEEP_MAX) => {}
                }
            }
            Err(err) => {
                warn!(?infohash, ?err, "periodic announce failed, retrying soon");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
}

/// Fires an announce on demand (e.g. right after the local listening port
/// changes), outside the periodic cadence above.
pub struct Bep5ManualAnnouncer {
    trigger: mpsc::UnboundedSender<()>,
    cancel: CancellationToken,
}

impl Bep5ManualAnnouncer {
    pub fn start(dht: MainlineDht, infohash: Id, port: Option<u16>) -> Self {
        let (trigger, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => return,
                    received = rx.recv() => {
                        if received.is_none() {
                            return;
                        }
                        if let Err(err) = dht.tracker_announce(infohash, port).await {
                            warn!(?infohash, ?err, "manual announce failed");
                        }
                    }
                }
            }
        });

        Self { trigger, cancel }
    }

    pub fn announce_now(&self) {
        let _ = self.trigger.send(());
    }
}

impl Drop for Bep5ManualAnnouncer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn manual_announcer_accepts_trigger_without_panicking() {
        let dht = MainlineDht::bind(&["127.0.0.1:0".parse().unwrap()], vec![]).await.unwrap();
        let announcer = Bep5ManualAnnouncer::start(dht, Id::random(), None);
        announcer.announce_now();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
