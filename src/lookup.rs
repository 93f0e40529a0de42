//! Recursive closest-node lookup, ported from
//! `original_source/src/bittorrent/collect.h` and
//! `original_source/src/bittorrent/proximity_map.h`.
//!
//! The original runs this as a tree of stackful coroutines under one
//! cancellation signal; the bounded-concurrency shape (a worker pool racing
//! against a shared "closest so far" set) carries over directly to a
//! `tokio::task::JoinSet`, following the fan-out-then-drain pattern in
//! `examples/other_examples/68f2fa4b_paidforby-ouisync__lib-src-network-mod.rs.rs`.

use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::id::Id;
use crate::node::NodeContact;

/// Default worker pool size for a [collect] run (spec.md §4.5: "bounded
/// concurrency (64 workers)").
pub const DEFAULT_CONCURRENCY: usize = 64;

#[derive(Clone, Copy)]
struct Entry {
    contact: NodeContact,
    queried: bool,
}

/// Tracks the `k` contacts closest to `target` seen so far, and which of
/// them have already been queried. A lookup is done once every entry within
/// the top `k` has been queried and no closer contact has appeared since.
pub struct ProximityMap {
    target: Id,
    k: usize,
    entries: Vec<Entry>,
}

impl ProximityMap {
    pub fn new(target: Id, k: usize) -> Self {
        Self {
            target,
            k,
            entries: Vec::new(),
        }
    }

    fn cmp_by_distance(&self, a: &NodeContact, b: &NodeContact) -> Ordering {
        self.target.distance(&a.id).cmp(&self.target.distance(&b.id))
    }

    /// Merge newly-discovered contacts in, keeping only the closest `k`.
    /// Returns true if the top-`k` set changed (a closer node appeared).
    pub fn merge(&mut self, found: impl IntoIterator<Item = NodeContact>) -> bool {
        let before: Vec<Id> = self.entries.iter().take(self.k).map(|e| e.contact.id).collect();

        for contact in found {
            if self.entries.iter().any(|e| e.contact.id == contact.id) {
                continue;
            }
            self.entries.push(Entry {
                contact,
                queried: false,
            });
        }

        self.entries.sort_by(|a, b| self.cmp_by_distance(&a.contact, &b.contact));
        self.entries.truncate(self.k.max(1) * 4);

        let after: Vec<Id> = self.entries.iter().take(self.k).map(|e| e.contact.id).collect();
        before != after
    }

    pub fn mark_queried(&mut self, id: &Id) {
        if let Some(e) = self.entries.iter_mut().find(|e| &e.contact.id == id) {
            e.queried = true;
        }
    }

    /// Next unqueried contact within the top `k`, if any.
    pub fn next_unqueried(&self) -> Option<NodeContact> {
        self.entries
            .iter()
            .take(self.k)
            .find(|e| !e.queried)
            .map(|e| e.contact)
    }

    pub fn closest(&self) -> Vec<NodeContact> {
        self.entries.iter().take(self.k).map(|e| e.contact).collect()
    }
}

/// Outcome of querying one contact during a [collect] run.
pub enum QueryOutcome {
    /// The contact responded with more candidate nodes.
    Nodes(Vec<NodeContact>),
    /// The contact didn't respond or errored; drop it from consideration.
    Failed,
}

/// Recursive closest-node search, as used for `find_node`/bootstrap,
/// `get_peers`, and `get`.
///
/// Spawns up to `concurrency` concurrent queries against the closest
/// unqueried candidates, merging each reply's contacts back into the
/// shared [ProximityMap], until the top-`k` set stabilizes (no unqueried
/// entries remain and no closer contact appeared in the last round).
pub async fn collect<Q, Fut>(
    target: Id,
    seeds: Vec<NodeContact>,
    k: usize,
    concurrency: usize,
    cancel: CancellationToken,
    query: Q,
) -> Vec<NodeContact>
where
    Q: Fn(NodeContact) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueryOutcome> + Send + 'static,
{
    let map = Arc::new(AsyncMutex::new(ProximityMap::new(target, k)));
    map.lock().await.merge(seeds);

    let query = Arc::new(query);
    let mut in_flight = JoinSet::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        while in_flight.len() < concurrency {
            let next = {
                let mut guard = map.lock().await;
                let next = guard.next_unqueried();
                if let Some(contact) = next {
                    guard.mark_queried(&contact.id);
                }
                next
            };

            let Some(contact) = next else { break };

            let query = Arc::clone(&query);
            in_flight.spawn(async move { (contact, query(contact).await) });
        }

        if in_flight.is_empty() {
            break;
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };

        let Ok((_contact, outcome)) = joined else {
            continue;
        };

        if let QueryOutcome::Nodes(found) = outcome {
            map.lock().await.merge(found);
        }
    }

    map.lock().await.closest()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn contact(byte: u8) -> NodeContact {
        let mut bytes = [0u8; 20];
        bytes[0] = byte;
        let addr: SocketAddr = format!("127.0.0.1:{}", 10000 + byte as u16).parse().unwrap();
        NodeContact::new(Id::from_bytes(bytes), addr)
    }

    #[test]
    fn proximity_map_keeps_closest_k() {
        let target = Id::from_bytes([0u8; 20]);
        let mut map = ProximityMap::new(target, 2);
        map.merge(vec![contact(3), contact(1), contact(2)]);
        let closest = map.closest();
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0].id, contact(1).id);
    }

    #[tokio::test]
    async fn collect_terminates_with_no_new_nodes() {
        let target = Id::from_bytes([0u8; 20]);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);

        let result = collect(
            target,
            vec![contact(5)],
            8,
            4,
            CancellationToken::new(),
            move |_contact| {
                calls2.fetch_add(1, Ordering::SeqCst);
                async move { QueryOutcome::Nodes(vec![]) }
            },
        )
        .await;

        assert_eq!(result.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn collect_respects_cancellation() {
        let target = Id::from_bytes([0u8; 20]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = collect(target, vec![contact(1)], 8, 4, cancel, |_| async {
            QueryOutcome::Failed
        })
        .await;

        assert_eq!(result.len(), 1);
    }
}
