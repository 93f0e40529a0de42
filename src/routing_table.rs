//! Kademlia-style routing table.
//!
//! Ported behavior-for-behavior from
//! `original_source/src/bittorrent/routing_table.cpp`. Buckets are indexed
//! `0..=k`; bucket `i` holds contacts whose distance to the local id has its
//! highest set bit at position `i`. The last bucket (the "near" bucket) also
//! contains the local id itself and is the only one that ever splits.

use std::time::Instant;

use tracing::trace;

use crate::bucket::{Bucket, Candidate, RoutingNode, BUCKET_SIZE};
use crate::id::Id;
use crate::node::NodeContact;

/// Something the routing table can ask to be done with a contact it wants
/// to verify before trusting it (spec.md §4.3: "schedule a ping").
pub trait PingSink: Send + Sync {
    fn ping(&self, contact: NodeContact);
}

/// A no-op [PingSink], useful for tests that only assert on table state.
#[derive(Default)]
pub struct NullPingSink;

impl PingSink for NullPingSink {
    fn ping(&self, _contact: NodeContact) {}
}

pub struct RoutingTable {
    self_id: Id,
    buckets: Vec<Bucket>,
    ping_sink: Box<dyn PingSink>,
}

impl RoutingTable {
    pub fn new(self_id: Id, ping_sink: Box<dyn PingSink>) -> Self {
        Self {
            self_id,
            buckets: vec![Bucket::default()],
            ping_sink,
        }
    }

    pub fn self_id(&self) -> Id {
        self.self_id
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Total number of live (non-candidate) nodes across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_id_for(&self, id: &Id) -> usize {
        match self.self_id.bucket_index(id) {
            None => self.buckets.len() - 1,
            Some(i) => i.min(self.buckets.len() - 1),
        }
    }

    /// `max_distance(i)`: all bits `< i` cleared, everything else set.
    fn max_distance(&self, bucket_id: usize) -> Id {
        let mut bytes = [0xffu8; 20];
        for bit in 0..bucket_id {
            let byte_i = bit / 8;
            let bit_i = 7 - (bit % 8);
            bytes[byte_i] &= !(1 << bit_i);
        }
        Id::from_bytes(bytes)
    }

    fn would_split_bucket(&self, bucket_id: usize, new_id: &Id) -> bool {
        let dst = self.self_id.distance(new_id);
        if dst > self.max_distance(bucket_id) {
            return false;
        }

        let bucket = &self.buckets[bucket_id];
        if bucket.nodes.len() < BUCKET_SIZE {
            return false;
        }

        let half_dst = self.max_distance(bucket_id + 1);
        let mut count = 0usize;
        if dst <= half_dst {
            count += 1;
        }
        for n in &bucket.nodes {
            if self.self_id.distance(&n.contact.id) <= half_dst {
                count += 1;
            }
        }

        count > 0 && count <= BUCKET_SIZE
    }

    fn split_bucket(&mut self, i: usize) {
        assert_eq!(i, self.buckets.len() - 1);

        let half_dst = self.max_distance(i + 1);
        let self_id = self.self_id;
        let belongs_to_new = move |c: &NodeContact| self_id.distance(&c.id) <= half_dst;

        let mut new_bucket = Bucket::default();
        let old = &mut self.buckets[i];

        let (keep, moved): (Vec<_>, Vec<_>) =
            old.nodes.drain(..).partition(|n| !belongs_to_new(&n.contact));
        old.nodes = keep;
        new_bucket.nodes = moved;

        let (keep, moved): (Vec<_>, Vec<_>) = old
            .verified_candidates
            .drain(..)
            .partition(|c| !belongs_to_new(&c.contact));
        old.verified_candidates = keep.into();
        new_bucket.verified_candidates = moved.into();

        let (keep, moved): (Vec<_>, Vec<_>) = old
            .unverified_candidates
            .drain(..)
            .partition(|c| !belongs_to_new(&c.contact));
        old.unverified_candidates = keep.into();
        new_bucket.unverified_candidates = moved.into();

        self.buckets.push(new_bucket);
    }

    /// Return up to `count` contacts closest to `target`, XOR-distance
    /// ascending.
    pub fn find_closest(&self, target: Id, count: usize) -> Vec<NodeContact> {
        let mut out = Vec::new();
        if count == 0 {
            return out;
        }

        let bucket_i = self.bucket_id_for(&target);
        let mut done = false;

        for bucket in &self.buckets[bucket_i..] {
            for n in &bucket.nodes {
                out.push(n.contact);
                if out.len() >= count {
                    done = true;
                    break;
                }
            }
            if done {
                break;
            }
        }

        let mut i = bucket_i;
        while i > 0 && !done {
            i -= 1;
            for n in &self.buckets[i].nodes {
                out.push(n.contact);
                if out.len() >= count {
                    done = true;
                    break;
                }
            }
            if done {
                break;
            }
        }

        out.sort_by_key(|c| self.self_id.distance(&c.id));
        out.truncate(count);
        out
    }

    /// Record a freshly-seen contact, applying the §4.3 replacement policy.
    pub fn try_add(&mut self, contact: NodeContact, verified: bool) {
        let now = Instant::now();
        let bucket_id = self.bucket_id_for(&contact.id);

        // Step 1: already known — bump it.
        {
            let bucket = &mut self.buckets[bucket_id];
            if let Some(pos) = bucket.nodes.iter().position(|n| n.contact == contact) {
                let mut node = bucket.nodes.remove(pos);
                node.recv_time = now;
                if verified {
                    node.reply_time = Some(now);
                    node.queries_failed = 0;
                    node.ping_ongoing = false;
                }
                bucket.nodes.push(node);
                return;
            }
        }

        // Step 2: drop from either candidate list.
        {
            let bucket = &mut self.buckets[bucket_id];
            bucket.verified_candidates.retain(|c| c.contact != contact);
            bucket.unverified_candidates.retain(|c| c.contact != contact);
        }

        // Step 3: room in this bucket.
        if self.buckets[bucket_id].nodes.len() < BUCKET_SIZE {
            if verified {
                self.buckets[bucket_id]
                    .nodes
                    .push(RoutingNode::new_verified(contact, now));
            } else {
                self.ping_sink.ping(contact);
            }
            return;
        }

        // Step 4: near bucket splitting.
        if self.would_split_bucket(bucket_id, &contact.id) {
            if verified {
                self.buckets[bucket_id]
                    .nodes
                    .push(RoutingNode::new_verified(contact, now));
                self.split_bucket(bucket_id);
            } else {
                self.ping_sink.ping(contact);
            }
            return;
        }

        // Step 5: replace a bad node.
        {
            let bucket = &mut self.buckets[bucket_id];
            if let Some(pos) = bucket.nodes.iter().position(|n| !n.is_good(now)) {
                if verified {
                    bucket.nodes.remove(pos);
                    bucket.nodes.push(RoutingNode::new_verified(contact, now));
                } else {
                    self.ping_sink.ping(contact);
                }
                return;
            }
        }

        // Step 6: queue as a replacement candidate.
        let bucket = &mut self.buckets[bucket_id];

        let mut questionable = 0usize;
        let mut to_ping = Vec::new();
        for n in bucket.nodes.iter_mut() {
            if n.is_questionable(now) {
                questionable += 1;
                if !n.ping_ongoing {
                    n.ping_ongoing = true;
                    to_ping.push(n.contact);
                }
            }
        }
        for c in to_ping {
            self.ping_sink.ping(c);
        }

        let candidate = Candidate {
            contact,
            recv_time: now,
            reply_time: verified.then_some(now),
        };

        if verified {
            if questionable > 0 {
                bucket.verified_candidates.push_back(candidate);
            }
        } else {
            bucket.erase_front_questionable_verified(now);
            if bucket.verified_candidates.len() < questionable {
                bucket.unverified_candidates.push_back(candidate);
            } else {
                self.ping_sink.ping(contact);
            }
        }

        bucket.trim_candidates(questionable);
    }

    /// Record a failed query against `contact`; promotes a queued candidate
    /// if this pushes the node to "bad".
    pub fn fail(&mut self, contact: NodeContact) {
        let now = Instant::now();
        let bucket_id = self.bucket_id_for(&contact.id);
        let bucket = &mut self.buckets[bucket_id];

        let Some(node_i) = bucket.nodes.iter().position(|n| n.contact == contact) else {
            return;
        };

        bucket.nodes[node_i].queries_failed += 1;

        if bucket.nodes[node_i].is_good(now) {
            if bucket.nodes[node_i].is_questionable(now) {
                bucket.nodes[node_i].ping_ongoing = true;
                self.ping_sink.ping(contact);
            }
            return;
        }

        bucket.erase_front_questionable_verified(now);
        bucket.erase_front_questionable_unverified(now);

        if let Some(candidate) = bucket.verified_candidates.pop_front() {
            bucket.nodes.remove(node_i);

            let node = RoutingNode {
                contact: candidate.contact,
                recv_time: candidate.recv_time,
                reply_time: candidate.reply_time,
                queries_failed: 0,
                ping_ongoing: false,
            };

            let insert_at = bucket
                .nodes
                .iter()
                .position(|n| n.recv_time > node.recv_time)
                .unwrap_or(bucket.nodes.len());
            bucket.nodes.insert(insert_at, node);
        } else if let Some(candidate) = bucket.unverified_candidates.pop_front() {
            self.ping_sink.ping(candidate.contact);
        }

        let questionable = bucket.questionable_count(now);
        bucket.trim_candidates(questionable);
    }

    /// Whether this node should accept a `put`/`announce_peer` for `target`
    /// rather than refuse with error 201 (spec.md §4.5): true iff fewer than
    /// `BUCKET_SIZE` known nodes are closer to `target` than `self_id` is.
    pub fn is_responsible_for(&self, target: Id) -> bool {
        let self_distance = self.self_id.distance(&target);
        let closer = self
            .dump()
            .iter()
            .filter(|c| c.id.distance(&target) < self_distance)
            .count();
        closer < BUCKET_SIZE
    }

    /// All contacts we currently trust (live nodes plus verified candidates).
    pub fn dump(&self) -> Vec<NodeContact> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            out.extend(bucket.nodes.iter().map(|n| n.contact));
            out.extend(bucket.verified_candidates.iter().map(|c| c.contact));
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out.dedup();
        out
    }

    #[cfg(test)]
    pub(crate) fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.iter().map(|b| b.nodes.len()).collect()
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("self_id", &self.self_id)
            .field("buckets", &self.buckets.len())
            .field("nodes", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::SocketAddr;

    fn contact_with_prefix(self_id: Id, flip_bit: usize) -> NodeContact {
        // Produce an id that differs from self_id only by flipping one bit,
        // so its distance's highest set bit is exactly `flip_bit`.
        let mut bytes = *self_id.as_bytes();
        let byte_i = flip_bit / 8;
        let bit_i = 7 - (flip_bit % 8);
        bytes[byte_i] ^= 1 << bit_i;
        NodeContact::new(Id::from_bytes(bytes), "127.0.0.1:6881".parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn bucket_mapping_matches_highest_bit() {
        let self_id = Id::random();
        let mut table = RoutingTable::new(self_id, Box::new(NullPingSink));

        for bit in 0..8 {
            let c = contact_with_prefix(self_id, bit);
            table.try_add(c, true);
        }

        // All of these share bucket 0 until a split occurs (since with only
        // 8 nodes differing at bits 0..8, the near bucket never fills up
        // past capacity without a split opportunity on those specific ids).
        assert!(table.len() <= 8);
    }

    #[test]
    fn find_closest_is_size_monotonic() {
        let self_id = Id::random();
        let mut table = RoutingTable::new(self_id, Box::new(NullPingSink));

        for _ in 0..50 {
            table.try_add(
                NodeContact::new(Id::random(), "127.0.0.1:6881".parse().unwrap()),
                true,
            );
        }

        let target = Id::random();
        let small = table.find_closest(target, 4);
        let big = table.find_closest(target, 8);
        assert!(small.len() <= big.len());
        for c in &small {
            assert!(big.contains(c));
        }
    }

    #[test]
    fn try_add_respects_bucket_capacity() {
        let self_id = Id::random();
        let mut table = RoutingTable::new(self_id, Box::new(NullPingSink));

        // Many contacts that all land in the far bucket 0 (flip top bit) —
        // capacity must never exceed BUCKET_SIZE for a bucket that does not
        // contain self and thus never splits.
        for _ in 0..100 {
            let mut bytes = *self_id.as_bytes();
            bytes[0] ^= 0b1000_0000;
            // randomize the rest so ids differ
            getrandom::getrandom(&mut bytes[1..]).unwrap();
            table.try_add(
                NodeContact::new(Id::from_bytes(bytes), "127.0.0.1:6881".parse().unwrap()),
                true,
            );
        }

        for size in table.bucket_sizes() {
            assert!(size <= BUCKET_SIZE);
        }
    }

    #[test]
    fn fail_promotes_candidate() {
        let self_id = Id::random();
        let mut table = RoutingTable::new(self_id, Box::new(NullPingSink));

        // Fill bucket 0 (far bucket, never splits) to capacity.
        let mut contacts = Vec::new();
        for _ in 0..BUCKET_SIZE {
            let mut bytes = *self_id.as_bytes();
            bytes[0] ^= 0b1000_0000;
            getrandom::getrandom(&mut bytes[1..]).unwrap();
            let c = NodeContact::new(Id::from_bytes(bytes), "127.0.0.1:6881".parse().unwrap());
            contacts.push(c);
            table.try_add(c, true);
        }

        // Fail the first one MAX_QUERIES_FAILED+1 times so it becomes bad.
        for _ in 0..5 {
            table.fail(contacts[0]);
        }

        assert_eq!(table.bucket_sizes().iter().sum::<usize>(), BUCKET_SIZE);
    }
}
