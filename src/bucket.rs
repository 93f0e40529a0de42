//! Routing table entries: per-contact liveness bookkeeping and the bucket
//! that stores them, ported from `original_source/src/bittorrent/routing_table.{h,cpp}`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::node::NodeContact;

/// Bucket occupancy target (spec.md §3: "Bucket. ... nodes (capacity 8)").
pub const BUCKET_SIZE: usize = 8;

const GOOD_RECV_WINDOW: Duration = Duration::from_secs(15 * 60);
const GOOD_REPLY_WINDOW: Duration = Duration::from_secs(2 * 60 * 60);
const MAX_QUERIES_FAILED: u32 = 2;

/// A routing-table entry for one known contact.
#[derive(Debug, Clone)]
pub struct RoutingNode {
    pub contact: NodeContact,
    pub recv_time: Instant,
    pub reply_time: Option<Instant>,
    pub queries_failed: u32,
    pub ping_ongoing: bool,
}

impl RoutingNode {
    pub fn new_verified(contact: NodeContact, now: Instant) -> Self {
        Self {
            contact,
            recv_time: now,
            reply_time: Some(now),
            queries_failed: 0,
            ping_ongoing: false,
        }
    }

    /// `queries_failed <= 2 && recv_time within 15 min && reply_time within 2h`.
    pub fn is_good(&self, now: Instant) -> bool {
        self.queries_failed <= MAX_QUERIES_FAILED
            && now.saturating_duration_since(self.recv_time) <= GOOD_RECV_WINDOW
            && self
                .reply_time
                .map(|t| now.saturating_duration_since(t) <= GOOD_REPLY_WINDOW)
                .unwrap_or(false)
    }

    /// `recv_time older than 15 min` — orthogonal to [Self::is_good].
    pub fn is_questionable(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.recv_time) > GOOD_RECV_WINDOW
    }

    pub fn is_bad(&self, now: Instant) -> bool {
        !self.is_good(now)
    }
}

/// A candidate contact waiting to replace a questionable node.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub contact: NodeContact,
    pub recv_time: Instant,
    pub reply_time: Option<Instant>,
}

/// One routing-table bucket: up to [BUCKET_SIZE] live nodes plus bounded
/// replacement candidate queues.
#[derive(Debug, Default)]
pub struct Bucket {
    pub nodes: Vec<RoutingNode>,
    pub verified_candidates: VecDeque<Candidate>,
    pub unverified_candidates: VecDeque<Candidate>,
}

impl Bucket {
    pub fn questionable_count(&self, now: Instant) -> usize {
        self.nodes.iter().filter(|n| n.is_questionable(now)).count()
    }

    /// Drop expired-questionable candidates from the front of `verified_candidates`.
    pub fn erase_front_questionable_verified(&mut self, now: Instant) {
        while let Some(front) = self.verified_candidates.front() {
            if front
                .reply_time
                .map(|t| now.saturating_duration_since(t) > GOOD_RECV_WINDOW)
                .unwrap_or(true)
                || now.saturating_duration_since(front.recv_time) > GOOD_RECV_WINDOW
            {
                self.verified_candidates.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn erase_front_questionable_unverified(&mut self, now: Instant) {
        while let Some(front) = self.unverified_candidates.front() {
            if now.saturating_duration_since(front.recv_time) > GOOD_RECV_WINDOW {
                self.unverified_candidates.pop_front();
            } else {
                break;
            }
        }
    }

    /// Trim candidate queues so their combined size never exceeds
    /// `questionable_count(nodes)` (spec.md §3 Bucket invariant).
    pub fn trim_candidates(&mut self, questionable: usize) {
        while self.verified_candidates.len() > questionable {
            self.verified_candidates.pop_front();
        }
        while self.verified_candidates.len() + self.unverified_candidates.len() > questionable {
            self.unverified_candidates.pop_front();
        }
    }
}
