//! Unresponsive-follower handling and quorum accounting.
//!
//! The leader's replication path records per-follower successes and
//! failures here. A follower that fails `failure_threshold` consecutive
//! times is marked Unavailable; its acknowledgments stop counting and
//! the quorum shrinks to the nodes still marked Available (the leader
//! always counts). One success brings a follower back.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{info, warn};

use crate::rpc::{LogIndex, NodeId};

/// Availability of one follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerState {
    Available,
    Unavailable,
}

#[derive(Debug, Clone)]
struct FollowerRecord {
    state: FollowerState,
    consecutive_failures: u32,
}

/// Tracks follower availability and commit progress for one leader.
#[derive(Debug)]
pub struct AvailabilityTracker {
    leader: NodeId,
    failure_threshold: u32,
    followers: HashMap<NodeId, FollowerRecord>,
    /// Follower acks per log index, recorded only while Available.
    acknowledgments: BTreeMap<LogIndex, HashSet<NodeId>>,
    commit_index: LogIndex,
    /// Highest index the leader has proposed; commit never passes it.
    last_proposed: LogIndex,
}

impl AvailabilityTracker {
    pub fn new(leader: NodeId, followers: impl IntoIterator<Item = NodeId>, failure_threshold: u32) -> Self {
        assert!(failure_threshold > 0, "failure_threshold must be nonzero");
        let followers = followers
            .into_iter()
            .filter(|id| *id != leader)
            .map(|id| {
                (
                    id,
                    FollowerRecord {
                        state: FollowerState::Available,
                        consecutive_failures: 0,
                    },
                )
            })
            .collect();
        Self {
            leader,
            failure_threshold,
            followers,
            acknowledgments: BTreeMap::new(),
            commit_index: 0,
            last_proposed: 0,
        }
    }

    /// Note that the leader appended `index` to its log. Commit can
    /// advance up to the highest proposed index; with every follower
    /// unavailable the leader's implicit ack alone commits it.
    pub fn propose(&mut self, index: LogIndex) {
        self.last_proposed = self.last_proposed.max(index);
        self.update_commit_index();
    }

    /// Record a successful response. Resets the failure counter and
    /// revives an Unavailable follower.
    pub fn record_success(&mut self, follower: NodeId) {
        if let Some(record) = self.followers.get_mut(&follower) {
            record.consecutive_failures = 0;
            if record.state == FollowerState::Unavailable {
                record.state = FollowerState::Available;
                info!(follower, "Follower recovered, marked available");
            }
        }
    }

    /// Record a failed RPC. The transition to Unavailable fires once,
    /// when the consecutive count reaches the threshold.
    pub fn record_failure(&mut self, follower: NodeId) {
        if let Some(record) = self.followers.get_mut(&follower) {
            record.consecutive_failures += 1;
            if record.consecutive_failures >= self.failure_threshold
                && record.state == FollowerState::Available
            {
                record.state = FollowerState::Unavailable;
                warn!(
                    follower,
                    failures = record.consecutive_failures,
                    "Follower marked unavailable"
                );
            }
        }
    }

    /// Record an acknowledgment of `index` from `follower`.
    ///
    /// Acks from Unavailable followers are ignored entirely; an
    /// accepted ack also counts as a successful response. Commit index
    /// advances immediately when the ack completes a majority.
    pub fn record_acknowledgment(&mut self, index: LogIndex, follower: NodeId) {
        match self.followers.get(&follower) {
            Some(record) if record.state == FollowerState::Available => {
                self.acknowledgments.entry(index).or_default().insert(follower);
                self.record_success(follower);
                self.update_commit_index();
            }
            Some(_) => {
                warn!(follower, index, "Ignoring ack from unavailable follower");
            }
            None => {
                warn!(follower, index, "Ignoring ack from unknown node");
            }
        }
    }

    /// Follower acks for `index` plus the leader's implicit one.
    pub fn acknowledgment_count(&self, index: LogIndex) -> usize {
        self.acknowledgments
            .get(&index)
            .map(|acks| acks.len())
            .unwrap_or(0)
            + 1
    }

    /// Nodes currently Available, leader included.
    pub fn available_count(&self) -> usize {
        1 + self
            .followers
            .values()
            .filter(|r| r.state == FollowerState::Available)
            .count()
    }

    /// Majority over the currently-available nodes: `available/2 + 1`.
    pub fn majority_needed(&self) -> usize {
        self.available_count() / 2 + 1
    }

    /// Whether `index` is acknowledged by a majority of available nodes.
    pub fn has_majority(&self, index: LogIndex) -> bool {
        self.acknowledgment_count(index) >= self.majority_needed()
    }

    /// The leader can keep committing as long as the available nodes
    /// can form a majority over themselves, which holds for any
    /// available count >= 1.
    pub fn can_continue_replication(&self) -> bool {
        self.available_count() >= self.majority_needed()
    }

    /// Advance the commit index through every consecutive proposed
    /// index that now holds a majority.
    fn update_commit_index(&mut self) {
        let mut next = self.commit_index + 1;
        while next <= self.last_proposed && self.has_majority(next) {
            self.commit_index = next;
            info!(index = next, "Commit index advanced");
            next += 1;
        }
    }

    /// Re-evaluate commit progress against the current availability
    /// set; used after followers drop out, when no further acks are
    /// expected (leader-only progress).
    pub fn reevaluate_commit(&mut self) {
        self.update_commit_index();
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn state(&self, follower: NodeId) -> FollowerState {
        self.followers
            .get(&follower)
            .map(|r| r.state)
            .unwrap_or(FollowerState::Available)
    }

    pub fn consecutive_failures(&self, follower: NodeId) -> u32 {
        self.followers
            .get(&follower)
            .map(|r| r.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn unavailable_count(&self) -> usize {
        self.followers
            .values()
            .filter(|r| r.state == FollowerState::Unavailable)
            .count()
    }

    pub fn leader(&self) -> NodeId {
        self.leader
    }
}
