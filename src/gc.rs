//! Per-job bookkeeping for acknowledgement garbage collection.
//!
//! Once a job reaches the acked state it carries a [`GcRound`] until the
//! record is deleted. The round fixes the reclamation strategy at the moment
//! of acknowledgement and tracks confirmations and retry timing; the actual
//! message traffic is driven from the queue node, which owns the job table
//! and the cluster collaborators.

use std::collections::HashSet;

use crate::types::id::NodeId;
use crate::types::nodes::NodeList;

/// Initial delay before re-sending SETACK to peers that haven't confirmed.
pub const GC_RETRY_MIN_SECS: u32 = 2;
/// Ceiling on the exponential retry backoff.
pub const GC_RETRY_MAX_SECS: u32 = 60;

/// How an acked job gets reclaimed. Decided once, when the job transitions
/// to acked, and carried through the retry loop unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcStrategy {
    /// The node-copy list is exhaustive: confirm with exactly those peers.
    /// Sufficient because the list is a superset of the true holders, and
    /// minimal because nobody else can hold a copy.
    ListBased,
    /// The holders are unknown (the acknowledgement arrived bare): broadcast
    /// cluster-wide and require a majority, or every reachable node, to
    /// confirm before deleting locally.
    QuorumBased,
}

impl GcStrategy {
    pub fn choose(nodes: &NodeList) -> Self {
        if nodes.is_exhaustive() {
            GcStrategy::ListBased
        } else {
            GcStrategy::QuorumBased
        }
    }
}

/// State of one in-flight GC round.
///
/// For the list-based strategy, the set of peers still owed a confirmation
/// is the job's node-copy list itself (entries are cleared as confirmations
/// arrive). For the quorum strategy, confirmations are counted here instead,
/// since the target set is the whole cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct GcRound {
    pub strategy: GcStrategy,
    confirmed: HashSet<NodeId>,
    next_retry: u32,
    backoff: u32,
    pub retries: u32,
}

impl GcRound {
    pub fn new(strategy: GcStrategy, now: u32) -> Self {
        Self {
            strategy,
            confirmed: HashSet::new(),
            next_retry: now.saturating_add(GC_RETRY_MIN_SECS),
            backoff: GC_RETRY_MIN_SECS,
            retries: 0,
        }
    }

    /// Records a confirmation from `peer`. Duplicate confirmations are
    /// no-ops. Returns true if this peer hadn't confirmed before.
    pub fn confirm(&mut self, peer: NodeId) -> bool {
        self.confirmed.insert(peer)
    }

    pub fn has_confirmed(&self, peer: &NodeId) -> bool {
        self.confirmed.contains(peer)
    }

    /// True once confirmations reach a majority of the cluster, the local
    /// node counting as one of them.
    pub fn quorum_met(&self, cluster_size: usize) -> bool {
        self.confirmed.len() + 1 >= cluster_size / 2 + 1
    }

    pub fn retry_due(&self, now: u32) -> bool {
        now >= self.next_retry
    }

    /// Pushes the retry timer out by a doubling, capped backoff.
    pub fn schedule_retry(&mut self, now: u32) {
        self.retries += 1;
        self.backoff = (self.backoff.saturating_mul(2)).min(GC_RETRY_MAX_SECS);
        self.next_retry = now.saturating_add(self.backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::id::NODE_ID_LEN;

    fn node(c: u8) -> NodeId {
        std::str::from_utf8(&[c; NODE_ID_LEN])
            .unwrap()
            .parse()
            .unwrap()
    }

    #[test]
    fn test_strategy_choice() {
        assert_eq!(
            GcStrategy::choose(&NodeList::exhaustive()),
            GcStrategy::ListBased
        );
        assert_eq!(
            GcStrategy::choose(&NodeList::unknown()),
            GcStrategy::QuorumBased
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut round = GcRound::new(GcStrategy::ListBased, 100);
        assert!(!round.retry_due(100));
        assert!(round.retry_due(100 + GC_RETRY_MIN_SECS));

        let mut now = 100;
        let mut last_gap = 0;
        for _ in 0..10 {
            now += GC_RETRY_MAX_SECS; // always past the timer
            round.schedule_retry(now);
            let gap = round.next_retry - now;
            assert!(gap >= last_gap);
            assert!(gap <= GC_RETRY_MAX_SECS);
            last_gap = gap;
        }
        assert_eq!(last_gap, GC_RETRY_MAX_SECS);
    }

    #[test]
    fn test_quorum_counting() {
        let mut round = GcRound::new(GcStrategy::QuorumBased, 0);

        // Single-node cluster: we are our own majority.
        assert!(round.quorum_met(1));

        // Five nodes: need two peer confirmations plus ourselves.
        assert!(!round.quorum_met(5));
        assert!(round.confirm(node(b'a')));
        assert!(!round.quorum_met(5));
        // Duplicate confirmation counts once.
        assert!(!round.confirm(node(b'a')));
        assert!(!round.quorum_met(5));
        assert!(round.confirm(node(b'b')));
        assert!(round.quorum_met(5));
    }
}
