use bytes::Bytes;

use crate::gc::GcRound;
use crate::types::id::JobId;
use crate::types::nodes::NodeList;
use crate::types::states::JobState;

/// A job as held by one node.
///
/// `id` and `body` never change after creation; `state`, `qtime`, and the
/// node-copy list are the only mutable parts, and only the owning node's
/// control task mutates them.
///
/// All timestamps are unix seconds in *this* node's clock. A node receiving
/// a replicated copy re-stamps `ctime` to its own clock and recomputes
/// `etime` from the remaining lifetime, so expiry never depends on another
/// node's clock.
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    /// Creation (or local receipt) time.
    pub ctime: u32,
    /// Absolute expiry time; once reached the job is deleted in any state.
    pub etime: u32,
    /// Time of the most recent enqueue or delivery; the base the requeue
    /// interval is measured from.
    pub qtime: u32,
    /// Requeue interval in seconds; 0 disables automatic requeueing.
    pub rtime: u32,
    /// Target replication factor, counting the local copy.
    pub repl: u16,
    /// Peers that may hold a copy.
    pub nodes: NodeList,
    pub body: Bytes,
    /// In-flight GC round; present exactly while the job is acked.
    pub(crate) gc: Option<GcRound>,
    pub(crate) deliveries: u64,
    pub(crate) requeues: u64,
}

impl Job {
    /// Constructs a fresh, locally-created job. The caller is responsible
    /// for enqueueing it and driving replication.
    pub fn new(
        id: JobId,
        now: u32,
        ttl: u32,
        rtime: u32,
        repl: u16,
        body: Bytes,
    ) -> Self {
        Self {
            id,
            state: JobState::Active,
            ctime: now,
            etime: now.saturating_add(ttl),
            qtime: 0,
            rtime,
            repl,
            nodes: NodeList::exhaustive(),
            body,
            gc: None,
            deliveries: 0,
            requeues: 0,
        }
    }

    /// A minimal record for a job this node has only ever seen acknowledged,
    /// never materialised. It exists to absorb the GC round and to swallow
    /// any later, stale replication of the job.
    pub fn tombstone(id: JobId, now: u32, ttl: u32, nodes: NodeList) -> Self {
        Self {
            id,
            state: JobState::Acked,
            ctime: now,
            etime: now.saturating_add(ttl),
            qtime: 0,
            rtime: 0,
            repl: 0,
            nodes,
            body: Bytes::new(),
            gc: None,
            deliveries: 0,
            requeues: 0,
        }
    }

    pub fn numnodes(&self) -> u16 {
        self.nodes.len() as u16
    }

    pub fn expired(&self, now: u32) -> bool {
        now >= self.etime
    }

    /// Remaining lifetime in seconds, used when handing the record to
    /// another node so the receiver can re-anchor expiry to its own clock.
    pub fn remaining_ttl(&self, now: u32) -> u32 {
        self.etime.saturating_sub(now)
    }
}
