//! The queue core of one cluster node: the job table, the per-job state
//! machine, and the acknowledgement GC coordinator.
//!
//! Everything here runs on the node's single control task. Entry points take
//! the current unix time as an argument rather than reading a clock, so the
//! whole core is deterministic under test; nothing in this module performs
//! I/O beyond handing messages to the [`Messenger`].

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::cluster::{Membership, Messenger};
use crate::error::{CoreError, Result};
use crate::gc::{GcRound, GcStrategy};
use crate::store::JobTable;
use crate::types::id::{JobId, JobIdGenerator, NodeId};
use crate::types::job::Job;
use crate::types::nodes::NodeList;
use crate::types::protocol::{JobStats, ServerStats};
use crate::types::record;
use crate::types::states::JobState;

/// Lifetime of a tombstone record created from a bare acknowledgement
/// notice. The notice carries no expiry of its own, so the tombstone gets a
/// fixed window in which to finish its GC round and absorb stale
/// replications.
const TOMBSTONE_TTL_SECS: u32 = 3600;

/// The result of recording an acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// First acknowledgement: the job is now acked and a GC round began.
    Acked,
    /// The job was already acked. No side effects, no new GC traffic.
    Duplicate,
}

#[derive(Debug, Default)]
struct Counters {
    jobs_created: u64,
    deliveries: u64,
    acked: u64,
    expired: u64,
    requeued: u64,
    gc_optimised: u64,
    gc_fallback: u64,
    gc_completed: u64,
    gc_retries: u64,
}

/// One node's view of the replicated queue.
pub struct QueueNode<M, C> {
    table: JobTable,
    messenger: M,
    membership: C,
    idgen: JobIdGenerator,
    max_body: u64,
    counters: Counters,
}

impl<M: Messenger, C: Membership> QueueNode<M, C> {
    pub fn new(membership: C, messenger: M, max_body: u64) -> Self {
        let idgen = JobIdGenerator::new(membership.self_id());
        Self {
            table: JobTable::new(),
            messenger,
            membership,
            idgen,
            max_body,
            counters: Counters::default(),
        }
    }

    pub fn membership(&self) -> &C {
        &self.membership
    }

    /// The transport layer feeds reachability changes through this; the core
    /// itself only ever reads membership.
    pub fn membership_mut(&mut self) -> &mut C {
        &mut self.membership
    }

    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.table.get(id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Creates a job, queues it locally, and fires replication attempts at
    /// up to `repl - 1` reachable peers. Every peer we attempt is recorded
    /// in the node-copy list whether or not the copy ever lands.
    pub fn create(
        &mut self,
        now: u32,
        ttl: u32,
        rtime: u32,
        repl: u16,
        body: Bytes,
    ) -> Result<JobId> {
        if body.len() as u64 > self.max_body {
            return Err(CoreError::BodyTooLarge {
                size: body.len() as u64,
                max: self.max_body,
            });
        }

        let repl = repl.max(1);
        let id = self.idgen.next(now);
        let mut job = Job::new(id, now, ttl, rtime, repl, body);

        // The local copy counts towards the replication factor.
        let targets: Vec<NodeId> = self
            .membership
            .peers()
            .into_iter()
            .filter(|p| self.membership.is_reachable(p))
            .take(repl as usize - 1)
            .collect();

        // List every target before sending, so each copy carries the full
        // set of peers that may end up holding the job.
        for peer in &targets {
            job.nodes.record_attempt(*peer);
        }
        for peer in &targets {
            self.messenger.send_repljob(peer, &job);
        }

        debug!(job = %id, repl, numnodes = job.numnodes(), "created job");

        self.table.insert(job);
        self.table.enqueue(&id, now);
        self.counters.jobs_created += 1;

        Ok(id)
    }

    /// Hands the next queued job to a consumer, moving it to the wait-ack
    /// state. Jobs found expired at the head of the queue are deleted on the
    /// spot rather than delivered.
    pub fn deliver(&mut self, now: u32) -> Option<(JobId, Bytes)> {
        loop {
            let job = self.table.pop_queued()?;

            if job.expired(now) {
                let id = job.id;
                self.table.remove(&id);
                self.counters.expired += 1;
                debug!(job = %id, "expired at delivery");
                continue;
            }

            job.state = JobState::WaitAck;
            // The consumer's lease starts now; the requeue interval is
            // measured from here.
            job.qtime = now;
            job.deliveries += 1;
            let result = (job.id, job.body.clone());

            self.counters.deliveries += 1;
            return Some(result);
        }
    }

    /// Records a local client's acknowledgement. Acknowledging a job twice
    /// is an explicit no-op; acknowledging a job this node doesn't hold is
    /// an error surfaced to the client.
    pub fn ack(
        &mut self,
        now: u32,
        id: &JobId,
    ) -> Result<AckOutcome> {
        if !self.table.contains(id) {
            return Err(CoreError::UnknownJob(*id));
        }
        Ok(self.acknowledge(now, *id, None))
    }

    /// Handles an inbound REPLJOB: a peer pushing a copy of a job to us.
    pub fn on_repljob(
        &mut self,
        now: u32,
        from: &NodeId,
        data: &[u8],
    ) -> Result<()> {
        let mut job = record::decode(data)?;

        if let Some(existing) = self.table.get_mut(&job.id) {
            if existing.state == JobState::Acked {
                // Stale replication of a job we already know is done; the
                // tombstone (or acked copy) swallows it.
                debug!(job = %job.id, "ignoring replication of acked job");
            } else {
                // A retransmit. The sender evidently holds a copy, and its
                // list may name holders we haven't heard of.
                existing.nodes.record_attempt(*from);
                let me = *self.membership.self_id();
                for node in job.nodes.to_vec() {
                    if node != me {
                        existing.nodes.record_attempt(node);
                    }
                }
            }
            return Ok(());
        }

        // A fresh copy. Re-anchor the clock-dependent fields to our own
        // clock, preserving the remaining lifetime rather than the absolute
        // deadline, and rebase the node list to our perspective: drop
        // ourselves, add the sender.
        let remaining = job.etime.saturating_sub(job.ctime);
        job.ctime = now;
        job.etime = now.saturating_add(remaining);
        job.state = JobState::Active;

        let me = *self.membership.self_id();
        let mut nodes = NodeList::exhaustive();
        for node in job.nodes.to_vec() {
            if node != me {
                nodes.record_attempt(node);
            }
        }
        if *from != me {
            nodes.record_attempt(*from);
        }
        job.nodes = nodes;

        debug!(job = %job.id, from = %from, "holding replicated copy");
        self.table.insert(job);
        Ok(())
    }

    /// Handles an inbound SETACK: a peer telling us the job is acknowledged.
    ///
    /// Whatever else happens, the sender gets a GOTACK back (processing
    /// this message records the acknowledgement, which is all GOTACK
    /// promises), and the sender is counted as confirmed in our
    /// own round, since it evidently knows the job is acked.
    pub fn on_setack(
        &mut self,
        now: u32,
        from: &NodeId,
        id: &JobId,
        nodes: Option<Vec<NodeId>>,
    ) {
        let me = *self.membership.self_id();
        let inherited: Option<Vec<NodeId>> = nodes.map(|list| {
            list.into_iter().filter(|n| *n != me).collect()
        });

        if self.table.contains(id) {
            self.acknowledge(now, *id, inherited);
        } else {
            // We only ever saw the acknowledgement, never the job. Keep a
            // tombstone so a stale REPLJOB can't resurrect it, and run GC
            // for our own bookkeeping: list-based if the notice brought the
            // holder list, quorum otherwise.
            let list = match inherited {
                Some(nodes) => NodeList::inherited(nodes),
                None => NodeList::unknown(),
            };
            info!(job = %id, from = %from, bare = list.is_empty(), "acknowledgement for unknown job, keeping tombstone");
            self.table
                .insert(Job::tombstone(*id, now, TOMBSTONE_TTL_SECS, list));
            self.counters.acked += 1;
            self.start_gc(now, *id);
        }

        self.confirm_peer(from, id);
        self.messenger.send_gotack(from, id);
    }

    /// Handles an inbound GOTACK: a peer confirming a GC request of ours.
    /// Duplicates and strays (the job is already gone) are no-ops.
    pub fn on_gotack(&mut self, _now: u32, from: &NodeId, id: &JobId) {
        self.confirm_peer(from, id);
    }

    /// Periodic maintenance, run cooperatively with message processing:
    /// expiry, timeout requeues, and GC retry timers. Never blocks; at most
    /// it enqueues outbound messages.
    pub fn tick(&mut self, now: u32) {
        self.scan_expired(now);
        self.scan_requeue(now);
        self.scan_gc_retries(now);
    }

    pub fn job_stats(&self, now: u32, id: &JobId) -> Option<JobStats> {
        let job = self.table.get(id)?;
        Some(JobStats {
            id: job.id,
            state: job.state,
            age: now.saturating_sub(job.ctime),
            ttl_left: job.remaining_ttl(now),
            retry: job.rtime,
            repl: job.repl,
            numnodes: job.numnodes(),
            body_size: job.body.len() as u64,
            deliveries: job.deliveries,
            requeues: job.requeues,
        })
    }

    pub fn server_stats(&self) -> ServerStats {
        let mut by_state = [0u64; 4];
        for job in self.table.iter() {
            by_state[job.state.to_wire() as usize] += 1;
        }

        ServerStats {
            node_id: *self.membership.self_id(),
            cluster_size: self.membership.cluster_size() as u64,
            current_jobs_active: by_state[0],
            current_jobs_queued: by_state[1],
            current_jobs_waitack: by_state[2],
            current_jobs_acked: by_state[3],
            total_jobs: self.counters.jobs_created,
            total_deliveries: self.counters.deliveries,
            total_acked: self.counters.acked,
            total_expired: self.counters.expired,
            total_requeued: self.counters.requeued,
            gc_rounds_optimised: self.counters.gc_optimised,
            gc_rounds_fallback: self.counters.gc_fallback,
            gc_rounds_completed: self.counters.gc_completed,
            gc_retries: self.counters.gc_retries,
            max_body_size: self.max_body,
        }
    }

    /// Flips a held job to acked and starts its GC round. The caller has
    /// checked the job exists. `inherited` is a holder list arriving with a
    /// peer's SETACK; it is adopted only if our own list isn't exhaustive,
    /// and only at this transition; the strategy is decided once.
    fn acknowledge(
        &mut self,
        now: u32,
        id: JobId,
        inherited: Option<Vec<NodeId>>,
    ) -> AckOutcome {
        let Some(job) = self.table.get_mut(&id) else {
            return AckOutcome::Duplicate;
        };

        if job.state == JobState::Acked {
            debug!(job = %id, "duplicate acknowledgement");
            return AckOutcome::Duplicate;
        }

        job.state = JobState::Acked;
        if let Some(nodes) = inherited {
            if !job.nodes.is_exhaustive() {
                job.nodes = NodeList::inherited(nodes);
            }
        }

        self.counters.acked += 1;
        self.start_gc(now, id);
        AckOutcome::Acked
    }

    /// Chooses the reclamation strategy for a freshly-acked job, opens its
    /// round, and fires the first wave of SETACKs.
    fn start_gc(&mut self, now: u32, id: JobId) {
        let Some(job) = self.table.get_mut(&id) else {
            return;
        };

        let strategy = GcStrategy::choose(&job.nodes);
        job.gc = Some(GcRound::new(strategy, now));

        match strategy {
            GcStrategy::ListBased => self.counters.gc_optimised += 1,
            GcStrategy::QuorumBased => self.counters.gc_fallback += 1,
        }
        info!(job = %id, ?strategy, "job acked, starting GC round");

        self.kick_gc(id);
        self.try_finish_gc(id);
    }

    /// Sends (or re-sends) SETACK to every peer still owed a confirmation.
    /// Listed peers that have since left the cluster are implicitly
    /// confirmed: an evicted node cannot hold a meaningful copy.
    fn kick_gc(&mut self, id: JobId) {
        let (strategy, listed) = {
            let Some(job) = self.table.get(&id) else {
                return;
            };
            let Some(round) = &job.gc else {
                return;
            };
            match round.strategy {
                GcStrategy::ListBased => {
                    (GcStrategy::ListBased, job.nodes.to_vec())
                },
                GcStrategy::QuorumBased => {
                    let pending = self
                        .membership
                        .peers()
                        .into_iter()
                        .filter(|p| !round.has_confirmed(p))
                        .collect();
                    (GcStrategy::QuorumBased, pending)
                },
            }
        };

        match strategy {
            GcStrategy::ListBased => {
                let (members, evicted): (Vec<NodeId>, Vec<NodeId>) = listed
                    .into_iter()
                    .partition(|p| self.membership.is_member(p));

                for peer in evicted {
                    warn!(job = %id, peer = %peer, "listed peer no longer a cluster member, treating as confirmed");
                    if let Some(job) = self.table.get_mut(&id) {
                        job.nodes.confirm_clear(&peer);
                    }
                }

                let nodes = match self.table.get(&id) {
                    Some(job) => job.nodes.clone(),
                    None => return,
                };
                for peer in members {
                    self.messenger.send_setack(&peer, &id, Some(&nodes));
                }
            },
            GcStrategy::QuorumBased => {
                for peer in listed {
                    self.messenger.send_setack(&peer, &id, None);
                }
            },
        }
    }

    /// Records a confirmation from `from` for the job's round, deleting the
    /// job if the round's completion condition is now met. Idempotent:
    /// re-confirming a cleared peer changes nothing.
    fn confirm_peer(&mut self, from: &NodeId, id: &JobId) {
        let newly_confirmed = {
            let Some(job) = self.table.get_mut(id) else {
                debug!(job = %id, from = %from, "confirmation for absent job");
                return;
            };
            if job.state != JobState::Acked {
                // A GOTACK can only answer a SETACK of ours, so this is
                // stale traffic from an earlier life of the connection.
                debug!(job = %id, from = %from, "confirmation for unacked job, ignoring");
                return;
            }
            let Some(round) = &mut job.gc else {
                return;
            };
            match round.strategy {
                GcStrategy::ListBased => job.nodes.confirm_clear(from),
                GcStrategy::QuorumBased => round.confirm(*from),
            }
        };

        if newly_confirmed {
            self.try_finish_gc(*id);
        }
    }

    /// Deletes the job if its GC round is complete: every listed peer
    /// accounted for (list-based), or a majority / all-reachable
    /// confirmation (quorum).
    fn try_finish_gc(&mut self, id: JobId) {
        let satisfied = {
            let Some(job) = self.table.get(&id) else {
                return;
            };
            let Some(round) = &job.gc else {
                return;
            };
            match round.strategy {
                GcStrategy::ListBased => job.nodes.is_complete(),
                GcStrategy::QuorumBased => {
                    let reachable: Vec<NodeId> = self
                        .membership
                        .peers()
                        .into_iter()
                        .filter(|p| self.membership.is_reachable(p))
                        .collect();
                    round.quorum_met(self.membership.cluster_size())
                        || (!reachable.is_empty()
                            && reachable
                                .iter()
                                .all(|p| round.has_confirmed(p)))
                },
            }
        };

        if satisfied {
            self.table.remove(&id);
            self.counters.gc_completed += 1;
            info!(job = %id, "GC round complete, job deleted");
        }
    }

    /// Deletes every job past its expiry time, in any state. Expiry
    /// dominates: an acked job whose round never completed goes too, a
    /// bounded leak reclaimed here.
    fn scan_expired(&mut self, now: u32) {
        for id in self.table.ids() {
            let Some(job) = self.table.get(&id) else {
                continue;
            };
            if !job.expired(now) {
                continue;
            }

            if job.gc.is_some() {
                warn!(job = %id, "expiry reached before GC round completed, deleting anyway");
            } else {
                debug!(job = %id, state = ?job.state, "job expired");
            }
            self.table.remove(&id);
            self.counters.expired += 1;
        }
    }

    /// Returns timed-out deliveries to the queue, and queues replica copies
    /// whose origin has gone quiet (the at-least-once failover path).
    fn scan_requeue(&mut self, now: u32) {
        let mut due: Vec<JobId> = Vec::new();

        for job in self.table.iter() {
            if job.rtime == 0 {
                continue;
            }
            let deadline = match job.state {
                JobState::WaitAck => job.qtime.saturating_add(job.rtime),
                // A replica copy this node never queued: if nobody delivers
                // and acks it within the requeue interval, we offer it
                // ourselves.
                JobState::Active => {
                    job.qtime.max(job.ctime).saturating_add(job.rtime)
                },
                _ => continue,
            };
            if now >= deadline {
                due.push(job.id);
            }
        }

        for id in due {
            if let Some(job) = self.table.get_mut(&id) {
                job.requeues += 1;
                debug!(job = %id, state = ?job.state, "requeueing");
            }
            self.table.enqueue(&id, now);
            self.counters.requeued += 1;
        }
    }

    /// Re-sends SETACKs for rounds whose retry timer has come due, with
    /// exponential backoff. Expiry (handled first in the tick) bounds how
    /// long this can go on for any one job.
    fn scan_gc_retries(&mut self, now: u32) {
        let mut due: Vec<JobId> = Vec::new();

        for job in self.table.iter() {
            if let Some(round) = &job.gc {
                if round.retry_due(now) {
                    due.push(job.id);
                }
            }
        }

        for id in due {
            if let Some(job) = self.table.get_mut(&id) {
                if let Some(round) = &mut job.gc {
                    round.schedule_retry(now);
                    debug!(job = %id, retries = round.retries, "retrying GC round");
                }
            }
            self.counters.gc_retries += 1;
            self.kick_gc(id);
            self.try_finish_gc(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::membership::StaticMembership;
    use crate::types::id::{JOB_ID_LEN, NODE_ID_LEN};

    #[derive(Clone, Debug, PartialEq)]
    enum Sent {
        ReplJob {
            to: NodeId,
            record: Bytes,
        },
        SetAck {
            to: NodeId,
            id: JobId,
            nodes: Option<Vec<NodeId>>,
        },
        GotAck {
            to: NodeId,
            id: JobId,
        },
    }

    /// Captures outbound traffic instead of sending it, so tests can assert
    /// on exactly what the core asked the cluster to do.
    #[derive(Default)]
    struct RecordingMessenger {
        sent: Vec<Sent>,
    }

    impl Messenger for RecordingMessenger {
        fn send_repljob(&mut self, peer: &NodeId, job: &Job) {
            self.sent.push(Sent::ReplJob {
                to: *peer,
                record: record::encode(job),
            });
        }

        fn send_setack(
            &mut self,
            peer: &NodeId,
            id: &JobId,
            nodes: Option<&NodeList>,
        ) {
            self.sent.push(Sent::SetAck {
                to: *peer,
                id: *id,
                nodes: nodes.map(|n| n.to_vec()),
            });
        }

        fn send_gotack(&mut self, peer: &NodeId, id: &JobId) {
            self.sent.push(Sent::GotAck { to: *peer, id: *id });
        }
    }

    type TestNode = QueueNode<RecordingMessenger, StaticMembership>;

    fn node_id(c: u8) -> NodeId {
        NodeId::try_from(&[c; NODE_ID_LEN][..]).unwrap()
    }

    fn job_id(c: u8) -> JobId {
        JobId::try_from(&[c; JOB_ID_LEN][..]).unwrap()
    }

    /// A node whose own ID is `0`, in a cluster with the given peers.
    fn cluster(peers: &[u8]) -> TestNode {
        let peers = peers.iter().map(|c| node_id(*c)).collect();
        QueueNode::new(
            StaticMembership::new(node_id(b'0'), peers),
            RecordingMessenger::default(),
            1024,
        )
    }

    fn setacks_to(node: &TestNode) -> Vec<NodeId> {
        node.messenger
            .sent
            .iter()
            .filter_map(|s| match s {
                Sent::SetAck { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    /// An encoded record as another node would send it: its clock, its node
    /// list.
    fn foreign_record(
        id: JobId,
        ctime: u32,
        etime: u32,
        rtime: u32,
        listed: &[u8],
    ) -> Bytes {
        let mut job =
            Job::new(id, ctime, etime - ctime, rtime, 2, Bytes::from_static(b"payload"));
        for c in listed {
            job.nodes.record_attempt(node_id(*c));
        }
        record::encode(&job)
    }

    #[test]
    fn test_create_replicates_to_reachable_peers() {
        let mut node = cluster(&[b'b', b'c', b'd', b'e']);
        node.membership_mut().mark_unreachable(&node_id(b'd'));
        node.membership_mut().mark_unreachable(&node_id(b'e'));

        let id = node
            .create(100, 60, 5, 3, Bytes::from_static(b"work"))
            .unwrap();

        let job = node.job(&id).unwrap();
        assert_eq!(job.state, JobState::Queued);
        // Both reachable peers attempted, nothing more available.
        assert_eq!(job.numnodes(), 2);
        assert!(job.nodes.contains(&node_id(b'b')));
        assert!(job.nodes.contains(&node_id(b'c')));

        let targets: Vec<NodeId> = node
            .messenger
            .sent
            .iter()
            .map(|s| match s {
                Sent::ReplJob { to, record } => {
                    // Each copy carries the full attempt list.
                    let sent = record::decode(record).unwrap();
                    assert_eq!(sent.nodes.len(), 2);
                    assert_eq!(sent.body, Bytes::from_static(b"work"));
                    *to
                },
                other => panic!("unexpected message {other:?}"),
            })
            .collect();
        assert_eq!(targets, vec![node_id(b'b'), node_id(b'c')]);
    }

    #[test]
    fn test_body_size_limit() {
        let mut node = cluster(&[]);
        let body = Bytes::from(vec![0u8; 2048]);
        assert_eq!(
            node.create(0, 60, 0, 1, body),
            Err(CoreError::BodyTooLarge {
                size: 2048,
                max: 1024
            })
        );
    }

    #[test]
    fn test_optimised_gc_confirms_with_exactly_the_listed_peers() {
        let mut node = cluster(&[b'b', b'c', b'd', b'e']);
        node.membership_mut().mark_unreachable(&node_id(b'd'));
        node.membership_mut().mark_unreachable(&node_id(b'e'));

        let id = node
            .create(100, 60, 5, 3, Bytes::from_static(b"work"))
            .unwrap();
        let (delivered, _) = node.deliver(101).unwrap();
        assert_eq!(delivered, id);
        node.messenger.sent.clear();

        assert_eq!(node.ack(102, &id), Ok(AckOutcome::Acked));
        assert_eq!(node.server_stats().gc_rounds_optimised, 1);
        assert_eq!(node.server_stats().gc_rounds_fallback, 0);

        // SETACK went to exactly the two listed peers, with the list.
        assert_eq!(setacks_to(&node), vec![node_id(b'b'), node_id(b'c')]);
        for sent in &node.messenger.sent {
            if let Sent::SetAck { nodes, .. } = sent {
                assert_eq!(
                    nodes.as_deref(),
                    Some(&[node_id(b'b'), node_id(b'c')][..])
                );
            }
        }

        // One confirmation isn't enough...
        node.on_gotack(103, &node_id(b'b'), &id);
        assert!(node.job(&id).is_some());

        // ...both are: the job is deleted locally.
        node.on_gotack(104, &node_id(b'c'), &id);
        assert!(node.job(&id).is_none());
        assert_eq!(node.server_stats().gc_rounds_completed, 1);

        // A late, duplicated confirmation is harmless.
        node.on_gotack(105, &node_id(b'c'), &id);
    }

    #[test]
    fn test_duplicate_ack_is_a_noop() {
        let mut node = cluster(&[b'b']);
        let id = node
            .create(0, 60, 5, 2, Bytes::from_static(b"x"))
            .unwrap();
        assert!(node.deliver(1).is_some());

        assert_eq!(node.ack(2, &id), Ok(AckOutcome::Acked));
        let sent_after_first = node.messenger.sent.len();

        assert_eq!(node.ack(3, &id), Ok(AckOutcome::Duplicate));
        // No new GC broadcast for the duplicate.
        assert_eq!(node.messenger.sent.len(), sent_after_first);
        assert_eq!(node.server_stats().total_acked, 1);
    }

    #[test]
    fn test_ack_of_unknown_job_is_an_error() {
        let mut node = cluster(&[]);
        let id = job_id(b'f');
        assert_eq!(node.ack(0, &id), Err(CoreError::UnknownJob(id)));
    }

    #[test]
    fn test_single_node_ack_deletes_immediately() {
        let mut node = cluster(&[]);
        let id = node
            .create(0, 60, 5, 1, Bytes::from_static(b"x"))
            .unwrap();
        assert!(node.deliver(1).is_some());

        // Empty exhaustive list: the round is complete the moment it opens.
        assert_eq!(node.ack(2, &id), Ok(AckOutcome::Acked));
        assert!(node.job(&id).is_none());
        assert!(node.messenger.sent.is_empty());
        assert_eq!(node.server_stats().gc_rounds_completed, 1);
    }

    #[test]
    fn test_bare_setack_selects_quorum_gc() {
        let mut node = cluster(&[b'b', b'c', b'd', b'e']);
        let id = job_id(b'f');

        // An acknowledgement for a job we never held, with no node list.
        node.on_setack(50, &node_id(b'b'), &id, None);

        // A tombstone now exists, acked, and is never delivered.
        let job = node.job(&id).unwrap();
        assert_eq!(job.state, JobState::Acked);
        assert!(job.body.is_empty());
        assert!(node.deliver(51).is_none());

        // Fallback was selected, never the optimised path.
        assert_eq!(node.server_stats().gc_rounds_fallback, 1);
        assert_eq!(node.server_stats().gc_rounds_optimised, 0);

        // The acknowledgement was broadcast cluster-wide, without a list,
        // and the sender got its confirmation.
        assert_eq!(
            setacks_to(&node),
            vec![node_id(b'b'), node_id(b'c'), node_id(b'd'), node_id(b'e')]
        );
        assert!(node.messenger.sent.iter().all(|s| match s {
            Sent::SetAck { nodes, .. } => nodes.is_none(),
            _ => true,
        }));
        assert!(node
            .messenger
            .sent
            .iter()
            .any(|s| *s == Sent::GotAck { to: node_id(b'b'), id }));

        // Majority is 3 of 5 including ourselves: the SETACK sender counts
        // as one confirmation, so one more GOTACK tips it.
        assert!(node.job(&id).is_some());
        node.on_gotack(52, &node_id(b'c'), &id);
        assert!(node.job(&id).is_none());
    }

    #[test]
    fn test_setack_with_list_runs_optimised_gc_on_tombstone() {
        let mut node = cluster(&[b'b', b'c']);
        let id = job_id(b'f');

        // The notice carries the holder list (including us, which we drop).
        node.on_setack(
            50,
            &node_id(b'b'),
            &id,
            Some(vec![node_id(b'0'), node_id(b'b'), node_id(b'c')]),
        );

        assert_eq!(node.server_stats().gc_rounds_optimised, 1);
        // The sender is already confirmed by its own SETACK; only c remains.
        let job = node.job(&id).unwrap();
        assert!(!job.nodes.contains(&node_id(b'b')));
        assert!(job.nodes.contains(&node_id(b'c')));

        node.on_gotack(51, &node_id(b'c'), &id);
        assert!(node.job(&id).is_none());
    }

    #[test]
    fn test_repljob_restamps_times_and_rebases_list() {
        let mut node = cluster(&[b'b', b'c']);
        let id = job_id(b'a');

        // Sent from b's clock: created at 5000, 30 seconds of life left,
        // listing us and c as possible holders.
        let rec = foreign_record(id, 5000, 5030, 5, &[b'0', b'c']);
        node.on_repljob(100, &node_id(b'b'), &rec).unwrap();

        // A replica starts active, never queued here.
        assert!(node.deliver(101).is_none());

        let job = node.job(&id).unwrap();
        assert_eq!(job.state, JobState::Active);
        // Re-anchored to our clock: remaining lifetime preserved.
        assert_eq!(job.ctime, 100);
        assert_eq!(job.etime, 130);
        // We dropped ourselves and recorded the sender.
        assert!(!job.nodes.contains(&node_id(b'0')));
        assert!(job.nodes.contains(&node_id(b'b')));
        assert!(job.nodes.contains(&node_id(b'c')));
    }

    #[test]
    fn test_duplicate_repljob_merges_lists() {
        let mut node = cluster(&[b'b', b'c', b'd']);
        let id = job_id(b'a');

        let rec = foreign_record(id, 0, 60, 5, &[b'0']);
        node.on_repljob(10, &node_id(b'b'), &rec).unwrap();
        assert_eq!(node.job(&id).unwrap().numnodes(), 1);

        // Retransmitted with a longer list: union, no duplicates.
        let rec = foreign_record(id, 0, 60, 5, &[b'0', b'c', b'd']);
        node.on_repljob(11, &node_id(b'b'), &rec).unwrap();
        let job = node.job(&id).unwrap();
        assert_eq!(job.numnodes(), 3);
        assert_eq!(job.state, JobState::Active);
    }

    #[test]
    fn test_tombstone_swallows_stale_replication() {
        let mut node = cluster(&[b'b', b'c']);
        let id = job_id(b'a');

        node.on_setack(50, &node_id(b'b'), &id, None);
        assert_eq!(node.job(&id).unwrap().state, JobState::Acked);

        // The original copy finally arrives, too late to matter.
        let rec = foreign_record(id, 0, 60, 5, &[b'0']);
        node.on_repljob(60, &node_id(b'c'), &rec).unwrap();

        assert_eq!(node.job(&id).unwrap().state, JobState::Acked);
        assert!(node.deliver(61).is_none());
    }

    #[test]
    fn test_requeue_after_rtime_elapses() {
        let mut node = cluster(&[]);
        let id = node
            .create(1000, 3600, 5, 1, Bytes::from_static(b"x"))
            .unwrap();

        let (delivered, _) = node.deliver(1000).unwrap();
        assert_eq!(delivered, id);
        assert_eq!(node.job(&id).unwrap().state, JobState::WaitAck);

        // One second short of the interval: still leased.
        node.tick(1004);
        assert_eq!(node.job(&id).unwrap().state, JobState::WaitAck);

        // The interval passes without an ack: back in the queue, with a
        // refreshed qtime.
        node.tick(1005);
        let job = node.job(&id).unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.qtime, 1005);
        assert_eq!(node.server_stats().total_requeued, 1);

        // And it can be delivered again.
        assert_eq!(node.deliver(1006).unwrap().0, id);
    }

    #[test]
    fn test_replica_failover_requeue() {
        let mut node = cluster(&[b'b']);
        let id = job_id(b'a');

        let rec = foreign_record(id, 0, 600, 5, &[b'0']);
        node.on_repljob(100, &node_id(b'b'), &rec).unwrap();
        assert!(node.deliver(100).is_none());

        node.tick(104);
        assert!(node.deliver(104).is_none());

        // The origin went quiet past the requeue interval: this copy steps
        // in and offers the job itself.
        node.tick(105);
        assert_eq!(node.deliver(105).unwrap().0, id);
    }

    #[test]
    fn test_expiry_dominates_unfinished_gc() {
        let mut node = cluster(&[b'b']);
        let id = node
            .create(0, 100, 10, 2, Bytes::from_static(b"x"))
            .unwrap();
        assert!(node.deliver(1).is_some());
        assert_eq!(node.ack(1, &id), Ok(AckOutcome::Acked));

        // The peer never confirms; retries fire with backoff.
        node.messenger.sent.clear();
        node.tick(5);
        assert_eq!(setacks_to(&node), vec![node_id(b'b')]);
        assert_eq!(node.server_stats().gc_retries, 1);

        // At expiry the job is deleted even though GC never completed.
        node.tick(100);
        assert!(node.job(&id).is_none());
        assert_eq!(node.server_stats().total_expired, 1);
        assert_eq!(node.server_stats().gc_rounds_completed, 0);

        // Deletion cancelled the round: later ticks send nothing more.
        node.messenger.sent.clear();
        node.tick(200);
        assert!(node.messenger.sent.is_empty());
    }

    #[test]
    fn test_gc_retry_backoff() {
        let mut node = cluster(&[b'b']);
        let id = node
            .create(0, 3600, 10, 2, Bytes::from_static(b"x"))
            .unwrap();
        assert!(node.deliver(0).is_some());
        node.ack(0, &id).unwrap();
        node.messenger.sent.clear();

        // First retry after the minimum delay...
        node.tick(1);
        assert!(setacks_to(&node).is_empty());
        node.tick(2);
        assert_eq!(setacks_to(&node).len(), 1);

        // ...then the gap doubles.
        node.tick(5);
        assert_eq!(setacks_to(&node).len(), 1);
        node.tick(6);
        assert_eq!(setacks_to(&node).len(), 2);
    }

    #[test]
    fn test_evicted_peer_counts_as_confirmed() {
        let mut node = cluster(&[b'b']);
        let id = job_id(b'a');

        // The record lists a node that was since removed from the cluster.
        let rec = foreign_record(id, 0, 600, 5, &[b'0', b'9']);
        node.on_repljob(10, &node_id(b'b'), &rec).unwrap();

        // Acknowledged straight from the active state.
        assert_eq!(node.ack(11, &id), Ok(AckOutcome::Acked));

        // Only the live member is asked to confirm; the evicted one was
        // cleared implicitly.
        assert_eq!(setacks_to(&node), vec![node_id(b'b')]);

        node.on_gotack(12, &node_id(b'b'), &id);
        assert!(node.job(&id).is_none());
    }

    #[test]
    fn test_quorum_proceeds_when_all_reachable_confirmed() {
        let mut node = cluster(&[b'b', b'c', b'd', b'e']);
        node.membership_mut().mark_unreachable(&node_id(b'c'));
        node.membership_mut().mark_unreachable(&node_id(b'd'));
        node.membership_mut().mark_unreachable(&node_id(b'e'));

        let id = job_id(b'f');
        node.on_setack(50, &node_id(b'b'), &id, None);

        // Majority (3 of 5) was never reached, but every reachable node
        // has confirmed, which is as good as it gets: proceed.
        assert!(node.job(&id).is_none());
    }

    #[test]
    fn test_expired_job_not_delivered() {
        let mut node = cluster(&[]);
        let id = node
            .create(0, 10, 0, 1, Bytes::from_static(b"x"))
            .unwrap();

        assert!(node.deliver(20).is_none());
        assert!(node.job(&id).is_none());
        assert_eq!(node.server_stats().total_expired, 1);
    }

    #[test]
    fn test_expiry_scan_deletes_in_any_state() {
        let mut node = cluster(&[]);
        let waiting = node
            .create(0, 10, 0, 1, Bytes::from_static(b"a"))
            .unwrap();
        let queued = node
            .create(0, 10, 0, 1, Bytes::from_static(b"b"))
            .unwrap();
        // FIFO: the first job is the one delivered and left awaiting ack.
        assert_eq!(node.deliver(1).unwrap().0, waiting);

        node.tick(10);
        assert!(node.job(&queued).is_none());
        assert!(node.job(&waiting).is_none());
        assert_eq!(node.server_stats().total_expired, 2);
    }

    #[test]
    fn test_job_stats() {
        let mut node = cluster(&[b'b']);
        let id = node
            .create(100, 60, 5, 2, Bytes::from_static(b"hello"))
            .unwrap();
        assert!(node.deliver(110).is_some());

        let stats = node.job_stats(120, &id).unwrap();
        assert_eq!(stats.state, JobState::WaitAck);
        assert_eq!(stats.age, 20);
        assert_eq!(stats.ttl_left, 40);
        assert_eq!(stats.retry, 5);
        assert_eq!(stats.repl, 2);
        assert_eq!(stats.numnodes, 1);
        assert_eq!(stats.body_size, 5);
        assert_eq!(stats.deliveries, 1);

        assert!(node.job_stats(120, &job_id(b'f')).is_none());
    }
}
