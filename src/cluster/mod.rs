//! The seams between the queue core and the rest of the cluster.
//!
//! The core never blocks on the network: it hands fully-formed messages to a
//! [`Messenger`] and treats delivery as fire-and-forget, processing whatever
//! comes back as independent events. Likewise it never decides who is in the
//! cluster; it only queries a [`Membership`] to pick replication targets and
//! GC strategies.

pub mod membership;
pub mod message;

use crate::types::id::{JobId, NodeId};
use crate::types::job::Job;
use crate::types::nodes::NodeList;

/// Delivers cluster messages between nodes. Sends must not block and carry
/// no delivery guarantee; the GC retry loop papers over losses.
pub trait Messenger {
    /// Pushes a copy of `job` to `peer`.
    fn send_repljob(&mut self, peer: &NodeId, job: &Job);

    /// Tells `peer` the job is acknowledged and asks it to confirm.
    /// `nodes`, when present, carries the sender's node-copy list so the
    /// receiver can run list-based GC without ever having held the record.
    fn send_setack(
        &mut self,
        peer: &NodeId,
        id: &JobId,
        nodes: Option<&NodeList>,
    );

    /// Confirms to `peer` that this node has recorded the acknowledgement
    /// and will never deliver the job again.
    fn send_gotack(&mut self, peer: &NodeId, id: &JobId);
}

/// Read-only view of cluster membership and peer reachability.
pub trait Membership {
    fn self_id(&self) -> &NodeId;

    /// Whether `node` is currently part of the cluster at all. A listed GC
    /// peer that stops being a member is treated as implicitly confirmed.
    fn is_member(&self, node: &NodeId) -> bool;

    /// Whether `node` is believed reachable right now. Advisory only; used
    /// to pick replication targets and to decide when a quorum round has
    /// heard from everyone it can.
    fn is_reachable(&self, node: &NodeId) -> bool;

    /// Number of cluster members, including this node.
    fn cluster_size(&self) -> usize;

    /// Every member except this node.
    fn peers(&self) -> Vec<NodeId>;
}
