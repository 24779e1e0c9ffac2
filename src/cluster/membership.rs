use std::collections::HashSet;

use crate::cluster::Membership;
use crate::types::id::NodeId;

/// A membership view fixed at process start: the operator names the peers,
/// and only reachability varies at runtime (fed by the transport layer as
/// connections fail and recover).
#[derive(Debug)]
pub struct StaticMembership {
    me: NodeId,
    peers: Vec<NodeId>,
    unreachable: HashSet<NodeId>,
}

impl StaticMembership {
    pub fn new(me: NodeId, peers: Vec<NodeId>) -> Self {
        let peers = peers.into_iter().filter(|p| *p != me).collect();
        Self {
            me,
            peers,
            unreachable: HashSet::new(),
        }
    }

    /// A cluster of one: no peers, every job's list-based GC is trivially
    /// complete.
    pub fn single(me: NodeId) -> Self {
        Self::new(me, Vec::new())
    }

    pub fn mark_unreachable(&mut self, node: &NodeId) {
        if self.peers.contains(node) {
            self.unreachable.insert(*node);
        }
    }

    pub fn mark_reachable(&mut self, node: &NodeId) {
        self.unreachable.remove(node);
    }
}

impl Membership for StaticMembership {
    fn self_id(&self) -> &NodeId {
        &self.me
    }

    fn is_member(&self, node: &NodeId) -> bool {
        *node == self.me || self.peers.contains(node)
    }

    fn is_reachable(&self, node: &NodeId) -> bool {
        self.is_member(node) && !self.unreachable.contains(node)
    }

    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    fn peers(&self) -> Vec<NodeId> {
        self.peers.clone()
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
    fn test_membership_queries() {
        let mut m = StaticMembership::new(
            node(b'a'),
            // Our own ID in the peer list is tolerated and dropped.
            vec![node(b'a'), node(b'b'), node(b'c')],
        );

        assert_eq!(m.cluster_size(), 3);
        assert_eq!(m.peers(), vec![node(b'b'), node(b'c')]);
        assert!(m.is_member(&node(b'a')));
        assert!(m.is_member(&node(b'b')));
        assert!(!m.is_member(&node(b'd')));

        assert!(m.is_reachable(&node(b'b')));
        m.mark_unreachable(&node(b'b'));
        assert!(!m.is_reachable(&node(b'b')));
        assert!(m.is_member(&node(b'b')));
        m.mark_reachable(&node(b'b'));
        assert!(m.is_reachable(&node(b'b')));

        // A non-member can't become unreachable-but-listed.
        m.mark_unreachable(&node(b'd'));
        assert!(!m.is_member(&node(b'd')));
    }
}
