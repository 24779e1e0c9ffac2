use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use uuid::Uuid;

use crate::error::CoreError;

/// Length of a job ID: 40 hex characters, i.e. 20 bytes / 160 bits.
pub const JOB_ID_LEN: usize = 40;
/// Length of a cluster node ID, same shape as a job ID.
pub const NODE_ID_LEN: usize = 40;

/// Number of leading job-ID characters taken from the creating node's ID.
const ID_NODE_PREFIX_LEN: usize = 16;

// Checks a byte slice is exactly `N` hex characters, normalising to
// lowercase. Uppercase input is accepted; anything else is rejected.
fn parse_hex<const N: usize>(value: &[u8]) -> Option<[u8; N]> {
    if value.len() != N {
        return None;
    }

    let mut out = [0u8; N];
    for (i, c) in value.iter().enumerate() {
        out[i] = match c {
            b'0'..=b'9' | b'a'..=b'f' => *c,
            b'A'..=b'F' => *c + (b'a' - b'A'),
            _ => return None,
        };
    }

    Some(out)
}

/// The unique identifier of a job, both in the client protocol and in the
/// cluster messages between nodes.
///
/// Stored as its canonical representation: 40 lowercase hex characters
/// encoding 160 bits. IDs are generated without coordination by combining
/// the creating node's identity, that node's clock, and a per-node counter
/// (see [`JobIdGenerator`]), and never change for the lifetime of a job.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId([u8; JOB_ID_LEN]);

impl JobId {
    pub fn as_bytes(&self) -> &[u8; JOB_ID_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Validated ASCII on every construction path.
        std::str::from_utf8(&self.0).unwrap()
    }
}

impl TryFrom<&[u8]> for JobId {
    type Error = CoreError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        parse_hex(value).map(JobId).ok_or(CoreError::InvalidJobId)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "JobId({})", self.as_str())
    }
}

impl Serialize for JobId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// The identity of a cluster node: 40 lowercase hex characters, fixed for
/// the lifetime of the node process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap()
    }

    /// Mints a fresh node identity for a process the operator didn't assign
    /// one to: 128 random bits plus the low 32 bits of the wall clock.
    pub fn generate() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let id = format!("{}{now:08x}", Uuid::new_v4().simple());

        let mut out = [0u8; NODE_ID_LEN];
        out.copy_from_slice(id.as_bytes());
        NodeId(out)
    }
}

impl TryFrom<&[u8]> for NodeId {
    type Error = CoreError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        parse_hex(value).map(NodeId).ok_or(CoreError::InvalidNodeId)
    }
}

impl FromStr for NodeId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.as_bytes().try_into()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NodeId({})", self.as_str())
    }
}

impl Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Mints job IDs on behalf of one node.
///
/// The layout is 16 hex characters of the owning node's ID, 8 hex characters
/// of local unix time, and 16 hex characters of a monotonic counter. The
/// counter makes IDs unique within a node even when the clock stalls or steps
/// backwards; the node prefix makes them unique across the cluster without
/// coordination.
#[derive(Debug)]
pub struct JobIdGenerator {
    prefix: [u8; ID_NODE_PREFIX_LEN],
    counter: u64,
}

impl JobIdGenerator {
    pub fn new(node: &NodeId) -> Self {
        let mut prefix = [0u8; ID_NODE_PREFIX_LEN];
        prefix.copy_from_slice(&node.as_bytes()[..ID_NODE_PREFIX_LEN]);
        Self { prefix, counter: 0 }
    }

    pub fn next(&mut self, now: u32) -> JobId {
        let counter = self.counter;
        self.counter = self.counter.wrapping_add(1);

        let mut out = [0u8; JOB_ID_LEN];
        out[..ID_NODE_PREFIX_LEN].copy_from_slice(&self.prefix);

        let tail = format!("{now:08x}{counter:016x}");
        out[ID_NODE_PREFIX_LEN..].copy_from_slice(tail.as_bytes());

        JobId(out)
    }
}
