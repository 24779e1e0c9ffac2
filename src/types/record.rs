//! The flat byte encoding of a job record, used whenever a record travels
//! between nodes (REPLJOB) or to disk.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! state:u32 | id:40 | ctime:u32 | etime:u32 | qtime:u32 | rtime:u32
//!   | repl:u16 | numnodes:u16 | bodylen:u64
//!   | node_ids[numnodes * 40] | body[bodylen]
//! ```
//!
//! Lengths are trusted from untrusted input only here, and validated against
//! the supplied buffer before any allocation.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CoreError;
use crate::types::id::{JobId, NodeId, JOB_ID_LEN, NODE_ID_LEN};
use crate::types::job::Job;
use crate::types::nodes::NodeList;
use crate::types::states::JobState;

/// Size of the fixed header preceding the node list and body.
pub const RECORD_HEADER_LEN: usize = 4 + JOB_ID_LEN + 4 * 4 + 2 + 2 + 8;

/// Serialises a record. Total and deterministic: any job round-trips
/// byte-for-byte through encode then decode.
pub fn encode(job: &Job) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        RECORD_HEADER_LEN
            + job.nodes.len() * NODE_ID_LEN
            + job.body.len(),
    );

    buf.put_u32(job.state.to_wire());
    buf.put_slice(job.id.as_bytes());
    buf.put_u32(job.ctime);
    buf.put_u32(job.etime);
    buf.put_u32(job.qtime);
    buf.put_u32(job.rtime);
    buf.put_u16(job.repl);
    buf.put_u16(job.numnodes());
    buf.put_u64(job.body.len() as u64);

    for node in job.nodes.iter() {
        buf.put_slice(node.as_bytes());
    }
    buf.put_slice(&job.body);

    buf.freeze()
}

/// Parses a record from an exact buffer. The node list arrives with the
/// record and so is taken as exhaustive; re-stamping the times to the local
/// clock is the receiver's job, not the codec's.
pub fn decode(data: &[u8]) -> Result<Job, CoreError> {
    if data.len() < RECORD_HEADER_LEN {
        return Err(CoreError::MalformedRecord("truncated header"));
    }

    let mut buf = data;

    let state = JobState::from_wire(buf.get_u32())
        .ok_or(CoreError::MalformedRecord("unknown state"))?;

    let id: JobId = buf[..JOB_ID_LEN]
        .try_into()
        .map_err(|_| CoreError::MalformedRecord("bad job ID"))?;
    buf.advance(JOB_ID_LEN);

    let ctime = buf.get_u32();
    let etime = buf.get_u32();
    let qtime = buf.get_u32();
    let rtime = buf.get_u32();
    let repl = buf.get_u16();
    let numnodes = buf.get_u16();
    let bodylen = buf.get_u64();

    // The declared lengths must match the buffer exactly; both an undershoot
    // and trailing bytes reject the record.
    let expected = (numnodes as u64)
        .checked_mul(NODE_ID_LEN as u64)
        .and_then(|n| n.checked_add(bodylen))
        .and_then(|n| n.checked_add(RECORD_HEADER_LEN as u64))
        .ok_or(CoreError::MalformedRecord("length overflow"))?;
    if expected != data.len() as u64 {
        return Err(CoreError::MalformedRecord("length mismatch"));
    }

    let mut nodes = Vec::with_capacity(numnodes as usize);
    for _ in 0..numnodes {
        let node: NodeId = buf[..NODE_ID_LEN]
            .try_into()
            .map_err(|_| CoreError::MalformedRecord("bad node ID"))?;
        buf.advance(NODE_ID_LEN);
        nodes.push(node);
    }

    let body = Bytes::copy_from_slice(&buf[..bodylen as usize]);

    Ok(Job {
        id,
        state,
        ctime,
        etime,
        qtime,
        rtime,
        repl,
        nodes: NodeList::inherited(nodes),
        body,
        gc: None,
        deliveries: 0,
        requeues: 0,
    })
}
