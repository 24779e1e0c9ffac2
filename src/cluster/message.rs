//! Codec for the three inter-node messages. Each frame starts with a type
//! byte and the sender's node ID; REPLJOB then carries an encoded job record
//! (see [`crate::types::record`]), SETACK a job ID and an optional node-copy
//! list, GOTACK a bare job ID.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CoreError;
use crate::types::id::{JobId, NodeId, JOB_ID_LEN, NODE_ID_LEN};

const TYPE_REPLJOB: u8 = 1;
const TYPE_SETACK: u8 = 2;
const TYPE_GOTACK: u8 = 3;

#[derive(Clone, Debug, PartialEq)]
pub enum ClusterMessage {
    /// A copy of a job, pushed for durability.
    ReplJob { from: NodeId, record: Bytes },
    /// "This job is acknowledged; confirm, and propagate if you can."
    SetAck {
        from: NodeId,
        id: JobId,
        nodes: Option<Vec<NodeId>>,
    },
    /// "Acknowledgement recorded here; you can forget about me."
    GotAck { from: NodeId, id: JobId },
}

impl ClusterMessage {
    pub fn sender(&self) -> &NodeId {
        match self {
            ClusterMessage::ReplJob { from, .. } => from,
            ClusterMessage::SetAck { from, .. } => from,
            ClusterMessage::GotAck { from, .. } => from,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            ClusterMessage::ReplJob { from, record } => {
                buf.put_u8(TYPE_REPLJOB);
                buf.put_slice(from.as_bytes());
                buf.put_slice(record);
            },
            ClusterMessage::SetAck { from, id, nodes } => {
                buf.put_u8(TYPE_SETACK);
                buf.put_slice(from.as_bytes());
                buf.put_slice(id.as_bytes());
                match nodes {
                    Some(nodes) => {
                        buf.put_u8(1);
                        buf.put_u16(nodes.len() as u16);
                        for node in nodes {
                            buf.put_slice(node.as_bytes());
                        }
                    },
                    None => buf.put_u8(0),
                }
            },
            ClusterMessage::GotAck { from, id } => {
                buf.put_u8(TYPE_GOTACK);
                buf.put_slice(from.as_bytes());
                buf.put_slice(id.as_bytes());
            },
        }

        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() < 1 + NODE_ID_LEN {
            return Err(CoreError::MalformedRecord("truncated frame"));
        }

        let mut buf = data;
        let msg_type = buf.get_u8();

        let from: NodeId = buf[..NODE_ID_LEN]
            .try_into()
            .map_err(|_| CoreError::MalformedRecord("bad sender ID"))?;
        buf.advance(NODE_ID_LEN);

        match msg_type {
            TYPE_REPLJOB => Ok(ClusterMessage::ReplJob {
                from,
                record: Bytes::copy_from_slice(buf),
            }),
            TYPE_SETACK => {
                let id = take_id(&mut buf)?;

                if buf.remaining() < 1 {
                    return Err(CoreError::MalformedRecord("truncated frame"));
                }
                let nodes = match buf.get_u8() {
                    0 => None,
                    1 => {
                        if buf.remaining() < 2 {
                            return Err(CoreError::MalformedRecord(
                                "truncated frame",
                            ));
                        }
                        let count = buf.get_u16() as usize;
                        if buf.remaining() != count * NODE_ID_LEN {
                            return Err(CoreError::MalformedRecord(
                                "node list length mismatch",
                            ));
                        }
                        let mut nodes = Vec::with_capacity(count);
                        for _ in 0..count {
                            let node: NodeId =
                                buf[..NODE_ID_LEN].try_into().map_err(
                                    |_| {
                                        CoreError::MalformedRecord(
                                            "bad node ID",
                                        )
                                    },
                                )?;
                            buf.advance(NODE_ID_LEN);
                            nodes.push(node);
                        }
                        Some(nodes)
                    },
                    _ => {
                        return Err(CoreError::MalformedRecord(
                            "bad node list flag",
                        ))
                    },
                };

                if !buf.is_empty() {
                    return Err(CoreError::MalformedRecord("trailing bytes"));
                }

                Ok(ClusterMessage::SetAck { from, id, nodes })
            },
            TYPE_GOTACK => {
                let id = take_id(&mut buf)?;
                if !buf.is_empty() {
                    return Err(CoreError::MalformedRecord("trailing bytes"));
                }
                Ok(ClusterMessage::GotAck { from, id })
            },
            _ => Err(CoreError::MalformedRecord("unknown message type")),
        }
    }
}

fn take_id(buf: &mut &[u8]) -> Result<JobId, CoreError> {
    if buf.remaining() < JOB_ID_LEN {
        return Err(CoreError::MalformedRecord("truncated frame"));
    }
    let id: JobId = buf[..JOB_ID_LEN]
        .try_into()
        .map_err(|_| CoreError::MalformedRecord("bad job ID"))?;
    buf.advance(JOB_ID_LEN);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_id(c: u8) -> JobId {
        JobId::try_from(&[c; JOB_ID_LEN][..]).unwrap()
    }

    fn node(c: u8) -> NodeId {
        NodeId::try_from(&[c; NODE_ID_LEN][..]).unwrap()
    }

    #[track_caller]
    fn assert_round_trips(msg: ClusterMessage) {
        let encoded = msg.encode();
        assert_eq!(ClusterMessage::decode(&encoded), Ok(msg));
    }

    #[test]
    fn test_round_trips() {
        assert_round_trips(ClusterMessage::ReplJob {
            from: node(b'a'),
            record: Bytes::from_static(b"opaque record bytes"),
        });
        assert_round_trips(ClusterMessage::SetAck {
            from: node(b'a'),
            id: job_id(b'1'),
            nodes: None,
        });
        assert_round_trips(ClusterMessage::SetAck {
            from: node(b'a'),
            id: job_id(b'1'),
            nodes: Some(vec![node(b'b'), node(b'c')]),
        });
        assert_round_trips(ClusterMessage::SetAck {
            from: node(b'a'),
            id: job_id(b'1'),
            nodes: Some(Vec::new()),
        });
        assert_round_trips(ClusterMessage::GotAck {
            from: node(b'b'),
            id: job_id(b'2'),
        });
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(ClusterMessage::decode(&[]).is_err());
        assert!(ClusterMessage::decode(&[TYPE_GOTACK]).is_err());

        // Unknown type byte.
        let mut bad =
            ClusterMessage::GotAck {
                from: node(b'a'),
                id: job_id(b'1'),
            }
            .encode()
            .to_vec();
        bad[0] = 99;
        assert_eq!(
            ClusterMessage::decode(&bad),
            Err(CoreError::MalformedRecord("unknown message type"))
        );

        // A SETACK whose node count disagrees with its length.
        let mut bad = ClusterMessage::SetAck {
            from: node(b'a'),
            id: job_id(b'1'),
            nodes: Some(vec![node(b'b')]),
        }
        .encode()
        .to_vec();
        let count_at = 1 + NODE_ID_LEN + JOB_ID_LEN + 1;
        bad[count_at + 1] = 2; // low byte of the u16 count
        assert_eq!(
            ClusterMessage::decode(&bad),
            Err(CoreError::MalformedRecord("node list length mismatch"))
        );

        // GOTACK with trailing bytes.
        let mut bad = ClusterMessage::GotAck {
            from: node(b'a'),
            id: job_id(b'1'),
        }
        .encode()
        .to_vec();
        bad.push(0);
        assert_eq!(
            ClusterMessage::decode(&bad),
            Err(CoreError::MalformedRecord("trailing bytes"))
        );
    }
}
