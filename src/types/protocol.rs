use bytes::Bytes;
use serde::Serialize;

use super::id::{JobId, NodeId};
use super::serialisable::WireSerialisable;
use super::states::JobState;

/// A command sent by a client to the node it is connected to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Creates a job and replicates it. The command line is followed by
    /// `n_bytes` of opaque body data and a trailing CRLF.
    ///
    /// On the wire: `add <ttl> <retry> <repl> <n_bytes>`
    Add {
        /// Seconds until the job expires, in any state.
        ttl: u32,
        /// Requeue interval: seconds a delivered job waits for its
        /// acknowledgement before returning to the queue. 0 disables it.
        retry: u32,
        /// Desired number of durable copies, counting this node's.
        repl: u16,
        n_bytes: u64,
    },
    /// Takes the next queued job, if any. Non-blocking.
    ///
    /// On the wire: `get`
    Get,
    /// Acknowledges a delivered job, beginning its garbage collection.
    ///
    /// On the wire: `ack <id>`
    Ack { id: JobId },
    /// Reports a job's state, timings, and replication metadata.
    ///
    /// On the wire: `show <id>`
    Show { id: JobId },
    /// Reports node-wide counters.
    ///
    /// On the wire: `stats`
    Stats,
    /// Requests that the server close this connection.
    ///
    /// On the wire: `quit`
    Quit,
}

/// All possible responses to a [`Command`].
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// The client sent a line that doesn't parse: a malformed number, a bad
    /// job ID, or trailing garbage.
    ///
    /// On the wire: `BAD_FORMAT`.
    BadFormat,
    /// The client sent an unrecognised command.
    ///
    /// On the wire: `UNKNOWN_COMMAND`.
    UnknownCommand,
    /// In response to an `add`, the body data wasn't terminated by CRLF.
    ///
    /// On the wire: `EXPECTED_CRLF`.
    ExpectedCrlf,
    /// In response to an `add`, the body exceeded the configured maximum.
    ///
    /// On the wire: `JOB_TOO_BIG`.
    JobTooBig,
    /// In response to an `add`, the job was created with the given ID.
    ///
    /// On the wire: `INSERTED <id>`.
    Inserted { id: JobId },
    /// In response to a `get`, a job was delivered to this client.
    ///
    /// On the wire: `RESERVED <id> <n_bytes>` plus data.
    Reserved { id: JobId, body: Bytes },
    /// In response to a `get`, no job is currently queued.
    ///
    /// On the wire: `EMPTY`.
    Empty,
    /// In response to an `ack`, the acknowledgement was recorded (or had
    /// already been recorded; duplicate acknowledgements are no-ops).
    ///
    /// On the wire: `ACKED`.
    Acked,
    /// In response to an `ack` or `show` naming a job this node doesn't
    /// hold: never created here, already expired, or already collected.
    ///
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// In response to a `show`, indicates success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkShow { data: JobStats },
    /// In response to a `stats`, indicates success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStats { data: ServerStats },
}

impl WireSerialisable for Response {
    fn serialise_wire(&self) -> Vec<u8> {
        use Response::*;

        match self {
            BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
            ExpectedCrlf => b"EXPECTED_CRLF\r\n".to_vec(),
            JobTooBig => b"JOB_TOO_BIG\r\n".to_vec(),
            Inserted { id } => format!("INSERTED {id}\r\n").into(),
            Reserved { id, body } => [
                format!("RESERVED {id} {}\r\n", body.len()).into_bytes(),
                body.to_vec(),
                b"\r\n".to_vec(),
            ]
            .concat(),
            Empty => b"EMPTY\r\n".to_vec(),
            Acked => b"ACKED\r\n".to_vec(),
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            OkShow { data } => {
                let data = serde_yaml::to_string(data).unwrap();
                format!("OK {}\r\n{data}\r\n", data.len()).into()
            },
            OkStats { data } => {
                let data = serde_yaml::to_string(data).unwrap();
                format!("OK {}\r\n{data}\r\n", data.len()).into()
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobStats {
    /// job ID
    pub id: JobId,
    /// job state
    pub state: JobState,
    /// time in seconds since this node first saw the job
    pub age: u32,
    /// seconds remaining until forced expiry
    #[serde(rename = "ttl-left")]
    pub ttl_left: u32,
    /// requeue interval in seconds
    pub retry: u32,
    /// target replication factor
    pub repl: u16,
    /// number of peers that may hold a copy
    pub numnodes: u16,
    /// body length in bytes
    #[serde(rename = "body-size")]
    pub body_size: u64,
    /// number of times this node delivered the job
    pub deliveries: u64,
    /// number of times the job timed out and was requeued
    pub requeues: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServerStats {
    /// this node's cluster identity
    #[serde(rename = "node-id")]
    pub node_id: NodeId,
    /// number of nodes in the cluster, including this one
    #[serde(rename = "cluster-size")]
    pub cluster_size: u64,

    /// number of replica copies never queued locally
    #[serde(rename = "current-jobs-active")]
    pub current_jobs_active: u64,
    /// number of jobs in the local active queue
    #[serde(rename = "current-jobs-queued")]
    pub current_jobs_queued: u64,
    /// number of delivered jobs awaiting acknowledgement
    #[serde(rename = "current-jobs-waitack")]
    pub current_jobs_waitack: u64,
    /// number of acked jobs awaiting garbage collection
    #[serde(rename = "current-jobs-acked")]
    pub current_jobs_acked: u64,

    /// cumulative count of jobs created on this node
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    /// cumulative count of deliveries to consumers
    #[serde(rename = "total-deliveries")]
    pub total_deliveries: u64,
    /// cumulative count of acknowledgements recorded
    #[serde(rename = "total-acked")]
    pub total_acked: u64,
    /// cumulative count of jobs deleted by expiry
    #[serde(rename = "total-expired")]
    pub total_expired: u64,
    /// cumulative count of timeout requeues
    #[serde(rename = "total-requeued")]
    pub total_requeued: u64,

    /// GC rounds begun on the optimised, list-based path
    #[serde(rename = "gc-rounds-optimised")]
    pub gc_rounds_optimised: u64,
    /// GC rounds begun on the fallback, quorum path
    #[serde(rename = "gc-rounds-fallback")]
    pub gc_rounds_fallback: u64,
    /// GC rounds that confirmed fully and deleted their job
    #[serde(rename = "gc-rounds-completed")]
    pub gc_rounds_completed: u64,
    /// SETACK re-sends to unresponsive peers
    #[serde(rename = "gc-retries")]
    pub gc_retries: u64,

    /// maximum accepted job body size in bytes
    #[serde(rename = "max-body-size")]
    pub max_body_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::id::JOB_ID_LEN;

    #[test]
    fn test_serialise_responses() {
        let id =
            JobId::try_from(&[b'a'; JOB_ID_LEN][..]).unwrap();

        assert_eq!(
            Response::Inserted { id }.serialise_wire(),
            format!("INSERTED {id}\r\n").into_bytes()
        );
        assert_eq!(
            Response::Reserved {
                id,
                body: Bytes::from_static(b"abc"),
            }
            .serialise_wire(),
            format!("RESERVED {id} 3\r\nabc\r\n").into_bytes()
        );
        assert_eq!(Response::Empty.serialise_wire(), b"EMPTY\r\n");
    }
}
