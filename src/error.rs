use thiserror::Error;

use crate::types::id::JobId;

/// Errors raised at the validation boundaries of the queue core.
///
/// These never escape into the state machine: a record or command that fails
/// validation is rejected at the message boundary, and the job table only
/// ever sees well-formed values. Duplicate acknowledgements and expired jobs
/// are deliberately not errors (the first is an idempotent no-op, the second
/// triggers deletion) and so have no variant here.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CoreError {
    #[error("malformed record: {0}")]
    MalformedRecord(&'static str),

    #[error("invalid job ID: expected 40 hexadecimal characters")]
    InvalidJobId,

    #[error("invalid node ID: expected 40 hexadecimal characters")]
    InvalidNodeId,

    #[error("job body of {size} bytes exceeds the configured limit of {max}")]
    BodyTooLarge { size: u64, max: u64 },

    #[error("unknown job: {0}")]
    UnknownJob(JobId),
}

pub type Result<T> = std::result::Result<T, CoreError>;
