use serde::Serialize;

/// Lifecycle states of a job copy held by this node.
///
/// Transitions are monotone except for the Queued/WaitAck cycle: a delivered
/// job whose requeue interval passes without acknowledgement returns to
/// Queued. Acked is terminal; the only exit from it is deletion of the
/// record, which isn't a stored state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Not acked, and this node never queued it (a replica copy).
    Active,
    /// Not acked, sitting in the local active queue.
    Queued,
    /// Not acked; delivered to a consumer, awaiting its acknowledgement.
    WaitAck,
    /// Acked and inert; held only until garbage collection completes.
    Acked,
}

impl JobState {
    /// The integer encoding used in the record wire format.
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            JobState::Active => 0,
            JobState::Queued => 1,
            JobState::WaitAck => 2,
            JobState::Acked => 3,
        }
    }

    pub(crate) fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(JobState::Active),
            1 => Some(JobState::Queued),
            2 => Some(JobState::WaitAck),
            3 => Some(JobState::Acked),
            _ => None,
        }
    }
}

// This impl is used to allow JobStats to be serialised to YAML.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use JobState::*;

        serializer.serialize_str(match self {
            Active => "active",
            Queued => "queued",
            WaitAck => "waitack",
            Acked => "acked",
        })
    }
}
