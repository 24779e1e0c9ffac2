use std::collections::{HashMap, VecDeque};

use crate::types::id::JobId;
use crate::types::job::Job;
use crate::types::states::JobState;

/// The one place a node keeps its job records: a table keyed by ID plus a
/// FIFO of queued job IDs. Owned by the control task; nothing else holds a
/// reference into it, so records need no locking.
///
/// The queue holds IDs, not records, and tolerates stale entries: an ID
/// whose job was acked, expired, or collected since it was pushed is simply
/// skipped at pop time.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<JobId, Job>,
    queue: VecDeque<JobId>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn remove(&mut self, id: &JobId) -> Option<Job> {
        self.jobs.remove(id)
    }

    /// Moves a job into the queued state and makes it eligible for delivery.
    /// A job already queued is left where it is in the FIFO.
    pub fn enqueue(&mut self, id: &JobId, now: u32) {
        if let Some(job) = self.jobs.get_mut(id) {
            if job.state == JobState::Queued {
                return;
            }
            job.state = JobState::Queued;
            job.qtime = now;
            self.queue.push_back(*id);
        }
    }

    /// Pops the next queued job, skipping stale queue entries. The returned
    /// job is still in the queued state; the caller decides what delivery
    /// means (and what to do about expiry).
    pub fn pop_queued(&mut self) -> Option<&mut Job> {
        while let Some(id) = self.queue.pop_front() {
            // A stale entry: the job moved on (or was deleted) after being
            // queued.
            let still_queued = matches!(
                self.jobs.get(&id),
                Some(job) if job.state == JobState::Queued
            );
            if still_queued {
                return self.jobs.get_mut(&id);
            }
        }
        None
    }

    /// All job IDs, collected for scan loops that mutate the table as they
    /// go.
    pub fn ids(&self) -> Vec<JobId> {
        self.jobs.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
