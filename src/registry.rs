//! Job Registry: tracks every job's metadata and current lifecycle state.
//!
//! Concurrency shape: the top-level map is locked only for the lookup or
//! insert of a single entry; all per-job mutation happens through that
//! entry's own `Mutex`, so two operations on different jobs never contend
//! with each other.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::JobError;
use crate::limits::ResourceLimits;
use crate::logstore::LogStore;

pub type JobId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Process has been spawned and attached to its cgroup; may still be
    /// running.
    Running { pid: i32 },
    /// A Stop request has been accepted; the grace timer is running or the
    /// process has been sent SIGKILL.
    Stopping { pid: i32 },
    /// The process has exited, by itself or because it was stopped.
    Exited { exit_code: i32 },
    /// The job never reached Running: limit parsing or cgroup setup failed
    /// before fork.
    Failed { reason: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Exited { .. } | JobState::Failed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub command: String,
    pub args: Vec<String>,
    pub limits: ResourceLimits,
}

pub struct JobRecord {
    pub job_id: JobId,
    pub spec: JobSpec,
    pub state: JobState,
    pub log: LogStore,
    pub created_at: std::time::SystemTime,
    /// Set by the reaper the moment `state` transitions to `Exited`.
    pub end_time: Option<std::time::SystemTime>,
}

#[derive(Clone)]
pub struct JobRegistry {
    jobs: Arc<DashMap<JobId, Arc<Mutex<JobRecord>>>>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        JobRegistry {
            jobs: Arc::new(DashMap::new()),
        }
    }

    /// Inserts a freshly generated job. A UUID collision with an existing
    /// entry is not a recoverable per-job error: it means the registry's
    /// core invariant (job ids are unique) no longer holds, so this returns
    /// `JobError::Duplicate` for the caller to treat as fatal rather than
    /// silently overwriting the existing record.
    pub fn insert(&self, record: JobRecord) -> Result<Arc<Mutex<JobRecord>>, JobError> {
        let job_id = record.job_id;
        match self.jobs.entry(job_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(JobError::Duplicate(job_id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let handle = Arc::new(Mutex::new(record));
                slot.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    pub fn get(&self, job_id: JobId) -> Option<Arc<Mutex<JobRecord>>> {
        self.jobs.get(&job_id).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<JobId> {
        self.jobs.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
