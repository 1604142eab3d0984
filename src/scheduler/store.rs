//! Job persistence.
//!
//! Armed jobs are written to a `sled` tree so a restarted scheduler worker
//! picks them up again. Each job is stored as JSON under a key derived from
//! its identity: `job:{len}:{name}` or `job:{len}:{name}/{group}` for named
//! jobs, where `len` is the byte length of the name, and `once:{uuid}` for
//! one-shot jobs.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use thiserror::Error;
use tracing::warn;

use crate::scheduler::jobs::JobKey;
use crate::scheduling::{ScheduleMe, ScheduleMeCron, ScheduleMeRepetitive};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job store error: {0}")]
    Sled(#[from] sled::Error),

    #[error("could not encode job: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum StoredJob {
    OneShot { id: String, job: ScheduleMe },
    /// `job.wake_time` and `job.number_of_repetitions` track the next firing
    /// and how many follow it.
    Repeating { job: ScheduleMeRepetitive },
    Cron { job: ScheduleMeCron },
}

impl StoredJob {
    pub fn key(&self) -> String {
        match self {
            StoredJob::OneShot { id, .. } => once_key(id),
            StoredJob::Repeating { job } => named_key(&JobKey::new(&job.name, job.group.as_deref())),
            StoredJob::Cron { job } => named_key(&JobKey::new(&job.name, job.group.as_deref())),
        }
    }
}

pub(crate) fn once_key(id: &str) -> String {
    format!("once:{id}")
}

/// The name is length-prefixed so a `/` inside a name cannot be mistaken for
/// the group separator.
pub(crate) fn named_key(key: &JobKey) -> String {
    match &key.group {
        Some(group) => format!("job:{}:{}/{}", key.name.len(), key.name, group),
        None => format!("job:{}:{}", key.name.len(), key.name),
    }
}

#[derive(Clone)]
pub struct JobStore {
    db: Db,
    jobs: Tree,
}

impl JobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let jobs = db.open_tree("scheduled_jobs")?;
        Ok(Self { db, jobs })
    }

    pub fn put(&self, job: &StoredJob) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec(job)?;
        self.jobs.insert(job.key().as_bytes(), serialized)?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.jobs.remove(key.as_bytes())?;
        Ok(())
    }

    /// Every decodable job. Entries that fail to decode are logged and
    /// skipped.
    pub fn load(&self) -> Vec<StoredJob> {
        self.jobs
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(key, val)| match serde_json::from_slice(&val) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(key = %String::from_utf8_lossy(&key), error = %e, "skipping unreadable stored job");
                    None
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("db", &"sled::Db")
            .field("jobs", &self.jobs.len())
            .finish()
    }
}
