//! Armed jobs.
//!
//! Every job is a tokio task that sleeps until its next firing, republishes
//! the wrapped message through a [`RawPublisher`] and goes back to sleep.
//! Named jobs (repeating and cron) are tracked by [`JobKey`] so they can be
//! replaced or cancelled; one-shot jobs are anonymous.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::RawPublisher;
use crate::scheduler::store::{JobStore, StoredJob, named_key, once_key};
use crate::scheduling::{ScheduleMe, ScheduleMeCron, ScheduleMeRepetitive};
use crate::utils::error::{BusError, Result};

/// Identity of a repeating or cron job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub name: String,
    pub group: Option<String>,
}

impl JobKey {
    pub fn new(name: &str, group: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            group: group.map(str::to_string),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(f, "{}/{}", self.name, group),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Parses a cron expression. Five-field expressions get a leading seconds
/// field of `0`.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| {
        BusError::scheduling(
            "cron_expression",
            format!("unable to parse '{expression}': {e}"),
        )
    })
}

/// First firing of a repeating job not earlier than `now`, and how many
/// firings were skipped to reach it.
fn next_due(wake_time: DateTime<Utc>, interval: Duration, now: DateTime<Utc>) -> (DateTime<Utc>, i64) {
    if wake_time >= now {
        return (wake_time, 0);
    }
    let Ok(step) = chrono::Duration::from_std(interval) else {
        return (wake_time, 0);
    };
    let step_ms = step.num_milliseconds().max(1);
    let behind_ms = (now - wake_time).num_milliseconds();
    let mut skipped = behind_ms / step_ms;
    if behind_ms % step_ms != 0 {
        skipped += 1;
    }
    let next = wake_time + chrono::Duration::milliseconds(skipped * step_ms);
    (next, skipped)
}

fn next_wake(wake_time: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|step| wake_time.checked_add_signed(step))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

async fn sleep_until(at: DateTime<Utc>) {
    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::time::sleep(delay).await;
}

async fn fire(publisher: &dyn RawPublisher, binding_key: &str, body: &[u8], job: &str) {
    match publisher.raw_publish_type(binding_key, body.to_vec()).await {
        Ok(()) => debug!(job, binding_key, "scheduled message published"),
        Err(e) => warn!(job, binding_key, error = %e, "failed to publish scheduled message"),
    }
}

fn persist(store: Option<&JobStore>, job: &StoredJob) {
    if let Some(store) = store {
        if let Err(e) = store.put(job) {
            warn!(key = %job.key(), error = %e, "failed to persist job");
        }
    }
}

fn forget(store: Option<&JobStore>, key: &str) {
    if let Some(store) = store {
        if let Err(e) = store.remove(key) {
            warn!(key, error = %e, "failed to remove stored job");
        }
    }
}

/// Store access of one armed named job. Once revoked, the job's task no
/// longer writes to the store.
#[derive(Clone, Default)]
struct Lease(Arc<Mutex<bool>>);

impl Lease {
    fn persist(&self, store: Option<&JobStore>, job: &StoredJob) {
        let revoked = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if !*revoked {
            persist(store, job);
        }
    }

    fn forget(&self, store: Option<&JobStore>, key: &str) {
        let revoked = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if !*revoked {
            forget(store, key);
        }
    }

    /// Waits for an in-flight write to finish.
    fn revoke(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

struct NamedJob {
    handle: JoinHandle<()>,
    lease: Lease,
}

impl NamedJob {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Revokes the store lease and aborts the task. Returns whether the task
    /// was still running.
    fn retire(self) -> bool {
        self.lease.revoke();
        let live = self.is_live();
        self.handle.abort();
        live
    }
}

/// Arms, replaces and cancels scheduled jobs.
pub struct JobScheduler {
    publisher: Arc<dyn RawPublisher>,
    store: Option<JobStore>,
    named: Mutex<HashMap<JobKey, NamedJob>>,
    anonymous: Mutex<JoinSet<()>>,
}

impl JobScheduler {
    pub fn new(publisher: Arc<dyn RawPublisher>, store: Option<JobStore>) -> Self {
        Self {
            publisher,
            store,
            named: Mutex::new(HashMap::new()),
            anonymous: Mutex::new(JoinSet::new()),
        }
    }

    pub fn schedule_once(&self, job: ScheduleMe) {
        let id = Uuid::new_v4().to_string();
        persist(
            self.store.as_ref(),
            &StoredJob::OneShot {
                id: id.clone(),
                job: job.clone(),
            },
        );
        self.arm_once(id, job);
    }

    pub fn schedule_repeating(&self, job: ScheduleMeRepetitive) -> Result<()> {
        job.validate()?;
        self.retire_existing(&JobKey::new(&job.name, job.group.as_deref()));
        persist(self.store.as_ref(), &StoredJob::Repeating { job: job.clone() });
        self.arm_repeating(job, false);
        Ok(())
    }

    pub fn schedule_cron(&self, job: ScheduleMeCron) -> Result<()> {
        job.validate()?;
        let schedule = parse_cron(&job.cron_expression)?;
        self.retire_existing(&JobKey::new(&job.name, job.group.as_deref()));
        persist(self.store.as_ref(), &StoredJob::Cron { job: job.clone() });
        self.arm_cron(job, schedule);
        Ok(())
    }

    /// Cancels the named job. Returns whether a live job was found.
    pub fn unschedule(&self, key: &JobKey) -> bool {
        let live = self.take_named(key).is_some_and(NamedJob::retire);
        forget(self.store.as_ref(), &named_key(key));
        if live {
            info!(job = %key, "job unscheduled");
        } else {
            info!(job = %key, "no scheduled job to remove");
        }
        live
    }

    pub fn is_scheduled(&self, key: &JobKey) -> bool {
        self.named
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(NamedJob::is_live)
    }

    /// Live named jobs.
    pub fn named_jobs(&self) -> usize {
        self.named
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|job| job.is_live())
            .count()
    }

    /// One-shot jobs that have not fired yet.
    pub fn pending_one_shots(&self) -> usize {
        let mut anonymous = self.anonymous.lock().unwrap_or_else(PoisonError::into_inner);
        while anonymous.try_join_next().is_some() {}
        anonymous.len()
    }

    /// Re-arms every job found in the store. Returns how many were armed.
    pub fn restore(&self) -> usize {
        let Some(store) = self.store.as_ref() else {
            return 0;
        };
        let mut armed = 0;
        for stored in store.load() {
            match stored {
                StoredJob::OneShot { id, job } => {
                    self.arm_once(id, job);
                    armed += 1;
                }
                StoredJob::Repeating { job } => {
                    self.arm_repeating(job, true);
                    armed += 1;
                }
                StoredJob::Cron { job } => match parse_cron(&job.cron_expression) {
                    Ok(schedule) => {
                        self.arm_cron(job, schedule);
                        armed += 1;
                    }
                    Err(e) => warn!(job = %job.name, error = %e, "dropping stored cron job"),
                },
            }
        }
        if armed > 0 {
            info!(armed, "stored jobs re-armed");
        }
        armed
    }

    /// Cancels every job. Stored jobs stay in the store.
    pub async fn shutdown(&self) {
        let named: Vec<NamedJob> = self
            .named
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, job)| job)
            .collect();
        for job in named {
            job.retire();
        }
        let mut anonymous =
            std::mem::take(&mut *self.anonymous.lock().unwrap_or_else(PoisonError::into_inner));
        anonymous.shutdown().await;
        if let Some(store) = self.store.as_ref() {
            if let Err(e) = store.flush() {
                warn!(error = %e, "failed to flush job store");
            }
        }
    }

    fn arm_once(&self, id: String, job: ScheduleMe) {
        let publisher = self.publisher.clone();
        let store = self.store.clone();
        debug!(binding_key = %job.binding_key, wake_time = %job.wake_time, "one-shot job armed");
        let task = async move {
            sleep_until(job.wake_time).await;
            fire(&*publisher, &job.binding_key, &job.inner_message, &id).await;
            forget(store.as_ref(), &once_key(&id));
        };
        let mut anonymous = self.anonymous.lock().unwrap_or_else(PoisonError::into_inner);
        while anonymous.try_join_next().is_some() {}
        anonymous.spawn(task);
    }

    /// With `catch_up`, firings missed while the job was not armed are
    /// skipped instead of fired late.
    fn arm_repeating(&self, job: ScheduleMeRepetitive, catch_up: bool) {
        let key = JobKey::new(&job.name, job.group.as_deref());
        let publisher = self.publisher.clone();
        let store = self.store.clone();
        let stored_key = named_key(&key);
        let lease = Lease::default();
        let task_lease = lease.clone();
        let label = key.to_string();
        debug!(
            job = %label,
            wake_time = %job.wake_time,
            repetitions = job.number_of_repetitions,
            "repeating job armed"
        );

        let task_label = label.clone();
        let task = async move {
            let mut job = job;
            let (first, skipped) = if catch_up {
                next_due(job.wake_time, job.repetition_interval, Utc::now())
            } else {
                (job.wake_time, 0)
            };
            job.wake_time = first;
            if !job.repeats_forever() {
                let remaining = i64::from(job.number_of_repetitions) - skipped;
                if remaining < 0 {
                    task_lease.forget(store.as_ref(), &stored_key);
                    return;
                }
                job.number_of_repetitions = i32::try_from(remaining).unwrap_or(i32::MAX);
            }
            if skipped > 0 {
                debug!(job = %task_label, skipped, "missed firings skipped");
                task_lease.persist(store.as_ref(), &StoredJob::Repeating { job: job.clone() });
            }

            loop {
                sleep_until(job.wake_time).await;
                fire(&*publisher, &job.binding_key, &job.inner_message, &task_label).await;
                if job.number_of_repetitions == 0 {
                    break;
                }
                if !job.repeats_forever() {
                    job.number_of_repetitions -= 1;
                }
                job.wake_time = next_wake(job.wake_time, job.repetition_interval);
                task_lease.persist(store.as_ref(), &StoredJob::Repeating { job: job.clone() });
            }
            task_lease.forget(store.as_ref(), &stored_key);
            debug!(job = %task_label, "repeating job completed");
        };
        self.replace_named(key, task, lease, &label);
    }

    fn arm_cron(&self, job: ScheduleMeCron, schedule: cron::Schedule) {
        let key = JobKey::new(&job.name, job.group.as_deref());
        let publisher = self.publisher.clone();
        let label = key.to_string();
        debug!(job = %label, expression = %job.cron_expression, "cron job armed");

        let task_label = label.clone();
        let task = async move {
            let mut last = Utc::now();
            loop {
                let Some(next) = schedule.after(&last).next() else {
                    debug!(job = %task_label, "cron job has no further occurrences");
                    break;
                };
                sleep_until(next).await;
                fire(&*publisher, &job.binding_key, &job.inner_message, &task_label).await;
                last = next;
            }
        };
        self.replace_named(key, task, Lease::default(), &label);
    }

    fn take_named(&self, key: &JobKey) -> Option<NamedJob> {
        self.named
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Stops a job about to be rescheduled before its new record is written.
    fn retire_existing(&self, key: &JobKey) {
        if let Some(previous) = self.take_named(key) {
            previous.retire();
            info!(job = %key, "existing job replaced");
        }
    }

    fn replace_named<F>(&self, key: JobKey, task: F, lease: Lease, label: &str)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let previous = self
            .named
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, NamedJob { handle, lease });
        if let Some(previous) = previous {
            previous.retire();
            info!(job = %label, "existing job replaced");
        }
    }
}
