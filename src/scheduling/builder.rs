//! Schedule builder.
//!
//! A fresh [`ScheduleBuilder`] is invalid. Exactly one of the following
//! selections makes it valid:
//!
//! ```text
//! at(t)                          one-shot at t
//! at(t).once()                   same, spelled out
//! at(t).every(i).times(n)        at t, then n more times every i
//! at(t).every(i).forever()       at t, then every i until unscheduled
//! with_cron(expr)                on every instant matching expr
//! ```
//!
//! Selecting two different kinds (for instance `at` and `with_cron`) leaves
//! the builder invalid.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::utils::error::{BusError, Result};

/// Smallest accepted repetition interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Repetition count meaning "until unscheduled".
pub const FOREVER: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    OneShot {
        at: DateTime<Utc>,
    },
    /// Fires at `at`, then `count` more times every `interval`. A count of
    /// [`FOREVER`] never stops.
    Repeating {
        at: DateTime<Utc>,
        interval: Duration,
        count: i32,
    },
    Cron {
        expression: String,
    },
}

impl Schedule {
    fn same_kind(&self, other: &Schedule) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[derive(Debug, Default)]
pub struct ScheduleBuilder {
    schedule: Option<Schedule>,
    conflicting: bool,
}

impl ScheduleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a timed schedule. Fails unless `time` is strictly in the
    /// future.
    pub fn at(&mut self, time: DateTime<Utc>) -> Result<StartAt<'_>> {
        if time <= Utc::now() {
            return Err(BusError::scheduling(
                "at",
                format!("unable to schedule a message for {time}, which is not in the future"),
            ));
        }
        self.select(Schedule::OneShot { at: time });
        Ok(StartAt {
            builder: self,
            at: time,
        })
    }

    /// Schedules on a cron expression, evaluated in UTC by the scheduler.
    pub fn with_cron(&mut self, expression: &str) -> Result<()> {
        if expression.trim().is_empty() {
            return Err(BusError::scheduling(
                "cron_expression",
                "a cron expression must not be blank",
            ));
        }
        self.select(Schedule::Cron {
            expression: expression.trim().to_string(),
        });
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.schedule.is_some() && !self.conflicting
    }

    pub fn is_one_shot(&self) -> bool {
        self.is_valid() && matches!(self.schedule, Some(Schedule::OneShot { .. }))
    }

    pub fn is_repeating(&self) -> bool {
        self.is_valid() && matches!(self.schedule, Some(Schedule::Repeating { .. }))
    }

    pub fn is_cron(&self) -> bool {
        self.is_valid() && matches!(self.schedule, Some(Schedule::Cron { .. }))
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref().filter(|_| !self.conflicting)
    }

    pub fn build(self) -> Result<Schedule> {
        match self.schedule {
            Some(schedule) if !self.conflicting => Ok(schedule),
            _ => Err(BusError::scheduling(
                "at",
                "invalid schedule: select exactly one of at(..), at(..).every(..) or with_cron(..)",
            )),
        }
    }

    fn select(&mut self, schedule: Schedule) {
        if self
            .schedule
            .as_ref()
            .is_some_and(|current| !current.same_kind(&schedule))
        {
            self.conflicting = true;
        }
        self.schedule = Some(schedule);
    }

    /// Replaces the selection made earlier in the same chain.
    fn refine(&mut self, schedule: Schedule) {
        self.schedule = Some(schedule);
    }
}

/// A start time, optionally followed by a repetition.
pub struct StartAt<'a> {
    builder: &'a mut ScheduleBuilder,
    at: DateTime<Utc>,
}

impl<'a> StartAt<'a> {
    /// Fire exactly once.
    pub fn once(self) {
        self.builder.refine(Schedule::OneShot { at: self.at });
    }

    /// Repeat every `interval` after the first firing. Without a following
    /// `times` or `forever` the message fires once.
    pub fn every(self, interval: Duration) -> Result<Repetition<'a>> {
        if interval < MIN_INTERVAL {
            return Err(BusError::scheduling(
                "interval",
                "the repetition interval must be at least 1ms",
            ));
        }
        self.builder.refine(Schedule::Repeating {
            at: self.at,
            interval,
            count: 0,
        });
        Ok(Repetition {
            builder: self.builder,
            at: self.at,
            interval,
        })
    }
}

pub struct Repetition<'a> {
    builder: &'a mut ScheduleBuilder,
    at: DateTime<Utc>,
    interval: Duration,
}

impl Repetition<'_> {
    /// Repeat `count` more times after the first firing.
    pub fn times(self, count: i32) -> Result<()> {
        if count < 0 {
            return Err(BusError::scheduling(
                "times",
                "unable to repeat for less than 0 times",
            ));
        }
        self.set(count);
        Ok(())
    }

    pub fn forever(self) {
        self.set(FOREVER);
    }

    fn set(self, count: i32) {
        self.builder.refine(Schedule::Repeating {
            at: self.at,
            interval: self.interval,
            count,
        });
    }
}
