//! Scheduled publishing: the builder used by
//! [`crate::Bus::schedule_publish`] and the system messages it sends to the
//! scheduler worker.

pub mod builder;
pub mod messages;

pub use builder::{Repetition, Schedule, ScheduleBuilder, StartAt};
pub use messages::{ScheduleMe, ScheduleMeCron, ScheduleMeRepetitive, UnscheduleMe};
