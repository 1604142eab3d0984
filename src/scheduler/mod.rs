//! The scheduling worker.
//!
//! A subscriber built on the bus that consumes the scheduling system
//! messages and republishes their wrapped payloads when due. One worker is
//! enough for a whole bus; it may run in any process connected to the same
//! broker.

pub mod jobs;
pub mod store;
pub mod worker;

pub use jobs::{JobKey, JobScheduler, parse_cron};
pub use store::{JobStore, StoreError, StoredJob};
pub use worker::{DEFAULT_SUBSCRIPTION_ID, SchedulerConfig, SchedulerWorker};
