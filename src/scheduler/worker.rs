use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use super::jobs::{JobKey, JobScheduler};
use super::store::JobStore;
use crate::bus::{Bus, RawPublisher};
use crate::message::HandleMessage;
use crate::scheduling::{ScheduleMe, ScheduleMeCron, ScheduleMeRepetitive, UnscheduleMe};
use crate::serializer::Serializer;
use crate::utils::error::{BusError, HandlerError, Result};

pub const DEFAULT_SUBSCRIPTION_ID: &str = "warren_scheduler";

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub subscription_id: String,
    /// Where armed jobs are persisted. `None` keeps them in memory only.
    pub store_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            subscription_id: DEFAULT_SUBSCRIPTION_ID.to_string(),
            store_path: None,
        }
    }
}

/// Consumes scheduling requests from the bus and publishes the wrapped
/// messages when they are due.
pub struct SchedulerWorker {
    jobs: JobScheduler,
}

impl SchedulerWorker {
    pub fn new(publisher: Arc<dyn RawPublisher>, store: Option<JobStore>) -> Arc<Self> {
        Arc::new(Self {
            jobs: JobScheduler::new(publisher, store),
        })
    }

    /// Builds a worker publishing through `bus`, opening the job store named
    /// in `config` if any.
    pub fn for_bus<S: Serializer>(bus: &Bus<S>, config: &SchedulerConfig) -> Result<Arc<Self>> {
        let store = match &config.store_path {
            Some(path) => Some(JobStore::open(path).map_err(|e| BusError::Handler(e.into()))?),
            None => None,
        };
        Ok(Self::new(Arc::new(bus.clone()), store))
    }

    /// Re-arms stored jobs and subscribes to the four scheduling messages.
    pub async fn start<S: Serializer>(self: &Arc<Self>, bus: &Bus<S>, subscription_id: &str) -> Result<()> {
        let restored = self.jobs.restore();
        bus.subscribe_handler::<ScheduleMe, _>(subscription_id, self.clone())
            .await?;
        bus.subscribe_handler::<ScheduleMeRepetitive, _>(subscription_id, self.clone())
            .await?;
        bus.subscribe_handler::<ScheduleMeCron, _>(subscription_id, self.clone())
            .await?;
        bus.subscribe_handler::<UnscheduleMe, _>(subscription_id, self.clone())
            .await?;
        info!(subscription_id, restored, "scheduler worker started");
        Ok(())
    }

    pub fn jobs(&self) -> &JobScheduler {
        &self.jobs
    }

    pub async fn shutdown(&self) {
        self.jobs.shutdown().await;
        info!("scheduler worker stopped");
    }
}

#[async_trait]
impl HandleMessage<ScheduleMe> for SchedulerWorker {
    async fn handle(&self, message: ScheduleMe) -> std::result::Result<(), HandlerError> {
        self.jobs.schedule_once(message);
        Ok(())
    }
}

#[async_trait]
impl HandleMessage<ScheduleMeRepetitive> for SchedulerWorker {
    async fn handle(&self, message: ScheduleMeRepetitive) -> std::result::Result<(), HandlerError> {
        let name = message.name.clone();
        if let Err(e) = self.jobs.schedule_repeating(message) {
            error!(job = %name, error = %e, "could not schedule repeating job");
        }
        Ok(())
    }
}

#[async_trait]
impl HandleMessage<ScheduleMeCron> for SchedulerWorker {
    async fn handle(&self, message: ScheduleMeCron) -> std::result::Result<(), HandlerError> {
        let name = message.name.clone();
        if let Err(e) = self.jobs.schedule_cron(message) {
            error!(job = %name, error = %e, "could not schedule cron job");
        }
        Ok(())
    }
}

#[async_trait]
impl HandleMessage<UnscheduleMe> for SchedulerWorker {
    async fn handle(&self, message: UnscheduleMe) -> std::result::Result<(), HandlerError> {
        self.jobs
            .unschedule(&JobKey::new(&message.name, message.group.as_deref()));
        Ok(())
    }
}
