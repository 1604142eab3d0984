use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Bus;
use crate::message::Message;
use crate::scheduling::{
    Schedule, ScheduleBuilder, ScheduleMe, ScheduleMeCron, ScheduleMeRepetitive, UnscheduleMe,
};
use crate::serializer::Serializer;
use crate::utils::error::Result;

impl<S: Serializer> Bus<S> {
    /// Asks the scheduler worker to publish `message` later.
    ///
    /// `configure` selects exactly one schedule on the builder; `name` and
    /// `group` identify repeating and cron jobs so they can be unscheduled.
    ///
    /// ```rust,no_run
    /// # use std::time::Duration;
    /// # use chrono::Utc;
    /// # use serde::{Deserialize, Serialize};
    /// # use warren::{Bus, Message};
    /// # #[derive(Serialize, Deserialize)]
    /// # struct Report;
    /// # impl Message for Report { const TYPE_NAME: &'static str = "Report"; }
    /// # async fn run(bus: Bus) -> Result<(), warren::BusError> {
    /// let start = Utc::now() + chrono::Duration::minutes(5);
    /// bus.schedule_publish(
    ///     |schedule| {
    ///         schedule.at(start)?.every(Duration::from_secs(3600))?.forever();
    ///         Ok(())
    ///     },
    ///     &Report,
    ///     "hourly-report",
    ///     None,
    /// )
    /// .await
    /// # }
    /// ```
    pub async fn schedule_publish<T, C>(
        &self,
        configure: C,
        message: &T,
        name: &str,
        group: Option<&str>,
    ) -> Result<()>
    where
        T: Message,
        C: FnOnce(&mut ScheduleBuilder) -> Result<()>,
    {
        self.inner.ensure_open()?;
        let mut builder = ScheduleBuilder::new();
        configure(&mut builder)?;
        let schedule = builder.build()?;
        self.inner.ensure_connected_now()?;

        let inner_message = self.inner.serializer.message_to_bytes(message)?;
        let binding_key = T::TYPE_NAME.to_string();
        let group = group.map(str::to_string);
        match schedule {
            Schedule::OneShot { at } => {
                self.publish(&ScheduleMe {
                    binding_key,
                    inner_message,
                    wake_time: at,
                })
                .await
            }
            Schedule::Repeating {
                at,
                interval,
                count,
            } => {
                let record = ScheduleMeRepetitive::new(
                    binding_key,
                    inner_message,
                    at,
                    interval,
                    count,
                    name,
                    group,
                )?;
                self.publish(&record).await
            }
            Schedule::Cron { expression } => {
                let record =
                    ScheduleMeCron::new(binding_key, inner_message, expression, name, group)?;
                self.publish(&record).await
            }
        }
    }

    /// Publishes `message` once at `at`.
    pub async fn future_publish<T: Message>(&self, at: DateTime<Utc>, message: &T) -> Result<()> {
        let name = Uuid::new_v4().to_string();
        self.schedule_publish(
            |schedule| {
                schedule.at(at)?.once();
                Ok(())
            },
            message,
            &name,
            None,
        )
        .await
    }

    /// Cancels a repeating or cron job. Unknown jobs are ignored by the
    /// scheduler.
    pub async fn unschedule_published_message(&self, name: &str, group: Option<&str>) -> Result<()> {
        let message = UnscheduleMe::new(name, group.map(str::to_string))?;
        self.publish(&message).await
    }
}
