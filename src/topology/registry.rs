use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::utils::error::BusError;

/// A replayable subscription: declares what it needs and starts consuming.
/// Running it twice on the same connection must be harmless.
pub type SubscriptionAction =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), BusError>> + Send + Sync>;

/// Ordered list of subscription actions, replayed in full after every
/// reconnect.
#[derive(Default)]
pub struct SubscriptionRegistry {
    actions: Mutex<Vec<SubscriptionAction>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `action` and runs it once. A failure here is logged only: the
    /// action runs again on the next reconnect.
    ///
    /// The list lock is held while the action runs, so a concurrent replay
    /// cannot run it a second time on the same connection.
    pub async fn register(&self, action: SubscriptionAction) {
        let mut actions = self.actions.lock().await;
        actions.push(action.clone());
        let position = actions.len();
        if let Err(e) = action().await {
            warn!(
                position,
                error = %e,
                "subscription could not be started now, it will be retried on reconnect"
            );
        }
    }

    /// Runs every action in registration order. Failures are logged and do
    /// not stop the replay.
    pub async fn replay(&self) {
        let actions = self.actions.lock().await;
        debug!(count = actions.len(), "replaying subscriptions");
        for (index, action) in actions.iter().enumerate() {
            if let Err(e) = action().await {
                warn!(position = index + 1, error = %e, "subscription replay failed");
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.actions.lock().await.len()
    }
}
