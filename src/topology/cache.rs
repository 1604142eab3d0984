use std::collections::HashSet;

use tokio::sync::Mutex;
use tracing::debug;

use crate::protocol::{Channel, ExchangeKind, ProtocolError, QueueOptions};

/// Exchange used for every request/response flow.
pub const RPC_EXCHANGE: &str = "warren_rpc";

#[derive(Default)]
struct Declared {
    exchanges: HashSet<String>,
    rpc: HashSet<String>,
}

/// Names declared on the broker during the current connection epoch.
///
/// Declarations happen under the cache lock, so a name is declared at most
/// once per epoch even when several publishers race for it. [`clear`] waits
/// for an in-flight declaration and then wipes it with everything else.
///
/// [`clear`]: TopologyCache::clear
#[derive(Default)]
pub struct TopologyCache {
    declared: Mutex<Declared>,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a durable direct exchange the first time `name` is seen.
    /// The default exchange is never declared.
    pub async fn declare_exchange_once(
        &self,
        channel: &mut dyn Channel,
        name: &str,
    ) -> Result<(), ProtocolError> {
        if name.is_empty() {
            return Ok(());
        }
        let mut declared = self.declared.lock().await;
        if declared.exchanges.contains(name) {
            return Ok(());
        }
        debug!(exchange = name, "declaring exchange");
        channel
            .exchange_declare(name, ExchangeKind::Direct, true)
            .await?;
        declared.exchanges.insert(name.to_string());
        Ok(())
    }

    /// Declares the request/response structure for `request_type`: the rpc
    /// exchange, a durable queue named after the request type, and the
    /// binding between them.
    pub async fn declare_rpc_once(
        &self,
        channel: &mut dyn Channel,
        request_type: &str,
    ) -> Result<(), ProtocolError> {
        let mut declared = self.declared.lock().await;
        if declared.rpc.contains(request_type) {
            return Ok(());
        }
        debug!(request_type, "declaring request/response structure");
        channel
            .exchange_declare(RPC_EXCHANGE, ExchangeKind::Direct, true)
            .await?;
        channel
            .queue_declare(request_type, QueueOptions::durable())
            .await?;
        channel
            .queue_bind(request_type, RPC_EXCHANGE, request_type)
            .await?;
        declared.rpc.insert(request_type.to_string());
        Ok(())
    }

    pub async fn clear(&self) {
        let mut declared = self.declared.lock().await;
        declared.exchanges.clear();
        declared.rpc.clear();
    }

    pub async fn is_empty(&self) -> bool {
        let declared = self.declared.lock().await;
        declared.exchanges.is_empty() && declared.rpc.is_empty()
    }

    pub async fn contains_exchange(&self, name: &str) -> bool {
        self.declared.lock().await.exchanges.contains(name)
    }
}
