//! Request/response.
//!
//! Requests go to the shared rpc exchange, routed by the request type id
//! into a durable queue of the same name where responders consume them. Each
//! request carries the name of a private response queue in `reply_to`; the
//! responder publishes its answer there through the default exchange.
//!
//! The requester keeps one response queue per response callback. The
//! callback is identified by its type, so every call site that passes the
//! same closure shares one queue, created on the first request. Response
//! queues are exclusive to the connection: they vanish on disconnect and are
//! created again by the next request.

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Bus, BusInner};
use crate::consumer::OnMessage;
use crate::message::Message;
use crate::protocol::{Delivery, QueueOptions};
use crate::serializer::Serializer;
use crate::topology::{RPC_EXCHANGE, SubscriptionAction};
use crate::utils::error::{BusError, HandlerError, Result};

/// Response queue names keyed by response callback type.
#[derive(Default)]
pub struct ResponseSlots {
    slots: Mutex<HashMap<TypeId, String>>,
}

impl ResponseSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn clear(&self) {
        self.slots.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }
}

impl<S: Serializer> BusInner<S> {
    /// Returns the response queue for callback type `key`, creating it and
    /// its consumer on first use.
    async fn response_queue(&self, key: TypeId, on_response: OnMessage) -> Result<String> {
        let mut slots = self.responses.slots.lock().await;
        if let Some(queue) = slots.get(&key) {
            return Ok(queue.clone());
        }

        let queue = format!("warren_return_{}", Uuid::new_v4());
        let mut channel = self.connection.create_channel().await?;
        channel
            .queue_declare(&queue, QueueOptions::transient_exclusive())
            .await?;
        self.consumers
            .start_consumer(channel, &queue, on_response)
            .await?;
        debug!(queue = %queue, "response queue created");
        slots.insert(key, queue.clone());
        Ok(queue)
    }

    async fn start_responder(&self, request_type: &str, on_request: OnMessage) -> Result<()> {
        let mut channel = self.connection.create_channel().await?;
        self.topology
            .declare_rpc_once(&mut *channel, request_type)
            .await?;
        channel.basic_qos(self.config.prefetch_count).await?;
        self.consumers
            .start_consumer(channel, request_type, on_request)
            .await?;
        info!(request_type, "responder started");
        Ok(())
    }

    async fn publish_request(&self, request_type: &str, reply_to: &str, body: Vec<u8>) -> Result<()> {
        self.ensure_connected_now()?;
        let mut pooled = self.pool.acquire(&self.connection).await?;
        let channel = pooled.get()?;
        let properties = self.properties_for(request_type).with_reply_to(reply_to);

        let declared = self.topology.declare_rpc_once(channel, request_type).await;
        let published = match declared {
            Ok(()) => {
                channel
                    .basic_publish(RPC_EXCHANGE, request_type, properties, body)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            pooled.discard();
            return Err(BusError::PublishFailed(e));
        }
        debug!(request_type, reply_to, "request published");
        Ok(())
    }

    /// Sends a responder's answer back to the requester.
    async fn publish_response<T: Message>(&self, request: &Delivery, response: &T) -> Result<()> {
        let Some(reply_to) = request.properties.reply_to.as_deref() else {
            warn!(
                request_type = request.properties.message_type.as_deref().unwrap_or_default(),
                "request has no reply-to address, response dropped"
            );
            return Ok(());
        };
        self.connection
            .ensure_connected(self.config.connect_timeout)
            .await?;
        let body = self.serializer.message_to_bytes(response)?;
        let mut properties = self.properties_for(T::TYPE_NAME);
        if let Some(correlation_id) = &request.properties.correlation_id {
            properties.correlation_id = Some(correlation_id.clone());
        }
        self.publish_envelope("", reply_to, properties, body).await
    }
}

impl<S: Serializer> Bus<S> {
    /// Sends `request` and runs `on_response` with the answer.
    ///
    /// Returns once the request is published; the response arrives later on
    /// the response queue tied to `F`.
    pub async fn request<TReq, TResp, F>(&self, request: &TReq, on_response: F) -> Result<()>
    where
        TReq: Message,
        TResp: Message,
        F: Fn(TResp) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.inner.ensure_connected_now()?;
        let body = self.inner.serializer.message_to_bytes(request)?;

        let on_response = Arc::new(on_response);
        let on_delivery = self.typed_handler(move |response: TResp| {
            let on_response = on_response.clone();
            async move { on_response(response) }
        });
        let reply_to = self
            .inner
            .response_queue(TypeId::of::<F>(), on_delivery)
            .await?;
        self.inner
            .publish_request(TReq::TYPE_NAME, &reply_to, body)
            .await
    }

    /// Answers requests of type `TReq` with `responder`.
    pub async fn respond<TReq, TResp, F>(&self, responder: F) -> Result<()>
    where
        TReq: Message,
        TResp: Message,
        F: Fn(TReq) -> std::result::Result<TResp, HandlerError> + Send + Sync + 'static,
    {
        let responder = Arc::new(responder);
        self.respond_async(move |request: TReq| {
            let responder = responder.clone();
            async move { responder(request) }
        })
        .await
    }

    /// Answers requests with an asynchronous responder. A failing responder
    /// sends no response: the requester's callback is simply never called.
    pub async fn respond_async<TReq, TResp, F, Fut>(&self, responder: F) -> Result<()>
    where
        TReq: Message,
        TResp: Message,
        F: Fn(TReq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<TResp, HandlerError>> + Send + 'static,
    {
        self.inner.ensure_open()?;
        let responder = Arc::new(responder);
        let weak = Arc::downgrade(&self.inner);
        let on_request: OnMessage = Arc::new(move |delivery: Delivery| {
            let responder = responder.clone();
            let weak = weak.clone();
            async move {
                let request = weak
                    .upgrade()
                    .ok_or(BusError::Shutdown)?
                    .decode::<TReq>(&delivery)?;
                let response = responder(request).await.map_err(BusError::Handler)?;
                let inner = weak.upgrade().ok_or(BusError::Shutdown)?;
                inner.publish_response(&delivery, &response).await
            }
            .boxed()
        });

        let weak = Arc::downgrade(&self.inner);
        let action: SubscriptionAction = Arc::new(move || {
            let weak = weak.clone();
            let on_request = on_request.clone();
            async move {
                let inner = weak.upgrade().ok_or(BusError::Shutdown)?;
                inner.ensure_open()?;
                inner.start_responder(TReq::TYPE_NAME, on_request).await
            }
            .boxed()
        });
        self.inner.subscriptions.register(action).await;
        Ok(())
    }
}
