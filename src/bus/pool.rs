//! Publish channels.
//!
//! A publish call borrows one channel from the pool for its whole duration
//! and gives it back when the [`PooledChannel`] drops. Channels that are
//! closed, or that belong to an earlier connection, are thrown away instead.

use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::connection::PersistentConnection;
use crate::protocol::Channel;
use crate::utils::error::{BusError, Result};

struct Idle {
    epoch: u64,
    channel: Box<dyn Channel>,
}

#[derive(Default)]
pub struct ChannelPool {
    idle: Mutex<Vec<Idle>>,
}

impl ChannelPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes an idle channel opened on the current connection, or opens a
    /// new one.
    pub async fn acquire(&self, connection: &PersistentConnection) -> Result<PooledChannel<'_>> {
        let epoch = connection.epoch();
        let reused = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            let mut found = None;
            while let Some(candidate) = idle.pop() {
                if candidate.epoch == epoch && candidate.channel.is_open() {
                    found = Some(candidate.channel);
                    break;
                }
            }
            found
        };
        let channel = match reused {
            Some(channel) => channel,
            None => {
                debug!(epoch, "opening publish channel");
                connection.create_channel().await?
            }
        };
        Ok(PooledChannel {
            pool: self,
            epoch,
            channel: Some(channel),
        })
    }

    /// Drops every idle channel.
    pub fn clear(&self) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Closes every idle channel.
    pub async fn close(&self) {
        let idle = std::mem::take(&mut *self.idle.lock().unwrap_or_else(PoisonError::into_inner));
        for mut entry in idle {
            let _ = entry.channel.close().await;
        }
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, epoch: u64, channel: Box<dyn Channel>) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Idle { epoch, channel });
    }
}

/// A channel held exclusively by one publish call.
pub struct PooledChannel<'a> {
    pool: &'a ChannelPool,
    epoch: u64,
    channel: Option<Box<dyn Channel>>,
}

impl PooledChannel<'_> {
    pub fn get(&mut self) -> Result<&mut dyn Channel> {
        match self.channel.as_mut() {
            Some(channel) => Ok(channel.as_mut()),
            None => Err(BusError::NotConnected),
        }
    }

    /// Drops the channel instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.channel = None;
    }
}

impl Drop for PooledChannel<'_> {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            if channel.is_open() {
                self.pool.release(self.epoch, channel);
            }
        }
    }
}
