//! In-process message channel.
//!
//! One bounded `tokio::sync::broadcast` bus carries every topic; each
//! subscription filters by its pattern. A subscriber that falls more than
//! `capacity` messages behind loses the overflow (logged) instead of slowing
//! the publisher.
//!
//! `disconnect` / `reconnect` simulate losing the transport: live subscriptions
//! end with `ChannelUnavailable` and publish/subscribe fail until reconnected.

use super::{Delivery, MessageChannel, MessageStream, TopicPattern};
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// Default bus capacity (messages)
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct InMemoryChannel {
    bus: RwLock<Option<broadcast::Sender<Delivery>>>,
    capacity: usize,
}

impl InMemoryChannel {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            bus: RwLock::new(Some(tx)),
            capacity,
        }
    }

    /// Drop the transport; live subscriptions end with `ChannelUnavailable`.
    pub fn disconnect(&self) {
        debug!("InMemoryChannel::disconnect");
        *self.bus.write() = None;
    }

    /// Restore the transport after [`disconnect`](Self::disconnect).
    pub fn reconnect(&self) {
        let mut bus = self.bus.write();
        if bus.is_none() {
            debug!("InMemoryChannel::reconnect");
            let (tx, _) = broadcast::channel(self.capacity);
            *bus = Some(tx);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.bus.read().is_some()
    }

    /// Number of live subscriptions across all topics
    pub fn subscriber_count(&self) -> usize {
        self.bus
            .read()
            .as_ref()
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn unavailable() -> PipelineError {
        PipelineError::ChannelUnavailable("in-memory channel disconnected".into())
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    async fn publish(&self, topic: &str, message: Bytes) -> PipelineResult<()> {
        let bus = self.bus.read();
        let tx = bus.as_ref().ok_or_else(Self::unavailable)?;
        // No subscribers is fine: the message is simply not delivered.
        let _ = tx.send(Delivery {
            topic: topic.to_string(),
            payload: message,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &TopicPattern) -> PipelineResult<MessageStream> {
        let rx = {
            let bus = self.bus.read();
            bus.as_ref().ok_or_else(Self::unavailable)?.subscribe()
        };
        debug!(%pattern, "InMemoryChannel::subscribe");
        Ok(delivery_stream(rx, pattern.clone()))
    }
}

fn delivery_stream(rx: broadcast::Receiver<Delivery>, pattern: TopicPattern) -> MessageStream {
    futures::stream::unfold(Some(rx), move |state| {
        let pattern = pattern.clone();
        async move {
            let mut rx = state?;
            loop {
                match rx.recv().await {
                    Ok(delivery) if pattern.matches(&delivery.topic) => {
                        return Some((Ok(delivery), Some(rx)));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%pattern, skipped, "Subscriber lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => {
                        return Some((Err(InMemoryChannel::unavailable()), None));
                    }
                }
            }
        }
    })
    .boxed()
}
