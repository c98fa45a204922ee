//! Message Channel: topic-based publish/subscribe.
//!
//! Delivery is at-most-once and best-effort to the subscribers connected at
//! publish time:
//!
//! - `publish` never waits for subscribers and fails only with
//!   `ChannelUnavailable` when the transport is down.
//! - `subscribe` yields a lazy, endless, non-restartable stream. Nothing
//!   published before the subscription existed is replayed.
//! - Every subscriber matching a topic receives its own copy (fan-out).
//! - Messages from one producer to one topic arrive in publish order; there is
//!   no ordering across topics.
//!
//! A subscription stream yields `Err(ChannelUnavailable)` once and ends when
//! the transport drops; the subscriber is expected to back off and subscribe
//! again. [`follow`] does exactly that for subscribers that only consume.

pub mod memory;
pub mod tcp;

pub use memory::InMemoryChannel;
pub use tcp::TcpChannel;

use crate::error::{PipelineError, PipelineResult};
use crate::recovery::RetryPolicy;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// One message as seen by a subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
}

/// Live subscription; dropping it unsubscribes.
pub type MessageStream = BoxStream<'static, PipelineResult<Delivery>>;

/// Which topics a subscription receives.
///
/// A pattern ending in `*` matches every topic with that prefix; anything
/// else matches exactly one topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPattern {
    Exact(String),
    Prefix(String),
}

impl TopicPattern {
    pub fn exact(topic: &str) -> Self {
        TopicPattern::Exact(topic.to_string())
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::Exact(t) => t == topic,
            TopicPattern::Prefix(p) => topic.starts_with(p.as_str()),
        }
    }
}

impl FromStr for TopicPattern {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TopicPattern::from(s))
    }
}

impl From<&str> for TopicPattern {
    fn from(s: &str) -> Self {
        match s.strip_suffix('*') {
            Some(prefix) => TopicPattern::Prefix(prefix.to_string()),
            None => TopicPattern::Exact(s.to_string()),
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicPattern::Exact(t) => f.write_str(t),
            TopicPattern::Prefix(p) => write!(f, "{}*", p),
        }
    }
}

/// Publish/subscribe transport shared by all pipeline stages.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Publish without waiting for any subscriber.
    async fn publish(&self, topic: &str, message: Bytes) -> PipelineResult<()>;

    /// Subscribe to every topic matching `pattern`.
    ///
    /// The subscription is live when this returns; later publishes are delivered.
    async fn subscribe(&self, pattern: &TopicPattern) -> PipelineResult<MessageStream>;
}

#[async_trait]
impl<T: MessageChannel + ?Sized> MessageChannel for Arc<T> {
    async fn publish(&self, topic: &str, message: Bytes) -> PipelineResult<()> {
        (**self).publish(topic, message).await
    }

    async fn subscribe(&self, pattern: &TopicPattern) -> PipelineResult<MessageStream> {
        (**self).subscribe(pattern).await
    }
}

/// Hand every delivery on `pattern` to `on_delivery` until `shutdown` resolves.
///
/// Lost subscriptions are re-established with backoff from `policy`. Returns
/// the last failure once the policy's attempts are exhausted, or at once for a
/// non-transport failure.
pub async fn follow<F>(
    channel: &dyn MessageChannel,
    pattern: &TopicPattern,
    policy: &RetryPolicy,
    shutdown: impl Future<Output = ()>,
    mut on_delivery: F,
) -> PipelineResult<()>
where
    F: FnMut(Delivery),
{
    tokio::pin!(shutdown);
    let mut backoff = policy.backoff();
    loop {
        let subscribed = tokio::select! {
            _ = &mut shutdown => return Ok(()),
            subscribed = channel.subscribe(pattern) => subscribed,
        };

        let failure = match subscribed {
            Ok(mut stream) => {
                backoff.reset();
                debug!(%pattern, "Following");
                loop {
                    let next = tokio::select! {
                        _ = &mut shutdown => return Ok(()),
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(delivery)) => on_delivery(delivery),
                        Some(Err(e)) => break e,
                        None => break PipelineError::ChannelUnavailable(format!("subscription to {} ended", pattern)),
                    }
                }
            }
            Err(e) => e,
        };

        if !failure.is_transport() {
            return Err(failure);
        }
        let Some(delay) = backoff.next_delay() else {
            warn!(%pattern, attempts = backoff.attempt(), error = %failure, "Giving up on subscription");
            return Err(failure);
        };
        warn!(%pattern, ?delay, error = %failure, "Subscription lost, backing off");
        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
