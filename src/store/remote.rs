//! Feedback store client for the pipeline broker.
//!
//! Every request uses its own short-lived connection. Dropping a pending
//! `get`/`take` closes that connection and the broker abandons the wait.

use super::FeedbackStore;
use crate::broker::wire::{read_frame, write_frame, ClientFrame, ServerFrame};
use crate::channel::tcp::{connect_broker, lost};
use crate::config::BrokerConfig;
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RemoteFeedbackStore {
    address: String,
    connect_timeout: Duration,
    max_frame_bytes: usize,
}

impl RemoteFeedbackStore {
    pub fn new(address: &str) -> Self {
        Self::from_config(&BrokerConfig {
            address: address.to_string(),
            ..BrokerConfig::default()
        })
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            address: config.address.clone(),
            connect_timeout: config.connect_timeout,
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    /// Round-trip a health check through the broker.
    pub async fn ping(&self) -> PipelineResult<()> {
        match self.request(ClientFrame::Ping, Duration::ZERO).await? {
            ServerFrame::Pong => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    /// Send one request and wait for its reply; `wait` is how long the broker may hold it.
    async fn request(&self, frame: ClientFrame, wait: Duration) -> PipelineResult<ServerFrame> {
        let mut stream = connect_broker(&self.address, self.connect_timeout).await?;
        write_frame(&mut stream, &frame, self.max_frame_bytes)
            .await
            .map_err(|e| self.transport_or_codec(e))?;

        let reply = tokio::time::timeout(
            wait.saturating_add(self.connect_timeout),
            read_frame::<_, ServerFrame>(&mut stream, self.max_frame_bytes),
        )
        .await
        .map_err(|_| lost(&self.address, "no reply from broker"))?;
        match reply {
            Ok(Some(ServerFrame::Error(reason))) => Err(PipelineError::Codec(format!(
                "broker at {} rejected request: {}",
                self.address, reason
            ))),
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(lost(&self.address, "connection closed")),
            Err(e) => Err(self.transport_or_codec(e)),
        }
    }

    /// Frame size and encoding problems stay `Codec`; everything else means the broker is gone.
    fn transport_or_codec(&self, err: PipelineError) -> PipelineError {
        match err {
            PipelineError::Codec(_) => err,
            other => lost(&self.address, other),
        }
    }

    fn unexpected(&self, frame: ServerFrame) -> PipelineError {
        PipelineError::Codec(format!("unexpected reply from {}: {:?}", self.address, frame))
    }

    fn value_or_not_found(&self, key: &str, frame: ServerFrame) -> PipelineResult<Bytes> {
        match frame {
            ServerFrame::Value(value) => Ok(Bytes::from(value)),
            ServerFrame::NotFound => Err(PipelineError::NotFound {
                key: key.to_string(),
            }),
            other => Err(self.unexpected(other)),
        }
    }
}

/// Whole milliseconds, rounded up so the broker never waits less than asked.
fn millis(timeout: Duration) -> u64 {
    let whole = timeout.as_millis();
    let rounded = if timeout.subsec_nanos() % 1_000_000 == 0 {
        whole
    } else {
        whole + 1
    };
    u64::try_from(rounded).unwrap_or(u64::MAX)
}

#[async_trait]
impl FeedbackStore for RemoteFeedbackStore {
    async fn put(&self, key: &str, value: Bytes) -> PipelineResult<()> {
        debug!(key, address = %self.address, "RemoteFeedbackStore::put");
        let frame = ClientFrame::Put {
            key: key.to_string(),
            value: value.to_vec(),
        };
        match self.request(frame, Duration::ZERO).await? {
            ServerFrame::Ack => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    async fn get(&self, key: &str, timeout: Duration) -> PipelineResult<Bytes> {
        let frame = ClientFrame::Get {
            key: key.to_string(),
            timeout_ms: millis(timeout),
        };
        let reply = self.request(frame, timeout).await?;
        self.value_or_not_found(key, reply)
    }

    async fn take(&self, key: &str, timeout: Duration) -> PipelineResult<Bytes> {
        let frame = ClientFrame::Take {
            key: key.to_string(),
            timeout_ms: millis(timeout),
        };
        let reply = self.request(frame, timeout).await?;
        self.value_or_not_found(key, reply)
    }

    async fn remove(&self, key: &str) -> PipelineResult<bool> {
        let frame = ClientFrame::Remove {
            key: key.to_string(),
        };
        match self.request(frame, Duration::ZERO).await? {
            ServerFrame::Ack => Ok(true),
            ServerFrame::NotFound => Ok(false),
            other => Err(self.unexpected(other)),
        }
    }
}
