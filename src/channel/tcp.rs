//! Message channel client for the pipeline broker.
//!
//! Publishing reuses one lazily opened connection; each subscription opens
//! its own connection and owns it for the life of the stream.

use super::{Delivery, MessageChannel, MessageStream, TopicPattern};
use crate::broker::wire::{read_frame, write_frame, ClientFrame, ServerFrame};
use crate::config::BrokerConfig;
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Open a connection to the broker, mapping every failure to `ChannelUnavailable`.
pub(crate) async fn connect_broker(address: &str, timeout: Duration) -> PipelineResult<TcpStream> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(unreachable(address, e)),
        Err(_) => return Err(unreachable(address, format!("timed out after {:?}", timeout))),
    };
    stream.set_nodelay(true).map_err(|e| unreachable(address, e))?;
    Ok(stream)
}

fn unreachable(address: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::ChannelUnavailable(format!("connect to broker at {}: {}", address, err))
}

pub(crate) fn lost(address: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::ChannelUnavailable(format!("broker at {}: {}", address, err))
}

#[derive(Debug)]
pub struct TcpChannel {
    address: String,
    connect_timeout: Duration,
    max_frame_bytes: usize,
    publisher: Mutex<Option<TcpStream>>,
}

impl TcpChannel {
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
            publisher: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl MessageChannel for TcpChannel {
    async fn publish(&self, topic: &str, message: Bytes) -> PipelineResult<()> {
        let mut guard = self.publisher.lock().await;
        if guard.is_none() {
            debug!(address = %self.address, "TcpChannel: opening publisher connection");
            *guard = Some(connect_broker(&self.address, self.connect_timeout).await?);
        }
        let frame = ClientFrame::Publish {
            topic: topic.to_string(),
            payload: message.to_vec(),
        };
        let Some(stream) = guard.as_mut() else {
            return Err(lost(&self.address, "publisher connection missing"));
        };
        match write_frame(stream, &frame, self.max_frame_bytes).await {
            Ok(()) => Ok(()),
            Err(e @ PipelineError::Codec(_)) => Err(e),
            Err(e) => {
                warn!(address = %self.address, error = %e, "TcpChannel: publisher connection lost");
                *guard = None;
                Err(lost(&self.address, e))
            }
        }
    }

    async fn subscribe(&self, pattern: &TopicPattern) -> PipelineResult<MessageStream> {
        let mut stream = connect_broker(&self.address, self.connect_timeout).await?;
        let max = self.max_frame_bytes;
        let request = ClientFrame::Subscribe {
            pattern: pattern.to_string(),
        };
        write_frame(&mut stream, &request, max)
            .await
            .map_err(|e| lost(&self.address, e))?;

        let ack = tokio::time::timeout(self.connect_timeout, read_frame::<_, ServerFrame>(&mut stream, max))
            .await
            .map_err(|_| lost(&self.address, "subscribe not acknowledged"))?;
        match ack {
            Ok(Some(ServerFrame::Ack)) => {}
            Ok(Some(ServerFrame::Error(reason))) => return Err(lost(&self.address, reason)),
            Ok(other) => return Err(lost(&self.address, format!("unexpected reply {:?}", other))),
            Err(e) => return Err(lost(&self.address, e)),
        }
        debug!(address = %self.address, %pattern, "TcpChannel: subscribed");

        let address = self.address.clone();
        let deliveries = futures::stream::unfold(Some(stream), move |state| {
            let address = address.clone();
            async move {
                let mut stream = state?;
                let item = match read_frame::<_, ServerFrame>(&mut stream, max).await {
                    Ok(Some(ServerFrame::Message { topic, payload })) => {
                        return Some((
                            Ok(Delivery {
                                topic,
                                payload: Bytes::from(payload),
                            }),
                            Some(stream),
                        ));
                    }
                    Ok(Some(ServerFrame::Error(reason))) => lost(&address, reason),
                    Ok(Some(other)) => lost(&address, format!("unexpected frame {:?}", other)),
                    Ok(None) => lost(&address, "connection closed"),
                    Err(e) => lost(&address, e),
                };
                Some((Err(item), None))
            }
        });
        Ok(deliveries.boxed())
    }
}
