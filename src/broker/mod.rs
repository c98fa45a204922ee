//! Pipeline broker: the shared message channel and feedback store as one TCP service.
//!
//! Each accepted connection is served by its own task. A connection either
//! issues request/reply frames (publish, put, get, take, remove, ping) or
//! turns into a subscription after `Subscribe`. Blocking `get`/`take`
//! requests are abandoned as soon as the client closes its side.

pub mod wire;

use crate::channel::{InMemoryChannel, MessageChannel, TopicPattern};
use crate::config::BrokerConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::store::{FeedbackStore, MemoryFeedbackStore};
use bytes::Bytes;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use wire::{read_frame, write_frame, ClientFrame, ServerFrame};

#[derive(Debug, Clone)]
pub struct Broker {
    channel: Arc<InMemoryChannel>,
    store: MemoryFeedbackStore,
    max_frame_bytes: usize,
}

impl Broker {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            channel: Arc::new(InMemoryChannel::new(config.channel_capacity)),
            store: MemoryFeedbackStore::new(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    pub fn channel(&self) -> Arc<InMemoryChannel> {
        self.channel.clone()
    }

    pub fn store(&self) -> MemoryFeedbackStore {
        self.store.clone()
    }

    /// Bind `address` and start serving in the background.
    pub async fn bind(self, address: &str) -> PipelineResult<BrokerHandle> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Broker listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.serve(listener, shutdown_rx));
        Ok(BrokerHandle {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    async fn serve(self, listener: TcpListener, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Broker: connection accepted");
                        let broker = self.clone();
                        connections.spawn(async move {
                            if let Err(e) = broker.serve_connection(stream).await {
                                debug!(%peer, error = %e, "Broker: connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Broker: accept failed"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Broker: connection task panicked");
                        }
                    }
                }
            }
        }
        info!(open = connections.len(), "Broker shutting down");
        connections.shutdown().await;
    }

    async fn serve_connection(&self, stream: TcpStream) -> PipelineResult<()> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        let max = self.max_frame_bytes;
        loop {
            let frame = match read_frame::<_, ClientFrame>(&mut reader, max).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => {
                    let _ = write_frame(&mut writer, &ServerFrame::Error(e.to_string()), max).await;
                    return Err(e);
                }
            };

            let reply = match frame {
                ClientFrame::Publish { topic, payload } => {
                    if let Err(e) = self.channel.publish(&topic, Bytes::from(payload)).await {
                        warn!(%topic, error = %e, "Broker: publish dropped");
                    }
                    continue;
                }
                ClientFrame::Subscribe { pattern } => {
                    return self.serve_subscription(reader, writer, pattern.as_str().into()).await;
                }
                ClientFrame::Put { key, value } => {
                    self.store.put(&key, Bytes::from(value)).await?;
                    ServerFrame::Ack
                }
                ClientFrame::Get { key, timeout_ms } => {
                    let wait = self.store.get(&key, Duration::from_millis(timeout_ms));
                    tokio::select! {
                        result = wait => value_reply(result),
                        _ = client_closed(&mut reader) => {
                            debug!(%key, "Broker: get abandoned by client");
                            return Ok(());
                        }
                    }
                }
                ClientFrame::Take { key, timeout_ms } => {
                    let wait = self.store.take(&key, Duration::from_millis(timeout_ms));
                    let result = tokio::select! {
                        result = wait => result,
                        _ = client_closed(&mut reader) => {
                            debug!(%key, "Broker: take abandoned by client");
                            return Ok(());
                        }
                    };
                    if let Ok(value) = &result {
                        let frame = ServerFrame::Value(value.to_vec());
                        if let Err(e) = write_frame(&mut writer, &frame, max).await {
                            warn!(%key, error = %e, "Broker: take reply failed, value restored");
                            self.store.restore(&key, value.clone());
                            return Err(e);
                        }
                        continue;
                    }
                    value_reply(result)
                }
                ClientFrame::Remove { key } => {
                    if self.store.remove(&key).await? {
                        ServerFrame::Ack
                    } else {
                        ServerFrame::NotFound
                    }
                }
                ClientFrame::Ping => ServerFrame::Pong,
            };
            write_frame(&mut writer, &reply, max).await?;
        }
    }

    async fn serve_subscription(
        &self,
        mut reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
        pattern: TopicPattern,
    ) -> PipelineResult<()> {
        let max = self.max_frame_bytes;
        let mut deliveries = match self.channel.subscribe(&pattern).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                write_frame(&mut writer, &ServerFrame::Error(e.to_string()), max).await?;
                return Err(e);
            }
        };
        write_frame(&mut writer, &ServerFrame::Ack, max).await?;
        debug!(%pattern, "Broker: subscription opened");

        loop {
            tokio::select! {
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let frame = ServerFrame::Message {
                            topic: delivery.topic,
                            payload: delivery.payload.to_vec(),
                        };
                        write_frame(&mut writer, &frame, max).await?;
                    }
                    Some(Err(e)) => {
                        write_frame(&mut writer, &ServerFrame::Error(e.to_string()), max).await?;
                        return Err(e);
                    }
                    None => return Ok(()),
                },
                _ = client_closed(&mut reader) => {
                    debug!(%pattern, "Broker: subscription closed by client");
                    return Ok(());
                }
            }
        }
    }
}

fn value_reply(result: PipelineResult<Bytes>) -> ServerFrame {
    match result {
        Ok(value) => ServerFrame::Value(value.to_vec()),
        Err(PipelineError::NotFound { .. }) => ServerFrame::NotFound,
        Err(e) => ServerFrame::Error(e.to_string()),
    }
}

/// Resolves once the peer has closed its write side.
async fn client_closed(reader: &mut OwnedReadHalf) {
    let mut probe = [0u8; 1];
    match reader.peek(&mut probe).await {
        Ok(0) | Err(_) => {}
        // Unexpected extra input is left for the next frame read.
        Ok(_) => std::future::pending::<()>().await,
    }
}

/// Running broker. Dropping the handle also stops the server, without waiting for it.
#[derive(Debug)]
pub struct BrokerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl BrokerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close every connection and wait for the server task.
    pub async fn shutdown(mut self) -> PipelineResult<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        (&mut self.task)
            .await
            .map_err(|e| PipelineError::ShutdownFailed(vec![PipelineError::Io(std::io::Error::other(e))]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TcpChannel;
    use crate::store::RemoteFeedbackStore;

    async fn start_broker() -> (Broker, BrokerHandle) {
        let broker = Broker::from_config(&BrokerConfig::default());
        let handle = broker.clone().bind("127.0.0.1:0").await.unwrap();
        (broker, handle)
    }

    async fn wait_for_subscribers(broker: &Broker, n: usize) {
        while broker.channel().subscriber_count() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_tcp_subscriber_in_order() {
        let (broker, handle) = start_broker().await;
        let addr = handle.local_addr().to_string();

        let subscriber = TcpChannel::new(&addr);
        let mut sub = subscriber.subscribe(&"from-control".into()).await.unwrap();
        wait_for_subscribers(&broker, 1).await;

        let publisher = TcpChannel::new(&addr);
        for i in 0..10u8 {
            publisher.publish("from-control", Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..10u8 {
            let delivery = sub.next().await.unwrap().unwrap();
            assert_eq!(delivery.topic, "from-control");
            assert_eq!(delivery.payload, Bytes::from(vec![i]));
        }
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_store_round_trip() {
        let (_broker, handle) = start_broker().await;
        let store = RemoteFeedbackStore::new(&handle.local_addr().to_string());

        store.ping().await.unwrap();
        store.put("R1:2", Bytes::from_static(b"x=2")).await.unwrap();
        assert_eq!(
            store.get("R1:2", Duration::from_millis(100)).await.unwrap(),
            Bytes::from_static(b"x=2")
        );
        assert!(store.remove("R1:2").await.unwrap());
        assert!(!store.remove("R1:2").await.unwrap());

        let err = store.take("R1:3", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_get_woken_by_remote_put() {
        let (_broker, handle) = start_broker().await;
        let addr = handle.local_addr().to_string();
        let reader = RemoteFeedbackStore::new(&addr);
        let writer = RemoteFeedbackStore::new(&addr);

        let waiting = tokio::spawn(async move { reader.take("R1:2", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.put("R1:2", Bytes::from_static(b"next")).await.unwrap();

        assert_eq!(waiting.await.unwrap().unwrap(), Bytes::from_static(b"next"));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_remote_take_leaves_value_for_next_reader() {
        let (broker, handle) = start_broker().await;
        let store = RemoteFeedbackStore::new(&handle.local_addr().to_string());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), store.take("R1:2", Duration::from_secs(30))).await;
        assert!(abandoned.is_err());
        while broker.store().pending_waiters() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        store.put("R1:2", Bytes::from_static(b"kept")).await.unwrap();
        assert_eq!(broker.store().len(), 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscriptions() {
        let (broker, handle) = start_broker().await;
        let channel = TcpChannel::new(&handle.local_addr().to_string());
        let mut sub = channel.subscribe(&"t*".into()).await.unwrap();
        wait_for_subscribers(&broker, 1).await;

        handle.shutdown().await.unwrap();
        assert!(sub.next().await.unwrap().unwrap_err().is_transport());
    }
}
