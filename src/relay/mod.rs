//! Relays: subscribe on one topic, transform per run, republish or store.
//!
//! Both relays share the same outer loop:
//!
//! ```text
//! Connecting --subscribed--> Listening --stream lost--> Backoff --delay--> Connecting
//!      \------subscribe failed----------------------------^
//! ```
//!
//! Transport failures never end the loop (unless the reconnect policy caps
//! attempts); they only trigger a fresh subscription after a backoff delay.
//! Messages are decoded and handed to a [`RunRouter`]; everything that can go
//! wrong with a single message is handled inside its run lane.

pub mod adaptive;
pub mod analysis;
pub mod router;

pub use adaptive::AdaptiveRelay;
pub use analysis::AnalysisRelay;
pub use router::{Routed, RunLane, RunRouter};

use crate::channel::{MessageChannel, TopicPattern};
use crate::document::{decode, encode, Stage, StatusReport};
use crate::error::{PipelineError, PipelineResult};
use crate::recovery::RetryPolicy;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection state of a relay's subscription loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Listening,
    Backoff { attempt: u32, delay: Duration },
    Stopped,
}

/// Handle to a spawned relay.
///
/// Dropping the handle stops the relay as if [`shutdown`](Self::shutdown) was called.
#[derive(Debug)]
pub struct RelayHandle {
    stage: Stage,
    state: watch::Receiver<RelayState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<PipelineResult<()>>,
}

impl RelayHandle {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn state(&self) -> RelayState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<RelayState> {
        self.state.clone()
    }

    /// Wait until the relay reaches a state matching `predicate`.
    pub async fn wait_for_state(&mut self, predicate: impl FnMut(&RelayState) -> bool) -> RelayState {
        match self.state.wait_for(predicate).await {
            Ok(state) => state.clone(),
            Err(_) => RelayState::Stopped,
        }
    }

    /// Stop the subscription loop, finish in-flight run lanes and wait for the relay task.
    pub async fn shutdown(mut self) -> PipelineResult<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::ShutdownFailed(vec![PipelineError::Io(
                std::io::Error::other(e),
            )])),
        }
    }
}

/// Publishes status reports when a status topic is configured.
#[derive(Clone)]
pub struct StatusPublisher {
    channel: Arc<dyn MessageChannel>,
    topic: Option<String>,
}

impl StatusPublisher {
    pub fn new(channel: Arc<dyn MessageChannel>, topic: Option<String>) -> Self {
        Self { channel, topic }
    }

    pub async fn report(&self, report: StatusReport) {
        let Some(topic) = &self.topic else {
            return;
        };
        let published = match encode(&report) {
            Ok(bytes) => self.channel.publish(topic, bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            warn!(%topic, run_id = %report.run_id, error = %e, "Status report dropped");
        }
    }
}

/// Spawn the subscription loop that feeds `router` from `pattern`.
pub(crate) fn spawn_relay<L>(
    stage: Stage,
    channel: Arc<dyn MessageChannel>,
    pattern: TopicPattern,
    policy: RetryPolicy,
    router: RunRouter<L>,
) -> RelayHandle
where
    L: RunLane,
    L::Message: DeserializeOwned,
{
    let (state_tx, state) = watch::channel(RelayState::Connecting);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(run_relay(stage, channel, pattern, policy, router, state_tx, shutdown_rx));
    RelayHandle {
        stage,
        state,
        shutdown_tx: Some(shutdown_tx),
        task,
    }
}

async fn run_relay<L>(
    stage: Stage,
    channel: Arc<dyn MessageChannel>,
    pattern: TopicPattern,
    policy: RetryPolicy,
    mut router: RunRouter<L>,
    state_tx: watch::Sender<RelayState>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> PipelineResult<()>
where
    L: RunLane,
    L::Message: DeserializeOwned,
{
    let mut backoff = policy.backoff();
    let outcome = 'relay: loop {
        state_tx.send_replace(RelayState::Connecting);
        let subscribed = tokio::select! {
            _ = &mut shutdown_rx => break 'relay Ok(()),
            subscribed = channel.subscribe(&pattern) => subscribed,
        };

        let failure = match subscribed {
            Ok(mut stream) => {
                backoff.reset();
                state_tx.send_replace(RelayState::Listening);
                info!(%stage, %pattern, "Relay listening");
                loop {
                    let next = tokio::select! {
                        _ = &mut shutdown_rx => break 'relay Ok(()),
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(delivery)) => match decode::<L::Message>(&delivery.payload) {
                            Ok(message) => {
                                router.route(message);
                            }
                            Err(e) => warn!(
                                %stage,
                                topic = %delivery.topic,
                                error = %e,
                                "Skipping undecodable message"
                            ),
                        },
                        Some(Err(e)) => break e,
                        None => {
                            break PipelineError::ChannelUnavailable("subscription ended".into())
                        }
                    }
                }
            }
            Err(e) => e,
        };

        if !failure.is_transport() {
            error!(%stage, error = %failure, "Relay stopped by non-transport failure");
            break 'relay Err(failure);
        }
        let Some(delay) = backoff.next_delay() else {
            error!(%stage, attempts = backoff.attempt(), error = %failure, "Reconnect attempts exhausted");
            break 'relay Err(failure);
        };
        warn!(%stage, attempt = backoff.attempt(), ?delay, error = %failure, "Channel unavailable, backing off");
        state_tx.send_replace(RelayState::Backoff {
            attempt: backoff.attempt(),
            delay,
        });
        tokio::select! {
            _ = &mut shutdown_rx => break 'relay Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    };

    debug!(%stage, active_runs = router.active_runs(), "Relay draining run lanes");
    router.drain().await;
    state_tx.send_replace(RelayState::Stopped);
    info!(%stage, "Relay stopped");
    outcome
}
