//! Status topic watcher for the control process.
//!
//! Relays report every failed message on the status topic. The board keeps
//! those reports per correlation id so a retrieval that times out can be
//! classified as lost rather than slow.

use crate::channel::{follow, MessageChannel, TopicPattern};
use crate::document::{decode, CorrelationId, Stage, StatusOutcome, StatusReport};
use crate::error::{PipelineError, PipelineResult};
use crate::recovery::RetryPolicy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Failures reported by the relays, keyed by correlation id
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    failures: Arc<RwLock<HashMap<CorrelationId, (Stage, String)>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one report into the board.
    ///
    /// The adaptive stage releasing a run clears that run's entries.
    pub fn record(&self, report: &StatusReport) {
        match (&report.outcome, &report.correlation_id) {
            (StatusOutcome::Failed { reason }, Some(id)) => {
                warn!(stage = %report.stage, run_id = %report.run_id, correlation_id = %id, %reason, "Stage reported lost feedback");
                self.failures.write().insert(id.clone(), (report.stage, reason.clone()));
            }
            (StatusOutcome::Released { .. }, _) if report.stage == Stage::Adaptive => {
                let prefix = format!("{}:", report.run_id);
                self.failures
                    .write()
                    .retain(|id, _| !id.as_str().starts_with(&prefix));
            }
            _ => {}
        }
    }

    /// Stage and reason of a reported failure for `correlation_id`
    pub fn failure_for(&self, correlation_id: &CorrelationId) -> Option<(Stage, String)> {
        self.failures.read().get(correlation_id).cloned()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.read().len()
    }

    /// Keep the board current from `topic` until the returned handle is shut down.
    ///
    /// Lost subscriptions are re-established with `policy`.
    pub fn watch(&self, channel: Arc<dyn MessageChannel>, topic: &str, policy: RetryPolicy) -> StatusWatch {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(watch_status(
            self.clone(),
            channel,
            TopicPattern::exact(topic),
            policy,
            shutdown_rx,
        ));
        StatusWatch {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running status watcher
#[derive(Debug)]
pub struct StatusWatch {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<PipelineResult<()>>,
}

impl StatusWatch {
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

async fn watch_status(
    board: StatusBoard,
    channel: Arc<dyn MessageChannel>,
    pattern: TopicPattern,
    policy: RetryPolicy,
    shutdown_rx: oneshot::Receiver<()>,
) -> PipelineResult<()> {
    info!(%pattern, "Watching status reports");
    let shutdown = async {
        let _ = shutdown_rx.await;
    };
    let watched = follow(&*channel, &pattern, &policy, shutdown, |delivery| {
        match decode::<StatusReport>(&delivery.payload) {
            Ok(report) => board.record(&report),
            Err(e) => debug!(error = %e, "Skipping undecodable status report"),
        }
    })
    .await;
    if let Err(e) = &watched {
        warn!(%pattern, error = %e, "Status watcher giving up");
    }
    watched
}
