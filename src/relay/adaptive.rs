//! Adaptive relay: reduced records in, recommendations into the feedback store.
//!
//! Each run's records are kept in order from its first message until its
//! `RunStopped` marker, and handed in full to the recommender on every new
//! record. The resulting recommendation is stored under the record's
//! correlation id. When the recommender fails nothing is stored, so the
//! control side's retrieval times out; the failure is logged and reported.
//!
//! The control side submits a run's stop document only after its last
//! retrieval, so on `RunStopped` every recommendation of the run that is
//! still in the store has been abandoned and is removed.

use super::router::{RunLane, RunRouter};
use super::{spawn_relay, RelayHandle, StatusPublisher};
use crate::channel::{MessageChannel, TopicPattern};
use crate::config::PipelineConfig;
use crate::document::{
    encode, CorrelationId, Recommendation, ReducedRecord, Stage, StageMessage, StatusOutcome, StatusReport,
};
use crate::error::PipelineError;
use crate::recommend::{Proposal, Recommender, RecommenderState};
use crate::recovery::RetryPolicy;
use crate::store::FeedbackStore;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct AdaptiveRelay {
    channel: Arc<dyn MessageChannel>,
    store: Arc<dyn FeedbackStore>,
    recommender: Arc<dyn Recommender>,
    input_topic: String,
    status: StatusPublisher,
    lane_capacity: usize,
    reconnect: RetryPolicy,
}

impl AdaptiveRelay {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        store: Arc<dyn FeedbackStore>,
        recommender: Arc<dyn Recommender>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            status: StatusPublisher::new(channel.clone(), config.topics.status.clone()),
            channel,
            store,
            recommender,
            input_topic: config.topics.from_analysis.clone(),
            lane_capacity: config.relay.lane_capacity,
            reconnect: config.reconnect.clone(),
        }
    }

    /// Start relaying in the background.
    pub fn spawn(self) -> RelayHandle {
        info!(
            recommender = self.recommender.name(),
            input = %self.input_topic,
            "Starting adaptive relay"
        );
        let store = self.store;
        let recommender = self.recommender;
        let status = self.status;
        let router = RunRouter::new(self.lane_capacity, move |run_id| {
            AdaptiveLane::new(run_id, store.clone(), recommender.clone(), status.clone())
        });
        spawn_relay(
            Stage::Adaptive,
            self.channel,
            TopicPattern::exact(&self.input_topic),
            self.reconnect,
            router,
        )
    }
}

pub(crate) struct AdaptiveLane {
    store: Arc<dyn FeedbackStore>,
    recommender: Arc<dyn Recommender>,
    status: StatusPublisher,
    history: Vec<ReducedRecord>,
    state: RecommenderState,
    written: BTreeSet<CorrelationId>,
}

impl AdaptiveLane {
    pub(crate) fn new(
        run_id: &str,
        store: Arc<dyn FeedbackStore>,
        recommender: Arc<dyn Recommender>,
        status: StatusPublisher,
    ) -> Self {
        Self {
            store,
            recommender,
            status,
            history: Vec::new(),
            state: RecommenderState::new(run_id),
            written: BTreeSet::new(),
        }
    }

    /// Records currently buffered for the run
    pub(crate) fn buffered(&self) -> usize {
        self.history.len()
    }

    /// Remove every recommendation of the run still left in the store.
    async fn release_feedback(&mut self) -> usize {
        let mut removed = 0;
        for correlation_id in std::mem::take(&mut self.written) {
            match self.store.remove(correlation_id.as_str()).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    stage = %Stage::Adaptive,
                    run_id = %self.state.run_id,
                    %correlation_id,
                    error = %e,
                    "Stale recommendation not removed"
                ),
            }
        }
        removed
    }

    async fn report(&self, correlation_id: Option<CorrelationId>, outcome: StatusOutcome) {
        self.status
            .report(StatusReport::new(Stage::Adaptive, &self.state.run_id, correlation_id, outcome))
            .await;
    }

    async fn fail(&self, failure: PipelineError, correlation_id: &CorrelationId) {
        error!(
            stage = %Stage::Adaptive,
            run_id = %self.state.run_id,
            %correlation_id,
            recommender = self.recommender.name(),
            "{}",
            failure
        );
        self.report(
            Some(correlation_id.clone()),
            StatusOutcome::Failed {
                reason: failure.to_string(),
            },
        )
        .await;
    }

    async fn recommend(&mut self, record: ReducedRecord) {
        let correlation_id = record.correlation_id();
        self.history.push(record);

        let proposal = match self.recommender.recommend(&self.history, &mut self.state) {
            Ok(proposal) => proposal,
            Err(e) => {
                let failure = PipelineError::RecommendationFailure {
                    run_id: self.state.run_id.clone(),
                    correlation_id: correlation_id.to_string(),
                    reason: format!("{:#}", e),
                };
                self.fail(failure, &correlation_id).await;
                return;
            }
        };

        let run_id = self.state.run_id.clone();
        let recommendation = match &proposal {
            Proposal::Next(point) => Recommendation::next_point(&run_id, correlation_id.clone(), point.clone()),
            Proposal::Finished => Recommendation::finished(&run_id, correlation_id.clone()),
        };
        let stored = match encode(&recommendation) {
            Ok(bytes) => self.store.put(correlation_id.as_str(), bytes).await,
            Err(e) => Err(e),
        };
        match stored {
            Ok(()) => {
                self.written.insert(correlation_id.clone());
                self.state.note(&proposal);
                info!(
                    stage = %Stage::Adaptive,
                    %run_id,
                    %correlation_id,
                    point = ?recommendation.proposed_point,
                    "Recommendation stored"
                );
                self.report(Some(correlation_id), StatusOutcome::Written).await;
            }
            Err(e) => self.fail(e, &correlation_id).await,
        }
    }
}

#[async_trait]
impl RunLane for AdaptiveLane {
    type Message = StageMessage;

    async fn handle(&mut self, message: StageMessage) {
        match message {
            StageMessage::RunStarted { metadata, .. } => {
                debug!(stage = %Stage::Adaptive, run_id = %self.state.run_id, "Run started");
                self.state.metadata = metadata;
            }
            StageMessage::Reduced(record) => self.recommend(record).await,
            StageMessage::RunStopped { exit_status, .. } => {
                let records = std::mem::take(&mut self.history).len();
                let untaken = self.release_feedback().await;
                info!(
                    stage = %Stage::Adaptive,
                    run_id = %self.state.run_id,
                    records,
                    proposals = self.state.proposals,
                    untaken,
                    %exit_status,
                    "Run released"
                );
                self.report(None, StatusOutcome::Released { records }).await;
            }
        }
    }
}
