//! Analysis relay: documents in, reduced records out.

use super::router::{RunLane, RunRouter};
use super::{spawn_relay, RelayHandle, StatusPublisher};
use crate::channel::{MessageChannel, TopicPattern};
use crate::config::PipelineConfig;
use crate::document::{
    encode, CorrelationId, Document, DocumentKind, FieldValue, Stage, StageMessage, StatusOutcome,
    StatusReport,
};
use crate::error::PipelineError;
use crate::recovery::RetryPolicy;
use crate::reduce::{Reducer, RunAccumulator};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct AnalysisRelay {
    channel: Arc<dyn MessageChannel>,
    reducer: Arc<dyn Reducer>,
    input_topic: String,
    output_topic: String,
    status: StatusPublisher,
    lane_capacity: usize,
    reconnect: RetryPolicy,
}

impl AnalysisRelay {
    pub fn new(channel: Arc<dyn MessageChannel>, reducer: Arc<dyn Reducer>, config: &PipelineConfig) -> Self {
        Self {
            status: StatusPublisher::new(channel.clone(), config.topics.status.clone()),
            channel,
            reducer,
            input_topic: config.topics.from_control.clone(),
            output_topic: config.topics.from_analysis.clone(),
            lane_capacity: config.relay.lane_capacity,
            reconnect: config.reconnect.clone(),
        }
    }

    /// Start relaying in the background.
    pub fn spawn(self) -> RelayHandle {
        info!(
            reducer = self.reducer.name(),
            input = %self.input_topic,
            output = %self.output_topic,
            "Starting analysis relay"
        );
        let channel = self.channel.clone();
        let reducer = self.reducer;
        let output_topic = self.output_topic;
        let status = self.status;
        let router = RunRouter::new(self.lane_capacity, move |run_id| AnalysisLane {
            channel: channel.clone(),
            reducer: reducer.clone(),
            output_topic: output_topic.clone(),
            status: status.clone(),
            accumulator: RunAccumulator::new(run_id),
        });
        spawn_relay(
            Stage::Analysis,
            self.channel,
            TopicPattern::exact(&self.input_topic),
            self.reconnect,
            router,
        )
    }
}

struct AnalysisLane {
    channel: Arc<dyn MessageChannel>,
    reducer: Arc<dyn Reducer>,
    output_topic: String,
    status: StatusPublisher,
    accumulator: RunAccumulator,
}

impl AnalysisLane {
    async fn publish(&self, message: &StageMessage) {
        let published = match encode(message) {
            Ok(bytes) => self.channel.publish(&self.output_topic, bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            warn!(
                stage = %Stage::Analysis,
                run_id = %message.run_id(),
                topic = %self.output_topic,
                error = %e,
                "Stage message dropped"
            );
        }
    }

    async fn reduce(&mut self, document: &Document) {
        self.accumulator.observe(document);
        match self.reducer.reduce(document, &mut self.accumulator) {
            Ok(Some(record)) => {
                let correlation_id = record.correlation_id();
                debug!(
                    stage = %Stage::Analysis,
                    run_id = %record.run_id,
                    %correlation_id,
                    "Reduced record published"
                );
                self.publish(&StageMessage::Reduced(record)).await;
                self.status
                    .report(StatusReport::new(
                        Stage::Analysis,
                        &document.run_id,
                        Some(correlation_id),
                        StatusOutcome::Written,
                    ))
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                let failure = PipelineError::ReductionFailure {
                    run_id: document.run_id.clone(),
                    sequence_number: document.sequence_number,
                    reason: format!("{:#}", e),
                };
                error!(
                    stage = %Stage::Analysis,
                    run_id = %document.run_id,
                    sequence_number = document.sequence_number,
                    reducer = self.reducer.name(),
                    "{}",
                    failure
                );
                self.status
                    .report(StatusReport::new(
                        Stage::Analysis,
                        &document.run_id,
                        Some(CorrelationId::for_document(document)),
                        StatusOutcome::Failed {
                            reason: failure.to_string(),
                        },
                    ))
                    .await;
            }
        }
    }
}

#[async_trait]
impl RunLane for AnalysisLane {
    type Message = Document;

    async fn handle(&mut self, document: Document) {
        if document.kind == DocumentKind::Start {
            self.publish(&StageMessage::RunStarted {
                run_id: document.run_id.clone(),
                metadata: document.payload.clone(),
            })
            .await;
        }

        self.reduce(&document).await;

        if document.is_terminal() {
            let exit_status = document
                .payload
                .get("exit_status")
                .and_then(FieldValue::as_text)
                .unwrap_or("success")
                .to_string();
            info!(
                stage = %Stage::Analysis,
                run_id = %document.run_id,
                events = self.accumulator.events_seen(),
                %exit_status,
                "Run complete"
            );
            self.publish(&StageMessage::RunStopped {
                run_id: document.run_id.clone(),
                exit_status,
            })
            .await;
        }
    }
}
