//! Control process side of the pipeline.
//!
//! The running plan talks to the adaptive stage only through a
//! [`RecommenderLink`]: documents go out with `submit`, recommendations come
//! back with `retrieve`. [`ControlAdapter`] binds the link to a message channel
//! (outbound) and a feedback store (return path).
//!
//! What happens when a recommendation does not arrive is never guessed:
//! [`resolve_next_point`] applies the configured retries and the explicit
//! [`FallbackPolicy`].

pub mod plan;
pub mod sim;
pub mod status;

pub use plan::{AdaptivePlan, Measure, PlanEnd, PlanSummary};
pub use sim::SyntheticDetector;
pub use status::{StatusBoard, StatusWatch};

use crate::channel::MessageChannel;
use crate::config::{ControlConfig, PipelineConfig};
use crate::document::{decode, encode, CorrelationId, Document, Point, Recommendation};
use crate::error::{PipelineError, PipelineResult};
use crate::store::FeedbackStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the plan does when no recommendation arrives in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Measure the previous point again
    ReusePrevious,
    /// Close the run as aborted and fail the plan
    Abort,
}

/// Capability the plan uses to reach the adaptive stage.
#[async_trait]
pub trait RecommenderLink: Send + Sync {
    /// Publish a document. Never waits for downstream consumers.
    async fn submit(&self, document: &Document) -> PipelineResult<()>;

    /// Wait up to `timeout` for the recommendation stored under `correlation_id`.
    ///
    /// Returns `NotFound` when the wait elapses, or `FeedbackLost` when a
    /// stage has reported that the recommendation will never be written.
    /// Dropping the future abandons the wait without consuming anything.
    async fn retrieve(&self, correlation_id: &CorrelationId, timeout: Duration) -> PipelineResult<Recommendation>;
}

/// [`RecommenderLink`] over a message channel and a feedback store.
pub struct ControlAdapter {
    channel: Arc<dyn MessageChannel>,
    store: Arc<dyn FeedbackStore>,
    topic: String,
    status: Option<StatusBoard>,
}

impl ControlAdapter {
    pub fn new(channel: Arc<dyn MessageChannel>, store: Arc<dyn FeedbackStore>, topic: &str) -> Self {
        Self {
            channel,
            store,
            topic: topic.to_string(),
            status: None,
        }
    }

    /// Adapter publishing on the configured `from_control` topic
    pub fn from_config(
        channel: Arc<dyn MessageChannel>,
        store: Arc<dyn FeedbackStore>,
        config: &PipelineConfig,
    ) -> Self {
        Self::new(channel, store, &config.topics.from_control)
    }

    /// Consult `board` to tell lost recommendations from slow ones.
    pub fn with_status_board(mut self, board: StatusBoard) -> Self {
        self.status = Some(board);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl RecommenderLink for ControlAdapter {
    async fn submit(&self, document: &Document) -> PipelineResult<()> {
        let bytes = encode(document)?;
        self.channel.publish(&self.topic, bytes).await?;
        debug!(
            run_id = %document.run_id,
            sequence_number = document.sequence_number,
            kind = %document.kind,
            topic = %self.topic,
            "Document submitted"
        );
        Ok(())
    }

    async fn retrieve(&self, correlation_id: &CorrelationId, timeout: Duration) -> PipelineResult<Recommendation> {
        match self.store.take(correlation_id.as_str(), timeout).await {
            Ok(bytes) => decode(&bytes),
            Err(PipelineError::NotFound { key }) => {
                let lost = self
                    .status
                    .as_ref()
                    .and_then(|board| board.failure_for(correlation_id));
                match lost {
                    Some((stage, reason)) => Err(PipelineError::FeedbackLost {
                        correlation_id: key,
                        stage,
                        reason,
                    }),
                    None => Err(PipelineError::NotFound { key }),
                }
            }
            Err(e) => Err(e),
        }
    }
}

/// Outcome of asking for the point after a measurement
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The adaptive stage proposed this point
    Recommended(Point),
    /// Nothing arrived; the fallback policy repeats the previous point
    Reused(Point),
    /// The adaptive stage asked the plan to end
    Finished,
}

/// Retrieve the recommendation answering `correlation_id` and apply the fallback policy.
///
/// A missing value is waited for again up to `retrieval_retries` times while it
/// is merely slow. Lost feedback goes straight to the fallback. Transport
/// failures are returned as is.
pub async fn resolve_next_point(
    link: &dyn RecommenderLink,
    run_id: &str,
    correlation_id: &CorrelationId,
    previous: &Point,
    config: &ControlConfig,
) -> PipelineResult<Resolution> {
    let mut attempt = 0;
    let missing = loop {
        match link.retrieve(correlation_id, config.feedback_timeout).await {
            Ok(recommendation) => {
                return Ok(match recommendation.proposed_point {
                    Some(point) => Resolution::Recommended(point),
                    None => Resolution::Finished,
                });
            }
            Err(PipelineError::NotFound { .. }) if attempt < config.retrieval_retries => {
                attempt += 1;
                info!(%run_id, %correlation_id, attempt, "Recommendation is slow, waiting again");
            }
            Err(e) if e.is_missing_feedback() => break e,
            Err(e) => return Err(e),
        }
    };

    match config.fallback {
        FallbackPolicy::ReusePrevious => {
            warn!(%run_id, %correlation_id, error = %missing, "No recommendation, reusing previous point");
            Ok(Resolution::Reused(previous.clone()))
        }
        FallbackPolicy::Abort => {
            warn!(%run_id, %correlation_id, error = %missing, "No recommendation, aborting plan");
            Err(PipelineError::PlanAborted {
                run_id: run_id.to_string(),
                reason: missing.to_string(),
            })
        }
    }
}
