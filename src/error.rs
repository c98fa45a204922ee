//! Custom error types for the pipeline.
//!
//! `PipelineError` is the one error type shared by every stage. Its variants map
//! onto the failure taxonomy of the relay contract:
//!
//! - **`ChannelUnavailable`**: the transport (message channel or the broker hosting
//!   the feedback store) is unreachable. Fatal to the current operation of the
//!   affected component only; relays answer it with reconnect-with-backoff.
//! - **`ReductionFailure`** / **`RecommendationFailure`**: a pluggable function failed
//!   for one message. These never escape a relay's message loop; they are logged
//!   and reported on the status topic.
//! - **`NotFound`**: a feedback-store wait elapsed without a value. Expected and
//!   recoverable; the control side applies its explicit fallback policy.
//! - **`FeedbackLost`**: like `NotFound`, but a stage has reported that the value
//!   will never be written.
//!
//! Remaining variants cover configuration, codec and I/O plumbing.

use crate::config::ConfigError;
use crate::document::Stage;
use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("No value for key '{key}'")]
    NotFound { key: String },

    #[error("Feedback for '{correlation_id}' lost in {stage} stage: {reason}")]
    FeedbackLost {
        correlation_id: String,
        stage: Stage,
        reason: String,
    },

    #[error("Reduction failed for run {run_id} document {sequence_number}: {reason}")]
    ReductionFailure {
        run_id: String,
        sequence_number: u64,
        reason: String,
    },

    #[error("Recommendation failed for run {run_id} ({correlation_id}): {reason}")]
    RecommendationFailure {
        run_id: String,
        correlation_id: String,
        reason: String,
    },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Plan aborted for run {run_id}: {reason}")]
    PlanAborted { run_id: String, reason: String },

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<PipelineError>),
}

impl PipelineError {
    /// Whether this error means the transport is down and a reconnect is due.
    pub fn is_transport(&self) -> bool {
        matches!(self, PipelineError::ChannelUnavailable(_))
    }

    /// Whether a feedback retrieval came back empty, slow or lost.
    pub fn is_missing_feedback(&self) -> bool {
        matches!(
            self,
            PipelineError::NotFound { .. } | PipelineError::FeedbackLost { .. }
        )
    }
}

impl From<bincode::Error> for PipelineError {
    fn from(err: bincode::Error) -> Self {
        PipelineError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Codec(err.to_string())
    }
}
