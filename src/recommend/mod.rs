//! Recommendation functions for the adaptive stage.
//!
//! A [`Recommender`] looks at every reduced record of a run seen so far and
//! proposes the next point to measure, or declares the run finished.

pub mod registry;
pub mod step;

pub use registry::RecommenderRegistry;
pub use step::{MaxCount, StepConfig, StepRecommender};

use crate::document::{Payload, Point, ReducedRecord};

/// What a recommender wants the plan to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    Next(Point),
    /// No further points; the plan should stop asking.
    Finished,
}

/// Pluggable recommendation function.
pub trait Recommender: Send + Sync {
    fn name(&self) -> &str;

    /// `history` holds the run's records in arrival order, newest last; never empty.
    fn recommend(&self, history: &[ReducedRecord], state: &mut RecommenderState) -> anyhow::Result<Proposal>;
}

/// Per-run scratch state owned by the adaptive lane.
#[derive(Debug, Clone, Default)]
pub struct RecommenderState {
    pub run_id: String,
    /// Start metadata relayed by the analysis stage
    pub metadata: Payload,
    /// Proposals made so far in this run
    pub proposals: u64,
    pub last_point: Option<Point>,
}

impl RecommenderState {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            ..Self::default()
        }
    }

    /// Record a proposal that was handed to the store.
    pub fn note(&mut self, proposal: &Proposal) {
        self.proposals += 1;
        if let Proposal::Next(point) = proposal {
            self.last_point = Some(point.clone());
        }
    }
}
