use super::{Proposal, Recommender, RecommenderState};
use crate::document::{Point, ReducedRecord};
use anyhow::{anyhow, ensure, Result};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    /// Increment applied to the independent axis
    pub step: f64,
    #[serde(default = "default_independent")]
    pub independent: String,
    #[serde(default = "default_dependent")]
    pub dependent: String,
    /// Finish instead of proposing a point past this value.
    #[serde(default)]
    pub limit: Option<f64>,
}

fn default_independent() -> String {
    "motor".to_string()
}

fn default_dependent() -> String {
    "det".to_string()
}

/// Advances one axis by a fixed step from the last measured position.
#[derive(Debug, Clone)]
pub struct StepRecommender {
    config: StepConfig,
}

impl StepRecommender {
    pub fn new(config: StepConfig) -> Result<Self> {
        ensure!(config.step.is_finite() && config.step != 0.0, "step must be finite and non-zero");
        Ok(Self { config })
    }
}

impl Recommender for StepRecommender {
    fn name(&self) -> &str {
        "step"
    }

    fn recommend(&self, history: &[ReducedRecord], _: &mut RecommenderState) -> Result<Proposal> {
        let latest = history.last().ok_or_else(|| anyhow!("no records to recommend from"))?;
        let position = latest
            .number(&self.config.independent)
            .ok_or_else(|| anyhow!("record has no independent field '{}'", self.config.independent))?;
        ensure!(
            latest.number(&self.config.dependent).is_some(),
            "record has no dependent field '{}'",
            self.config.dependent
        );

        let next = position + self.config.step;
        if let Some(limit) = self.config.limit {
            let past = if self.config.step > 0.0 { next > limit } else { next < limit };
            if past {
                return Ok(Proposal::Finished);
            }
        }
        Ok(Proposal::Next(Point::from([(self.config.independent.clone(), next)])))
    }
}

/// Finishes the run once it has produced `max_count` records; otherwise defers.
pub struct MaxCount {
    inner: Arc<dyn Recommender>,
    max_count: usize,
}

impl MaxCount {
    pub fn new(inner: Arc<dyn Recommender>, max_count: usize) -> Self {
        Self { inner, max_count }
    }
}

impl Recommender for MaxCount {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn recommend(&self, history: &[ReducedRecord], state: &mut RecommenderState) -> Result<Proposal> {
        if history.len() >= self.max_count {
            return Ok(Proposal::Finished);
        }
        self.inner.recommend(history, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SequenceRange;

    fn record(seq: u64, motor: f64) -> ReducedRecord {
        ReducedRecord::new("R1", SequenceRange::single(seq))
            .with_field("motor", motor)
            .with_field("det", motor * 2.0)
    }

    fn step(step: f64, limit: Option<f64>) -> StepRecommender {
        StepRecommender::new(StepConfig {
            step,
            independent: "motor".into(),
            dependent: "det".into(),
            limit,
        })
        .unwrap()
    }

    #[test]
    fn test_step_advances_from_latest_record() {
        let rec = step(1.5, None);
        let mut state = RecommenderState::new("R1");
        let proposal = rec.recommend(&[record(2, 0.0), record(3, 1.5)], &mut state).unwrap();
        assert_eq!(proposal, Proposal::Next(Point::from([("motor".to_string(), 3.0)])));
    }

    #[test]
    fn test_step_finishes_past_limit() {
        let rec = step(1.5, Some(2.0));
        let mut state = RecommenderState::new("R1");
        assert_eq!(
            rec.recommend(&[record(2, 1.0)], &mut state).unwrap(),
            Proposal::Finished
        );

        let down = step(-1.0, Some(0.0));
        assert!(matches!(down.recommend(&[record(2, 0.5)], &mut state).unwrap(), Proposal::Finished));
    }

    #[test]
    fn test_step_needs_both_fields() {
        let rec = step(1.0, None);
        let mut state = RecommenderState::new("R1");
        let missing = ReducedRecord::new("R1", SequenceRange::single(2)).with_field("motor", 1.0);
        assert!(rec.recommend(&[missing], &mut state).is_err());
        assert!(rec.recommend(&[], &mut state).is_err());
    }

    #[test]
    fn test_zero_step_rejected() {
        assert!(StepRecommender::new(StepConfig {
            step: 0.0,
            independent: "motor".into(),
            dependent: "det".into(),
            limit: None,
        })
        .is_err());
    }

    #[test]
    fn test_max_count_poisons_run() {
        let rec = MaxCount::new(Arc::new(step(1.0, None)), 2);
        let mut state = RecommenderState::new("R1");
        let history = vec![record(2, 0.0), record(3, 1.0)];

        assert!(matches!(rec.recommend(&history[..1], &mut state).unwrap(), Proposal::Next(_)));
        assert_eq!(rec.recommend(&history, &mut state).unwrap(), Proposal::Finished);
    }
}
