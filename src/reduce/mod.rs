//! Reduction functions for the analysis stage.
//!
//! A [`Reducer`] turns one document, plus whatever the run has accumulated so
//! far, into at most one [`ReducedRecord`]. Reducers are called synchronously
//! from their run's lane, so they see a run's documents strictly in order and
//! never concurrently.

pub mod builtin;
pub mod registry;

pub use registry::ReducerRegistry;

use crate::document::{Document, DocumentKind, Payload, ReducedRecord};
use std::collections::BTreeMap;

/// Pluggable reduction function.
pub trait Reducer: Send + Sync {
    fn name(&self) -> &str;

    /// Reduce one document. `Ok(None)` means the document yields no record.
    fn reduce(
        &self,
        document: &Document,
        accumulator: &mut RunAccumulator,
    ) -> anyhow::Result<Option<ReducedRecord>>;
}

/// Per-run state kept by the analysis lane from the run's first document until its stop.
#[derive(Debug, Clone, Default)]
pub struct RunAccumulator {
    run_id: String,
    metadata: Payload,
    events_seen: u64,
    first_event: Option<u64>,
    totals: BTreeMap<String, (f64, u64)>,
}

impl RunAccumulator {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            ..Self::default()
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Payload of the run's start document, if one was seen
    pub fn metadata(&self) -> &Payload {
        &self.metadata
    }

    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    /// Sequence number of the run's first event
    pub fn first_event(&self) -> Option<u64> {
        self.first_event
    }

    /// Record the bookkeeping every reducer relies on. Called before `reduce`.
    pub fn observe(&mut self, document: &Document) {
        match document.kind {
            DocumentKind::Start => self.metadata = document.payload.clone(),
            DocumentKind::Event => {
                self.events_seen += 1;
                self.first_event.get_or_insert(document.sequence_number);
            }
            DocumentKind::Descriptor | DocumentKind::Stop => {}
        }
    }

    /// Add `value` to the running total of `field` and return the running mean.
    pub fn accumulate(&mut self, field: &str, value: f64) -> f64 {
        let (sum, count) = self.totals.entry(field.to_string()).or_insert((0.0, 0));
        *sum += value;
        *count += 1;
        *sum / *count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::RunComposer;

    #[test]
    fn test_accumulator_tracks_run_bookkeeping() {
        let mut run = RunComposer::with_run_id("R1");
        let mut acc = RunAccumulator::new("R1");

        acc.observe(&run.start(Payload::from([("sample".to_string(), "TiCu".into())])));
        acc.observe(&run.descriptor("primary"));
        acc.observe(&run.event(Payload::new()));
        acc.observe(&run.event(Payload::new()));

        assert_eq!(acc.metadata()["sample"].as_text(), Some("TiCu"));
        assert_eq!(acc.events_seen(), 2);
        assert_eq!(acc.first_event(), Some(3));
    }

    #[test]
    fn test_running_mean() {
        let mut acc = RunAccumulator::new("R1");
        assert_eq!(acc.accumulate("det", 2.0), 2.0);
        assert_eq!(acc.accumulate("det", 4.0), 3.0);
        assert_eq!(acc.accumulate("other", 10.0), 10.0);
    }
}
