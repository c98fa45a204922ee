//! Adaptive plan driver.
//!
//! One plan is one run:
//!
//! ```text
//! start, descriptor("primary")
//! loop:
//!     measure(point)   -> event N          (submitted)
//!     retrieve("{run_id}:{N}")            -> next point | reuse | finished
//! stop(exit_status)
//! ```
//!
//! The stop document is submitted however the loop ends, so downstream stages
//! always release the run.

use super::{resolve_next_point, RecommenderLink, Resolution};
use crate::config::ControlConfig;
use crate::document::{new_uid, CorrelationId, ExitStatus, FieldValue, Payload, Point, RunComposer};
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Moves to a point and reads the detectors.
#[async_trait]
pub trait Measure: Send {
    /// The returned payload should carry the axis readbacks next to the detector values.
    async fn measure(&mut self, point: &Point) -> anyhow::Result<Payload>;
}

/// Why a plan stopped asking for points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanEnd {
    /// The adaptive stage returned no further point
    Finished,
    /// `max_batches` measurements were taken
    MaxBatches,
    /// The cancel signal fired
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanSummary {
    pub run_id: String,
    /// Measurements taken
    pub batches: u32,
    /// Batches that repeated a point because no recommendation arrived
    pub reused: u32,
    /// Last point measured
    pub last_point: Point,
    pub end: PlanEnd,
}

pub struct AdaptivePlan {
    link: Arc<dyn RecommenderLink>,
    config: ControlConfig,
    metadata: Payload,
    run_id: Option<String>,
    cancel: Option<watch::Receiver<bool>>,
}

impl AdaptivePlan {
    pub fn new(link: Arc<dyn RecommenderLink>, config: ControlConfig) -> Self {
        Self {
            link,
            config,
            metadata: Payload::new(),
            run_id: None,
            cancel: None,
        }
    }

    /// Extra start-document metadata
    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Use a fixed run id instead of a fresh one.
    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    /// Stop the plan once `cancel` turns `true`.
    ///
    /// A pending retrieval is abandoned; nothing is consumed from the store.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run the plan to completion.
    ///
    /// Returns `PlanAborted` when the `abort` fallback fires or a measurement
    /// fails; transport errors are returned as they occur.
    pub async fn run(&self, measure: &mut dyn Measure) -> PipelineResult<PlanSummary> {
        let mut run = match &self.run_id {
            Some(run_id) => RunComposer::with_run_id(run_id),
            None => RunComposer::new(),
        };
        let run_id = run.run_id().to_string();
        let mut cancel = self.cancel.clone();

        let mut metadata = self.metadata.clone();
        metadata.insert("plan_name".into(), "adaptive_plan".into());
        metadata.insert("batch_id".into(), FieldValue::Text(new_uid()));
        self.link.submit(&run.start(metadata)).await?;
        self.link.submit(&run.descriptor("primary")).await?;
        info!(%run_id, first_point = ?self.config.first_point, "Adaptive plan started");

        let outcome = self.batches(&mut run, measure, &mut cancel).await;

        let exit_status = match &outcome {
            Ok(summary) if summary.end == PlanEnd::Cancelled => ExitStatus::Abort,
            Ok(_) => ExitStatus::Success,
            Err(PipelineError::PlanAborted { .. }) => ExitStatus::Abort,
            Err(_) => ExitStatus::Fail,
        };
        let stop = run.stop(exit_status);
        match outcome {
            Ok(summary) => {
                self.link.submit(&stop).await?;
                info!(
                    %run_id,
                    batches = summary.batches,
                    reused = summary.reused,
                    end = ?summary.end,
                    "Adaptive plan complete"
                );
                Ok(summary)
            }
            Err(e) => {
                if let Err(stop_err) = self.link.submit(&stop).await {
                    warn!(%run_id, error = %stop_err, "Could not close run");
                }
                Err(e)
            }
        }
    }

    async fn batches(
        &self,
        run: &mut RunComposer,
        measure: &mut dyn Measure,
        cancel: &mut Option<watch::Receiver<bool>>,
    ) -> PipelineResult<PlanSummary> {
        let run_id = run.run_id().to_string();
        let mut point = self.config.first_point.clone();
        let mut summary = PlanSummary {
            run_id: run_id.clone(),
            batches: 0,
            reused: 0,
            last_point: point.clone(),
            end: PlanEnd::Finished,
        };

        loop {
            let measured = tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    summary.end = PlanEnd::Cancelled;
                    return Ok(summary);
                }
                measured = measure.measure(&point) => measured,
            };
            let mut data = measured.map_err(|e| PipelineError::PlanAborted {
                run_id: run_id.clone(),
                reason: format!("measurement at {:?} failed: {:#}", point, e),
            })?;
            data.insert("batch_count".into(), f64::from(summary.batches).into());

            let event = run.event(data);
            let correlation_id = CorrelationId::for_document(&event);
            self.link.submit(&event).await?;
            summary.batches += 1;
            summary.last_point = point.clone();

            if self.config.max_batches.is_some_and(|max| summary.batches >= max) {
                summary.end = PlanEnd::MaxBatches;
                return Ok(summary);
            }

            let resolution = tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    summary.end = PlanEnd::Cancelled;
                    return Ok(summary);
                }
                resolved = resolve_next_point(self.link.as_ref(), &run_id, &correlation_id, &point, &self.config) => resolved?,
            };
            match resolution {
                Resolution::Recommended(next) => point = next,
                Resolution::Reused(_) => summary.reused += 1,
                Resolution::Finished => {
                    summary.end = PlanEnd::Finished;
                    return Ok(summary);
                }
            }
        }
    }
}

/// Resolves once `cancel` reads `true`; never without a receiver or after the sender is gone.
async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = cancel {
        if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::FallbackPolicy;
    use crate::document::{Document, DocumentKind, Recommendation};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Answers retrievals from a script; `None` entries time out.
    #[derive(Default)]
    struct ScriptedLink {
        submitted: Mutex<Vec<Document>>,
        answers: Mutex<VecDeque<Option<Option<Point>>>>,
        asked: Mutex<Vec<CorrelationId>>,
    }

    impl ScriptedLink {
        fn new(answers: Vec<Option<Option<Point>>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                ..Self::default()
            })
        }

        fn kinds(&self) -> Vec<DocumentKind> {
            self.submitted.lock().iter().map(|d| d.kind).collect()
        }

        fn exit_status(&self) -> String {
            let submitted = self.submitted.lock();
            let stop = submitted.last().unwrap();
            assert!(stop.is_terminal());
            stop.payload.get("exit_status").and_then(FieldValue::as_text).unwrap().to_string()
        }
    }

    #[async_trait]
    impl RecommenderLink for ScriptedLink {
        async fn submit(&self, document: &Document) -> PipelineResult<()> {
            self.submitted.lock().push(document.clone());
            Ok(())
        }

        async fn retrieve(&self, correlation_id: &CorrelationId, timeout: Duration) -> PipelineResult<Recommendation> {
            self.asked.lock().push(correlation_id.clone());
            let answer = self.answers.lock().pop_front().flatten();
            match answer {
                Some(Some(point)) => Ok(Recommendation::next_point("R1", correlation_id.clone(), point)),
                Some(None) => Ok(Recommendation::finished("R1", correlation_id.clone())),
                None => {
                    tokio::time::sleep(timeout).await;
                    Err(PipelineError::NotFound {
                        key: correlation_id.to_string(),
                    })
                }
            }
        }
    }

    /// Echoes the point as readback with a constant detector value.
    struct Echo;

    #[async_trait]
    impl Measure for Echo {
        async fn measure(&mut self, point: &Point) -> anyhow::Result<Payload> {
            let mut data: Payload = point.iter().map(|(k, v)| (k.clone(), FieldValue::Number(*v))).collect();
            data.insert("det".into(), FieldValue::Number(1.0));
            Ok(data)
        }
    }

    fn point(motor: f64) -> Point {
        Point::from([("motor".to_string(), motor)])
    }

    fn config(fallback: FallbackPolicy) -> ControlConfig {
        ControlConfig {
            feedback_timeout: Duration::from_secs(1),
            fallback,
            retrieval_retries: 0,
            first_point: point(0.0),
            max_batches: None,
        }
    }

    #[tokio::test]
    async fn test_plan_follows_recommendations_until_finished() {
        let link = ScriptedLink::new(vec![Some(Some(point(1.5))), Some(Some(point(3.0))), Some(None)]);
        let plan = AdaptivePlan::new(link.clone(), config(FallbackPolicy::Abort)).with_run_id("R1");

        let summary = plan.run(&mut Echo).await.unwrap();
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.end, PlanEnd::Finished);
        assert_eq!(summary.last_point, point(3.0));

        use DocumentKind::*;
        assert_eq!(link.kinds(), vec![Start, Descriptor, Event, Event, Event, Stop]);
        assert_eq!(
            *link.asked.lock(),
            vec![CorrelationId::new("R1", 3), CorrelationId::new("R1", 4), CorrelationId::new("R1", 5)]
        );
        let events: Vec<f64> = link
            .submitted
            .lock()
            .iter()
            .filter(|d| d.kind == Event)
            .map(|d| d.number("motor").unwrap())
            .collect();
        assert_eq!(events, vec![0.0, 1.5, 3.0]);
        assert_eq!(link.exit_status(), "success");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuse_previous_point_on_timeout() {
        let link = ScriptedLink::new(vec![None, Some(None)]);
        let plan = AdaptivePlan::new(link.clone(), config(FallbackPolicy::ReusePrevious));

        let summary = plan.run(&mut Echo).await.unwrap();
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.reused, 1);
        assert_eq!(summary.last_point, point(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_closes_run() {
        let link = ScriptedLink::new(vec![None]);
        let plan = AdaptivePlan::new(link.clone(), config(FallbackPolicy::Abort));

        let err = plan.run(&mut Echo).await.unwrap_err();
        assert!(matches!(err, PipelineError::PlanAborted { .. }));
        assert_eq!(link.exit_status(), "abort");
    }

    #[tokio::test]
    async fn test_max_batches_stops_without_waiting() {
        let link = ScriptedLink::new(vec![Some(Some(point(1.0)))]);
        let mut config = config(FallbackPolicy::Abort);
        config.max_batches = Some(2);
        let plan = AdaptivePlan::new(link.clone(), config);

        let summary = plan.run(&mut Echo).await.unwrap();
        assert_eq!(summary.end, PlanEnd::MaxBatches);
        assert_eq!(summary.batches, 2);
        assert_eq!(link.asked.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_pending_retrieval() {
        let link = ScriptedLink::new(vec![]);
        let mut config = config(FallbackPolicy::Abort);
        config.feedback_timeout = Duration::from_secs(60);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let plan = AdaptivePlan::new(link.clone(), config).with_cancel(cancel_rx);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = cancel_tx.send(true);
        });
        let started = tokio::time::Instant::now();
        let summary = plan.run(&mut Echo).await.unwrap();
        assert_eq!(summary.end, PlanEnd::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(link.exit_status(), "abort");
    }

    #[tokio::test]
    async fn test_failed_measurement_aborts() {
        struct Broken;

        #[async_trait]
        impl Measure for Broken {
            async fn measure(&mut self, _: &Point) -> anyhow::Result<Payload> {
                anyhow::bail!("motor limit switch")
            }
        }

        let link = ScriptedLink::new(vec![]);
        let plan = AdaptivePlan::new(link.clone(), config(FallbackPolicy::ReusePrevious));
        let err = plan.run(&mut Broken).await.unwrap_err();
        assert!(err.to_string().contains("motor limit switch"));
        assert_eq!(link.kinds().last(), Some(&DocumentKind::Stop));
    }
}
