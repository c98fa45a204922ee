//! Built-in reducers. Each reduces event documents only.

use super::{Reducer, RunAccumulator};
use crate::document::{Document, DocumentKind, FieldValue, ReducedRecord, SequenceRange};
use anyhow::{anyhow, bail, ensure, Result};
use serde::Deserialize;

/// Copies event fields through unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PassthroughConfig {
    /// Fields to copy; empty copies the whole payload.
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Passthrough {
    config: PassthroughConfig,
}

impl Passthrough {
    pub fn new(config: PassthroughConfig) -> Self {
        Self { config }
    }
}

impl Reducer for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn reduce(&self, document: &Document, _: &mut RunAccumulator) -> Result<Option<ReducedRecord>> {
        if document.kind != DocumentKind::Event {
            return Ok(None);
        }
        let mut record = ReducedRecord::new(&document.run_id, SequenceRange::single(document.sequence_number));
        if self.config.fields.is_empty() {
            record.derived_fields = document.payload.clone();
        } else {
            for field in &self.config.fields {
                let value = document
                    .payload
                    .get(field)
                    .ok_or_else(|| anyhow!("event has no field '{}'", field))?;
                record.derived_fields.insert(field.clone(), value.clone());
            }
        }
        Ok(Some(record))
    }
}

/// Background-subtracted peak area over a q window.
#[derive(Debug, Clone, Deserialize)]
pub struct PeakAreaConfig {
    #[serde(default = "default_q_field")]
    pub q_field: String,
    #[serde(default = "default_intensity_field")]
    pub intensity_field: String,
    pub q_start: f64,
    pub q_stop: f64,
    /// Name of the derived area field
    #[serde(default = "default_area_output")]
    pub output: String,
    /// Name of the derived window-centre field
    #[serde(default = "default_center_output")]
    pub center_output: String,
    /// Scalar event fields mirrored into the record (e.g. control-axis readbacks)
    #[serde(default)]
    pub carry: Vec<String>,
}

fn default_q_field() -> String {
    "q".to_string()
}

fn default_intensity_field() -> String {
    "mean".to_string()
}

fn default_area_output() -> String {
    "I_00".to_string()
}

fn default_center_output() -> String {
    "Q_00".to_string()
}

#[derive(Debug, Clone)]
pub struct PeakArea {
    config: PeakAreaConfig,
}

impl PeakArea {
    pub fn new(config: PeakAreaConfig) -> Result<Self> {
        ensure!(
            config.q_start < config.q_stop,
            "q_start ({}) must be below q_stop ({})",
            config.q_start,
            config.q_stop
        );
        Ok(Self { config })
    }
}

/// Bins averaged on each side of the window to estimate the background
pub const BACKGROUND_BINS: usize = 3;

/// Integrated area under `intensity` between `q_start` and `q_stop`, with a
/// constant background removed.
///
/// `q` holds ascending bin positions. The window runs from the first bin at
/// or above `q_start` through the first bin at or above `q_stop`. The
/// background is the mean of the averages of the [`BACKGROUND_BINS`] bins
/// just before and just after the window. Bin widths come from consecutive
/// `q` differences, so one extra `q` value past the window is required.
pub fn compute_peak_area(q: &[f64], intensity: &[f64], q_start: f64, q_stop: f64) -> Result<f64> {
    ensure!(
        q.len() == intensity.len(),
        "q has {} bins but intensity has {}",
        q.len(),
        intensity.len()
    );
    let start = q.partition_point(|&v| v < q_start);
    let stop = q.partition_point(|&v| v < q_stop) + 1;

    if start < BACKGROUND_BINS || stop + BACKGROUND_BINS > intensity.len() || stop >= q.len() {
        bail!(
            "window [{}, {}] leaves too few bins for background and widths ({} bins)",
            q_start,
            q_stop,
            q.len()
        );
    }

    let mean = |bins: &[f64]| bins.iter().sum::<f64>() / bins.len() as f64;
    let background = (mean(&intensity[start - BACKGROUND_BINS..start])
        + mean(&intensity[stop..stop + BACKGROUND_BINS]))
        / 2.0;

    Ok(intensity[start..stop]
        .iter()
        .zip(q[start..=stop].windows(2))
        .map(|(i, edges)| (i - background) * (edges[1] - edges[0]))
        .sum())
}

impl Reducer for PeakArea {
    fn name(&self) -> &str {
        "peak_area"
    }

    fn reduce(&self, document: &Document, _: &mut RunAccumulator) -> Result<Option<ReducedRecord>> {
        if document.kind != DocumentKind::Event {
            return Ok(None);
        }
        let cfg = &self.config;
        let q = document
            .array(&cfg.q_field)
            .ok_or_else(|| anyhow!("event has no array field '{}'", cfg.q_field))?;
        let intensity = document
            .array(&cfg.intensity_field)
            .ok_or_else(|| anyhow!("event has no array field '{}'", cfg.intensity_field))?;

        let area = compute_peak_area(q, intensity, cfg.q_start, cfg.q_stop)?;
        let mut record = ReducedRecord::new(&document.run_id, SequenceRange::single(document.sequence_number))
            .with_field(&cfg.output, area)
            .with_field(&cfg.center_output, (cfg.q_start + cfg.q_stop) / 2.0);
        for field in &cfg.carry {
            let value = document
                .number(field)
                .ok_or_else(|| anyhow!("event has no scalar field '{}'", field))?;
            record = record.with_field(field, value);
        }
        Ok(Some(record))
    }
}

/// Running mean of scalar fields across the run's events.
#[derive(Debug, Clone, Deserialize)]
pub struct MeanConfig {
    pub fields: Vec<String>,
    #[serde(default = "default_mean_suffix")]
    pub suffix: String,
}

fn default_mean_suffix() -> String {
    "_mean".to_string()
}

#[derive(Debug, Clone)]
pub struct Mean {
    config: MeanConfig,
}

impl Mean {
    pub fn new(config: MeanConfig) -> Result<Self> {
        ensure!(!config.fields.is_empty(), "mean reducer needs at least one field");
        Ok(Self { config })
    }
}

impl Reducer for Mean {
    fn name(&self) -> &str {
        "mean"
    }

    fn reduce(&self, document: &Document, accumulator: &mut RunAccumulator) -> Result<Option<ReducedRecord>> {
        if document.kind != DocumentKind::Event {
            return Ok(None);
        }
        // Validate everything before touching the running totals.
        let values = self
            .config
            .fields
            .iter()
            .map(|field| {
                document
                    .number(field)
                    .map(|v| (field, v))
                    .ok_or_else(|| anyhow!("event has no scalar field '{}'", field))
            })
            .collect::<Result<Vec<_>>>()?;

        let first = accumulator.first_event().unwrap_or(document.sequence_number);
        let range = SequenceRange {
            first,
            last: document.sequence_number,
        };
        let mut record = ReducedRecord::new(&document.run_id, range);
        for (field, value) in values {
            let mean = accumulator.accumulate(field, value);
            record
                .derived_fields
                .insert(format!("{}{}", field, self.config.suffix), FieldValue::Number(mean));
            record.derived_fields.insert(field.clone(), FieldValue::Number(value));
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Payload, RunComposer};

    fn ramp_with_peak() -> (Vec<f64>, Vec<f64>) {
        let q: Vec<f64> = (0..20).map(f64::from).collect();
        let mut intensity = vec![1.0; 20];
        for i in &mut intensity[9..=11] {
            *i = 3.0;
        }
        (q, intensity)
    }

    #[test]
    fn test_peak_area_subtracts_background() {
        let (q, intensity) = ramp_with_peak();
        let area = compute_peak_area(&q, &intensity, 9.0, 11.0).unwrap();
        assert!((area - 6.0).abs() < 1e-12, "area was {area}");
    }

    #[test]
    fn test_peak_area_window_too_close_to_edge() {
        let (q, intensity) = ramp_with_peak();
        assert!(compute_peak_area(&q, &intensity, 1.0, 4.0).is_err());
        assert!(compute_peak_area(&q, &intensity, 10.0, 18.0).is_err());
        assert!(compute_peak_area(&q, &intensity[..10], 5.0, 6.0).is_err());
    }

    #[test]
    fn test_peak_area_reducer_builds_record() {
        let (q, intensity) = ramp_with_peak();
        let reducer = PeakArea::new(PeakAreaConfig {
            q_field: "q".into(),
            intensity_field: "mean".into(),
            q_start: 9.0,
            q_stop: 11.0,
            output: "I_00".into(),
            center_output: "Q_00".into(),
            carry: vec!["ctrl_Ti".into()],
        })
        .unwrap();

        let mut run = RunComposer::with_run_id("R1");
        let _ = run.start(Payload::new());
        let event = run.event(Payload::from([
            ("q".to_string(), q.into()),
            ("mean".to_string(), intensity.into()),
            ("ctrl_Ti".to_string(), FieldValue::Number(0.5)),
        ]));
        let mut acc = RunAccumulator::new("R1");
        let record = reducer.reduce(&event, &mut acc).unwrap().unwrap();

        assert_eq!(record.source_sequence_range, SequenceRange::single(2));
        assert!((record.number("I_00").unwrap() - 6.0).abs() < 1e-12);
        assert_eq!(record.number("Q_00"), Some(10.0));
        assert_eq!(record.number("ctrl_Ti"), Some(0.5));
    }

    #[test]
    fn test_peak_area_rejects_inverted_window() {
        let config: PeakAreaConfig = toml::from_str("q_start = 3.2\nq_stop = 2.9").unwrap();
        assert!(PeakArea::new(config).is_err());
    }

    #[test]
    fn test_passthrough_selects_fields() {
        let reducer = Passthrough::new(PassthroughConfig {
            fields: vec!["x".into()],
        });
        let event = Document::new("R1", 2, DocumentKind::Event)
            .with_field("x", 1.0)
            .with_field("noise", 0.1);
        let mut acc = RunAccumulator::new("R1");

        let record = reducer.reduce(&event, &mut acc).unwrap().unwrap();
        assert_eq!(record.number("x"), Some(1.0));
        assert!(record.derived_fields.get("noise").is_none());

        let start = Document::new("R1", 1, DocumentKind::Start);
        assert!(reducer.reduce(&start, &mut acc).unwrap().is_none());

        let bad = Document::new("R1", 3, DocumentKind::Event).with_field("y", 1.0);
        assert!(reducer.reduce(&bad, &mut acc).is_err());
    }

    #[test]
    fn test_mean_spans_run_events() {
        let reducer = Mean::new(MeanConfig {
            fields: vec!["det".into()],
            suffix: "_mean".into(),
        })
        .unwrap();
        let mut run = RunComposer::with_run_id("R1");
        let mut acc = RunAccumulator::new("R1");
        let mut last = None;
        for (i, det) in [1.0, 2.0, 6.0].into_iter().enumerate() {
            let event = run.event(Payload::from([("det".to_string(), det.into())]));
            acc.observe(&event);
            last = reducer.reduce(&event, &mut acc).unwrap();
            assert_eq!(last.as_ref().unwrap().source_sequence_range.last, i as u64 + 1);
        }
        let record = last.unwrap();
        assert_eq!(record.source_sequence_range, SequenceRange { first: 1, last: 3 });
        assert_eq!(record.number("det_mean"), Some(3.0));
        assert_eq!(record.number("det"), Some(6.0));
    }

    #[test]
    fn test_mean_failure_leaves_totals_untouched() {
        let reducer = Mean::new(MeanConfig {
            fields: vec!["a".into(), "b".into()],
            suffix: "_mean".into(),
        })
        .unwrap();
        let mut acc = RunAccumulator::new("R1");
        let partial = Document::new("R1", 1, DocumentKind::Event).with_field("a", 10.0);
        assert!(reducer.reduce(&partial, &mut acc).is_err());
        assert_eq!(acc.accumulate("a", 2.0), 2.0);
    }
}
