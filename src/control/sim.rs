//! Simulated detector for exercising the pipeline without hardware.
//!
//! The response is a Gaussian in the distance from `center` over every axis
//! of the requested point, plus a flat background. Each reading also carries
//! a one-dimensional scattering pattern (`q`, `mean`) whose peak height
//! follows the detector value, so the `peak_area` reducer has something to
//! integrate.

use super::plan::Measure;
use crate::document::{FieldValue, Payload, Point};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

/// Standard deviation of the simulated scattering peak
const PEAK_WIDTH: f64 = 0.03;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticDetector {
    /// Name of the detector field
    pub detector: String,
    pub center: f64,
    pub width: f64,
    pub amplitude: f64,
    pub background: f64,
    /// Simulated move and count time per reading
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
    /// Number of points in the simulated pattern; zero disables it
    pub pattern_points: usize,
    /// Peak position in the pattern
    pub q_peak: f64,
}

impl Default for SyntheticDetector {
    fn default() -> Self {
        Self {
            detector: "det".to_string(),
            center: 5.0,
            width: 2.0,
            amplitude: 100.0,
            background: 1.0,
            settle: Duration::ZERO,
            pattern_points: 64,
            q_peak: 2.66,
        }
    }
}

impl SyntheticDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detector value at `point`
    pub fn response(&self, point: &Point) -> f64 {
        let r2: f64 = point.values().map(|x| (x - self.center).powi(2)).sum();
        self.amplitude * (-r2 / (2.0 * self.width * self.width)).exp() + self.background
    }

    fn pattern(&self, height: f64) -> (Vec<f64>, Vec<f64>) {
        let n = self.pattern_points;
        let (q_min, q_max) = (self.q_peak - 0.5, self.q_peak + 0.5);
        let q: Vec<f64> = (0..n)
            .map(|i| q_min + (q_max - q_min) * i as f64 / (n.max(2) - 1) as f64)
            .collect();
        let intensity = q
            .iter()
            .map(|qi| height * (-(qi - self.q_peak).powi(2) / (2.0 * PEAK_WIDTH * PEAK_WIDTH)).exp() + self.background)
            .collect();
        (q, intensity)
    }
}

#[async_trait]
impl Measure for SyntheticDetector {
    async fn measure(&mut self, point: &Point) -> anyhow::Result<Payload> {
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        let value = self.response(point);
        trace!(?point, value, "Synthetic reading");

        let mut data: Payload = point
            .iter()
            .map(|(axis, position)| (axis.clone(), FieldValue::Number(*position)))
            .collect();
        data.insert(self.detector.clone(), FieldValue::Number(value));
        if self.pattern_points > 0 {
            let (q, intensity) = self.pattern(value - self.background);
            data.insert("q".into(), FieldValue::Array(q));
            data.insert("mean".into(), FieldValue::Array(intensity));
        }
        Ok(data)
    }
}
