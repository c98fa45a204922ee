//! Document model for the relay pipeline.
//!
//! The control process emits a stream of [`Document`]s per run, Bluesky style:
//!
//! ```text
//! Start (seq 1)
//!    │
//!    ├── Descriptor (1+, one per data stream)
//!    │       │
//!    │       └── Event (N, measurements)
//!    │
//! Stop (terminal)
//! ```
//!
//! The analysis stage turns documents into [`ReducedRecord`]s and relays them,
//! bracketed by run lifecycle markers, as [`StageMessage`]s. The adaptive stage
//! turns a run's records into a [`Recommendation`] stored under a
//! [`CorrelationId`] that both ends can derive from the triggering event.

use crate::error::PipelineResult;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Encode any pipeline message as JSON bytes for the channel or the store.
pub fn encode<T: Serialize>(value: &T) -> PipelineResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Decode a pipeline message from JSON bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> PipelineResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Field value carried in document payloads and derived records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Array(Vec<f64>),
    Text(String),
}

impl FieldValue {
    /// Scalar value, if this is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Array value, if this is an array
    pub fn as_array(&self) -> Option<&[f64]> {
        match self {
            FieldValue::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Text value, if this is a string
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<Vec<f64>> for FieldValue {
    fn from(v: Vec<f64>) -> Self {
        FieldValue::Array(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

/// Field name -> value mapping
pub type Payload = BTreeMap<String, FieldValue>;

/// Control-axis name -> target value
pub type Point = BTreeMap<String, f64>;

/// Document kinds emitted by the control process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Start,
    Descriptor,
    Event,
    Stop,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DocumentKind::Start => "start",
            DocumentKind::Descriptor => "descriptor",
            DocumentKind::Event => "event",
            DocumentKind::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// One immutable record of a run.
///
/// Within a run `sequence_number` strictly increases in publish order and a
/// `Stop` document is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique document ID
    pub uid: String,
    /// Run this document belongs to
    pub run_id: String,
    /// Position within the run, starting at 1
    pub sequence_number: u64,
    pub kind: DocumentKind,
    /// Timestamp
    pub time_ns: u64,
    pub payload: Payload,
}

impl Document {
    pub fn new(run_id: &str, sequence_number: u64, kind: DocumentKind) -> Self {
        Self {
            uid: new_uid(),
            run_id: run_id.to_string(),
            sequence_number,
            kind,
            time_ns: now_ns(),
            payload: Payload::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.payload.insert(name.to_string(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload.extend(payload);
        self
    }

    /// Scalar payload field
    pub fn number(&self, field: &str) -> Option<f64> {
        self.payload.get(field).and_then(FieldValue::as_number)
    }

    /// Array payload field
    pub fn array(&self, field: &str) -> Option<&[f64]> {
        self.payload.get(field).and_then(FieldValue::as_array)
    }

    /// Whether this document ends its run
    pub fn is_terminal(&self) -> bool {
        self.kind == DocumentKind::Stop
    }
}

/// Exit status recorded in a stop document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    Abort,
    Fail,
}

impl ExitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitStatus::Success => "success",
            ExitStatus::Abort => "abort",
            ExitStatus::Fail => "fail",
        }
    }
}

/// Composes the documents of one run with consecutive sequence numbers.
#[derive(Debug)]
pub struct RunComposer {
    run_id: String,
    next_sequence: u64,
    num_events: u64,
}

impl RunComposer {
    /// Compose a run with a fresh run ID
    pub fn new() -> Self {
        Self::with_run_id(&new_uid())
    }

    pub fn with_run_id(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            next_sequence: 1,
            num_events: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn next(&mut self, kind: DocumentKind) -> Document {
        let doc = Document::new(&self.run_id, self.next_sequence, kind);
        self.next_sequence += 1;
        doc
    }

    pub fn start(&mut self, metadata: Payload) -> Document {
        self.next(DocumentKind::Start).with_payload(metadata)
    }

    /// Descriptor for a named data stream (e.g. "primary")
    pub fn descriptor(&mut self, stream: &str) -> Document {
        self.next(DocumentKind::Descriptor).with_field("name", stream)
    }

    pub fn event(&mut self, data: Payload) -> Document {
        self.num_events += 1;
        self.next(DocumentKind::Event).with_payload(data)
    }

    pub fn stop(&mut self, status: ExitStatus) -> Document {
        let num_events = self.num_events as f64;
        self.next(DocumentKind::Stop)
            .with_field("exit_status", status.as_str())
            .with_field("num_events", num_events)
    }
}

impl Default for RunComposer {
    fn default() -> Self {
        Self::new()
    }
}

/// Inclusive range of source document sequence numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub first: u64,
    pub last: u64,
}

impl SequenceRange {
    pub fn single(sequence_number: u64) -> Self {
        Self {
            first: sequence_number,
            last: sequence_number,
        }
    }
}

/// Analysis-stage summary of one or more documents of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducedRecord {
    pub run_id: String,
    pub source_sequence_range: SequenceRange,
    pub derived_fields: Payload,
}

impl ReducedRecord {
    pub fn new(run_id: &str, source_sequence_range: SequenceRange) -> Self {
        Self {
            run_id: run_id.to_string(),
            source_sequence_range,
            derived_fields: Payload::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.derived_fields.insert(name.to_string(), value.into());
        self
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.derived_fields.get(field).and_then(FieldValue::as_number)
    }

    /// Key under which the recommendation triggered by this record is stored
    pub fn correlation_id(&self) -> CorrelationId {
        CorrelationId::new(&self.run_id, self.source_sequence_range.last)
    }
}

/// What the analysis stage publishes on its output topic.
///
/// Run start/stop are relayed alongside records so the adaptive stage sees
/// each run's terminal marker in order with its records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageMessage {
    RunStarted { run_id: String, metadata: Payload },
    Reduced(ReducedRecord),
    RunStopped { run_id: String, exit_status: String },
}

impl StageMessage {
    pub fn run_id(&self) -> &str {
        match self {
            StageMessage::RunStarted { run_id, .. } => run_id,
            StageMessage::Reduced(record) => &record.run_id,
            StageMessage::RunStopped { run_id, .. } => run_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StageMessage::RunStopped { .. })
    }
}

/// Key linking a recommendation to the control-side request that retrieves it.
///
/// Formatted `"{run_id}:{n}"` where `n` is the sequence number of the event
/// document the recommendation answers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(run_id: &str, sequence_number: u64) -> Self {
        Self(format!("{run_id}:{sequence_number}"))
    }

    /// Correlation ID answering the given event document
    pub fn for_document(document: &Document) -> Self {
        Self::new(&document.run_id, document.sequence_number)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Adaptive-stage proposal for the next experimental point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub run_id: String,
    pub correlation_id: CorrelationId,
    /// `None` tells the plan to stop asking for more points
    pub proposed_point: Option<Point>,
    pub created_at: DateTime<Utc>,
}

impl Recommendation {
    pub fn next_point(run_id: &str, correlation_id: CorrelationId, point: Point) -> Self {
        Self {
            run_id: run_id.to_string(),
            correlation_id,
            proposed_point: Some(point),
            created_at: Utc::now(),
        }
    }

    pub fn finished(run_id: &str, correlation_id: CorrelationId) -> Self {
        Self {
            run_id: run_id.to_string(),
            correlation_id,
            proposed_point: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.proposed_point.is_none()
    }
}

/// Pipeline stage named in status reports and errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Control,
    Analysis,
    Adaptive,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Control => "control",
            Stage::Analysis => "analysis",
            Stage::Adaptive => "adaptive",
        };
        f.write_str(name)
    }
}

/// Outcome carried by a status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StatusOutcome {
    /// A record was published or a recommendation stored
    Written,
    /// The stage gave up on this message; the feedback will never arrive
    Failed { reason: String },
    /// The run's accumulated state was released
    Released { records: usize },
}

/// Status line published by the relays so operators can tell slow from lost feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub stage: Stage,
    pub run_id: String,
    pub correlation_id: Option<CorrelationId>,
    #[serde(flatten)]
    pub outcome: StatusOutcome,
    pub time_ns: u64,
}

impl StatusReport {
    pub fn new(
        stage: Stage,
        run_id: &str,
        correlation_id: Option<CorrelationId>,
        outcome: StatusOutcome,
    ) -> Self {
        Self {
            stage,
            run_id: run_id.to_string(),
            correlation_id,
            outcome,
            time_ns: now_ns(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, StatusOutcome::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    #[test]
    fn test_run_composer_sequences() {
        let mut run = RunComposer::with_run_id("R1");
        let start = run.start(Payload::new());
        let desc = run.descriptor("primary");
        let event = run.event(Payload::from([("x".to_string(), FieldValue::Number(1.0))]));
        let stop = run.stop(ExitStatus::Success);

        assert_eq!(start.sequence_number, 1);
        assert_eq!(desc.sequence_number, 2);
        assert_eq!(event.sequence_number, 3);
        assert_eq!(stop.sequence_number, 4);
        assert!(stop.is_terminal());
        assert!(!event.is_terminal());
        assert_eq!(stop.number("num_events"), Some(1.0));
        assert_eq!(event.number("x"), Some(1.0));
    }

    #[test]
    fn test_correlation_id_from_event() {
        let event = Document::new("R1", 2, DocumentKind::Event);
        assert_eq!(CorrelationId::for_document(&event).as_str(), "R1:2");

        let record = ReducedRecord::new("R1", SequenceRange { first: 1, last: 2 });
        assert_eq!(record.correlation_id(), CorrelationId::for_document(&event));
    }

    #[test]
    fn test_document_wire_format() {
        let doc = Document::new("R1", 2, DocumentKind::Event)
            .with_field("x", 1.0)
            .with_field("q", vec![0.1, 0.2])
            .with_field("sample", "TiCu");
        let bytes = encode(&doc).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["kind"], "event");
        assert_eq!(json["payload"]["x"], 1.0);

        let back: Document = decode(&bytes).unwrap();
        assert_eq!(back.array("q"), Some(&[0.1, 0.2][..]));
        assert_eq!(back.payload.get("sample").and_then(FieldValue::as_text), Some("TiCu"));
    }

    #[test]
    fn test_stage_message_tagging() {
        let msg = StageMessage::RunStopped {
            run_id: "R1".into(),
            exit_status: "success".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "run_stopped");
        assert!(msg.is_terminal());
        assert_eq!(msg.run_id(), "R1");
    }

    #[test]
    fn test_status_report_flattens_outcome() {
        let report = StatusReport::new(
            Stage::Adaptive,
            "R1",
            Some(CorrelationId::from("R1:2")),
            StatusOutcome::Failed {
                reason: "singular matrix".into(),
            },
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["reason"], "singular matrix");
        assert_eq!(json["correlation_id"], "R1:2");
        assert!(report.is_failure());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode::<Document>(b"not json").unwrap_err();
        assert!(matches!(err, PipelineError::Codec(_)));
    }
}
