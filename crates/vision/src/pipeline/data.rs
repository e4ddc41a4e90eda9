use std::{collections::BTreeMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use ml_core::Detections;
use serde::{Serialize, Serializer};

/// Why a model produced no detections for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelErrorKind {
    /// The detector returned an error.
    Inference,
    /// The detector panicked.
    Panicked,
    /// The invocation outlived its deadline and was abandoned.
    TimedOut,
    /// A previous, abandoned invocation of the same model is still running.
    Busy,
    /// No worker remained to run the model.
    WorkerLost,
}

impl ModelErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ModelErrorKind::Inference => "inference",
            ModelErrorKind::Panicked => "panicked",
            ModelErrorKind::TimedOut => "timed_out",
            ModelErrorKind::Busy => "busy",
            ModelErrorKind::WorkerLost => "worker_lost",
        }
    }
}

impl fmt::Display for ModelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-model failure recorded for a cycle. Never aborts the cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelError {
    pub model_name: String,
    pub kind: ModelErrorKind,
    pub message: String,
}

/// Everything one capture-and-infer cycle produced.
///
/// Every configured model appears exactly once, either in `results` or in
/// `errors`.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleResult {
    /// 1-based position of the cycle within its run.
    pub cycle: u64,
    /// Timestamp of the frame every model in this cycle saw.
    pub timestamp_ns: i64,
    pub results: BTreeMap<String, Detections>,
    /// Failures in model registration order.
    pub errors: Vec<ModelError>,
}

impl CycleResult {
    pub fn model_count(&self) -> usize {
        self.results.len() + self.errors.len()
    }
}

/// Counts and timings for a finished run, published once at the end.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub cycle_count: u64,
    #[serde(serialize_with = "as_secs")]
    pub total_runtime: Duration,
    /// Time spent draining the buffer; only set in deferred mode.
    #[serde(serialize_with = "as_optional_secs")]
    pub publish_duration: Option<Duration>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Diagnostic emitted when a run is cut short.
#[derive(Debug, Clone, Serialize)]
pub struct FatalRecord {
    pub cycle: u64,
    pub completed_cycles: u64,
    pub error: String,
}

#[derive(Serialize)]
pub(crate) struct ModelDetectionsRecord<'a> {
    pub(crate) detections: &'a Detections,
    pub(crate) counts: BTreeMap<String, usize>,
    pub(crate) total_objects: usize,
}

/// Combined record for one cycle as it goes out on the detections topic.
#[derive(Serialize)]
pub(crate) struct CycleRecord<'a> {
    pub(crate) cycle: u64,
    pub(crate) timestamp: i64,
    pub(crate) models: BTreeMap<&'a str, ModelDetectionsRecord<'a>>,
    pub(crate) failed_models: Vec<&'a str>,
}

impl<'a> From<&'a CycleResult> for CycleRecord<'a> {
    fn from(result: &'a CycleResult) -> Self {
        let models = result
            .results
            .iter()
            .map(|(name, detections)| {
                (
                    name.as_str(),
                    ModelDetectionsRecord {
                        detections,
                        counts: detections.counts(),
                        total_objects: detections.len(),
                    },
                )
            })
            .collect();
        Self {
            cycle: result.cycle,
            timestamp: result.timestamp_ns,
            models,
            failed_models: result
                .errors
                .iter()
                .map(|err| err.model_name.as_str())
                .collect(),
        }
    }
}

fn as_secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

fn as_optional_secs<S: Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use ml_core::Detection;

    use super::*;

    #[test]
    fn cycle_record_lists_counts_and_failed_models() {
        let mut results = BTreeMap::new();
        results.insert(
            "yolo".to_string(),
            Detections::new(vec![
                Detection {
                    class: "car".into(),
                    confidence: 0.9,
                    bbox: [0.0, 0.0, 4.0, 4.0],
                },
                Detection {
                    class: "car".into(),
                    confidence: 0.6,
                    bbox: [1.0, 1.0, 5.0, 5.0],
                },
            ]),
        );
        let result = CycleResult {
            cycle: 3,
            timestamp_ns: 42,
            results,
            errors: vec![ModelError {
                model_name: "ssd".into(),
                kind: ModelErrorKind::TimedOut,
                message: "late".into(),
            }],
        };

        let json = serde_json::to_value(CycleRecord::from(&result)).unwrap();
        assert_eq!(json["timestamp"], 42);
        assert_eq!(json["models"]["yolo"]["total_objects"], 2);
        assert_eq!(json["models"]["yolo"]["counts"]["car"], 2);
        assert_eq!(json["models"]["yolo"]["detections"][0]["class"], "car");
        assert_eq!(json["failed_models"][0], "ssd");
        assert_eq!(result.model_count(), 2);
    }

    #[test]
    fn summary_serialises_durations_as_seconds() {
        let now = Utc::now();
        let summary = RunSummary {
            cycle_count: 0,
            total_runtime: Duration::from_millis(1500),
            publish_duration: None,
            start_time: now,
            end_time: now,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["total_runtime"], 1.5);
        assert!(json["publish_duration"].is_null());
        assert_eq!(ModelErrorKind::WorkerLost.to_string(), "worker_lost");
    }
}
