//! Emits cycle results, per-model errors and the run summary to a sink.
//!
//! Publishing is best effort: a failed publish is logged and counted, and the
//! run carries on.

use std::{
    collections::VecDeque,
    fs::File,
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use video_ingest::now_nanos;

use crate::pipeline::data::{CycleRecord, CycleResult, FatalRecord, ModelError, RunSummary};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to write record: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("sink lock poisoned")]
    Poisoned,
}

/// Destination for published records.
pub trait Sink: Send + Sync {
    fn publish(&self, topic: &str, payload: &str, timestamp_ns: i64) -> Result<(), PublishError>;
}

/// Topic names used for each kind of record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicConfig {
    pub detections: String,
    /// Per-model errors go to `<error_prefix>.<model_name>`.
    pub error_prefix: String,
    pub summary: String,
    pub fatal: String,
}

impl TopicConfig {
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            detections: format!("{prefix}.detections"),
            error_prefix: format!("{prefix}.error"),
            summary: format!("{prefix}.run_summary"),
            fatal: format!("{prefix}.run_error"),
        }
    }

    pub fn error_topic(&self, model_name: &str) -> String {
        format!("{}.{model_name}", self.error_prefix)
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self::with_prefix("object")
    }
}

pub struct ResultPublisher {
    sink: Arc<dyn Sink>,
    topics: TopicConfig,
    failures: u64,
}

impl ResultPublisher {
    pub fn new(sink: Arc<dyn Sink>, topics: TopicConfig) -> Self {
        Self {
            sink,
            topics,
            failures: 0,
        }
    }

    pub fn topics(&self) -> &TopicConfig {
        &self.topics
    }

    /// Publishes that failed since this publisher was created.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Publish one cycle: the combined detections record, then each model error.
    pub fn publish_cycle(&mut self, result: &CycleResult) {
        let topic = self.topics.detections.clone();
        self.emit(&topic, &CycleRecord::from(result), result.timestamp_ns);
        for error in &result.errors {
            let topic = self.topics.error_topic(&error.model_name);
            self.emit::<ModelError>(&topic, error, result.timestamp_ns);
        }
    }

    /// Drain `buffer` in capture order and return how long it took.
    pub fn flush(&mut self, buffer: &mut VecDeque<CycleResult>) -> Duration {
        let span = tracing::info_span!("publish.flush", cycles = buffer.len());
        let _guard = span.enter();
        let started = Instant::now();
        while let Some(result) = buffer.pop_front() {
            self.publish_cycle(&result);
        }
        let elapsed = started.elapsed();
        debug!(elapsed_ms = elapsed.as_millis() as u64, "buffer flushed");
        elapsed
    }

    pub fn publish_summary(&mut self, summary: &RunSummary) {
        let topic = self.topics.summary.clone();
        self.emit(&topic, summary, now_nanos());
    }

    pub fn publish_fatal(&mut self, record: &FatalRecord) {
        let topic = self.topics.fatal.clone();
        self.emit(&topic, record, now_nanos());
    }

    fn emit<T: Serialize + ?Sized>(&mut self, topic: &str, record: &T, timestamp_ns: i64) {
        let outcome = serde_json::to_string(record)
            .map_err(PublishError::from)
            .and_then(|payload| self.sink.publish(topic, &payload, timestamp_ns));
        if let Err(err) = outcome {
            self.failures += 1;
            metrics::counter!("runner_publish_failures_total", "topic" => topic.to_string())
                .increment(1);
            warn!(topic, "publish failed: {err}");
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    topic: &'a str,
    payload: &'a str,
    timestamp: i64,
}

/// Writes one JSON object per record: `{"topic", "payload", "timestamp"}`.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> Result<W, PublishError> {
        self.writer.into_inner().map_err(|_| PublishError::Poisoned)
    }
}

impl JsonLinesSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl JsonLinesSink<File> {
    /// Append records to `path`, creating it if needed. Each record reaches the
    /// file as soon as it is published.
    pub fn append<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::options().create(true).append(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write + Send> Sink for JsonLinesSink<W> {
    fn publish(&self, topic: &str, payload: &str, timestamp_ns: i64) -> Result<(), PublishError> {
        let mut line = serde_json::to_string(&Envelope {
            topic,
            payload,
            timestamp: timestamp_ns,
        })?;
        line.push('\n');
        let mut writer = self.writer.lock().map_err(|_| PublishError::Poisoned)?;
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

/// A record captured by [`MemorySink`].
#[derive(Clone, Debug, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub timestamp_ns: i64,
}

/// Keeps every record in memory, in publish order.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<Published>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Published> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn on_topic(&self, topic: &str) -> Vec<Published> {
        self.records()
            .into_iter()
            .filter(|record| record.topic == topic)
            .collect()
    }
}

impl Sink for MemorySink {
    fn publish(&self, topic: &str, payload: &str, timestamp_ns: i64) -> Result<(), PublishError> {
        let mut records = self.records.lock().map_err(|_| PublishError::Poisoned)?;
        records.push(Published {
            topic: topic.to_string(),
            payload: payload.to_string(),
            timestamp_ns,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ml_core::Detections;

    use super::*;
    use crate::pipeline::data::ModelErrorKind;

    fn cycle(n: u64, failing: &[&str]) -> CycleResult {
        let mut results = BTreeMap::new();
        results.insert("ok".to_string(), Detections::default());
        CycleResult {
            cycle: n,
            timestamp_ns: n as i64 * 1_000,
            results,
            errors: failing
                .iter()
                .map(|name| ModelError {
                    model_name: name.to_string(),
                    kind: ModelErrorKind::Inference,
                    message: "bad input".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn flush_drains_in_fifo_order_with_errors_after_each_cycle() {
        let sink = Arc::new(MemorySink::new());
        let mut publisher = ResultPublisher::new(sink.clone(), TopicConfig::default());
        let mut buffer: VecDeque<_> = vec![cycle(1, &["b"]), cycle(2, &[]), cycle(3, &["b", "c"])]
            .into_iter()
            .collect();

        publisher.flush(&mut buffer);
        assert!(buffer.is_empty());

        let topics: Vec<String> = sink.records().into_iter().map(|r| r.topic).collect();
        assert_eq!(
            topics,
            vec![
                "object.detections",
                "object.error.b",
                "object.detections",
                "object.detections",
                "object.error.b",
                "object.error.c",
            ]
        );
        let stamps: Vec<i64> = sink
            .on_topic("object.detections")
            .into_iter()
            .map(|r| r.timestamp_ns)
            .collect();
        assert_eq!(stamps, vec![1_000, 2_000, 3_000]);
    }

    struct FailingSink;

    impl Sink for FailingSink {
        fn publish(&self, _: &str, _: &str, _: i64) -> Result<(), PublishError> {
            Err(PublishError::Io(io::Error::other("broker down")))
        }
    }

    #[test]
    fn sink_failures_are_counted_not_raised() {
        let mut publisher = ResultPublisher::new(Arc::new(FailingSink), TopicConfig::default());
        publisher.publish_cycle(&cycle(1, &["x"]));
        assert_eq!(publisher.failures(), 2);
    }

    #[test]
    fn json_lines_sink_writes_envelopes() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.publish("object.detections", "{\"a\":1}", 99).unwrap();
        sink.publish("object.run_summary", "{}", 100).unwrap();
        let written = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let lines: Vec<serde_json::Value> = written
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["topic"], "object.detections");
        assert_eq!(lines[0]["payload"], "{\"a\":1}");
        assert_eq!(lines[1]["timestamp"], 100);
    }

    #[test]
    fn json_lines_sink_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        {
            let sink = JsonLinesSink::append(&path).unwrap();
            sink.publish("t", "p", 1).unwrap();
        }
        {
            let sink = JsonLinesSink::append(&path).unwrap();
            sink.publish("t", "q", 2).unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn appended_records_are_on_disk_before_the_sink_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.jsonl");
        let sink = JsonLinesSink::append(&path).unwrap();
        sink.publish("object.detections", "{}", 5).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(contents.trim_end()).unwrap();
        assert_eq!(line["timestamp"], 5);
        drop(sink);
    }

    #[test]
    fn summary_is_stamped_with_publish_time() {
        let sink = Arc::new(MemorySink::new());
        let mut publisher = ResultPublisher::new(sink.clone(), TopicConfig::default());
        let now = chrono::Utc::now();
        let before = now_nanos();
        publisher.publish_summary(&RunSummary {
            cycle_count: 0,
            total_runtime: Duration::ZERO,
            publish_duration: None,
            start_time: now,
            end_time: now,
        });
        let after = now_nanos();

        let records = sink.on_topic("object.run_summary");
        assert_eq!(records.len(), 1);
        assert!((before..=after).contains(&records[0].timestamp_ns));
    }

    #[test]
    fn topic_prefix_applies_to_every_topic() {
        let topics = TopicConfig::with_prefix("env.camera");
        assert_eq!(topics.detections, "env.camera.detections");
        assert_eq!(topics.error_topic("yolo"), "env.camera.error.yolo");
        assert_eq!(topics.summary, "env.camera.run_summary");
        assert_eq!(topics.fatal, "env.camera.run_error");
    }
}
