//! Configuration parsing for the detection runner.
//!
//! This module owns translation of CLI arguments into a `RunnerConfig`. The
//! scheduler only ever sees the immutable `SchedulerConfig` carved out of it.

use std::{collections::HashSet, path::PathBuf, time::Duration};

use anyhow::{Result, anyhow, bail};
use clap::Args;

use crate::pipeline::publisher::TopicConfig;

/// Budget used when none is given: one slot just short of a minute.
pub const DEFAULT_BUDGET_SECS: f64 = 58.0;
pub const DEFAULT_WORKER_POOL_CAP: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// When cycle results leave the process.
pub enum PublishMode {
    /// Publish each cycle as soon as it completes.
    Immediate,
    /// Buffer every cycle and publish them all once the budget is spent.
    Deferred,
}

/// Everything the budget scheduler needs, fixed for the whole run.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Window in which new cycles may start.
    pub budget: Duration,
    /// Upper bound on concurrent model workers per cycle.
    pub worker_pool_cap: usize,
    pub publish_mode: PublishMode,
    /// Start cycles on multiples of this interval instead of back-to-back.
    pub pacing_interval: Option<Duration>,
    /// Per-invocation deadline; `None` waits for every model indefinitely.
    pub model_timeout: Option<Duration>,
    pub topics: TopicConfig,
}

impl SchedulerConfig {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            worker_pool_cap: DEFAULT_WORKER_POOL_CAP,
            publish_mode: PublishMode::Immediate,
            pacing_interval: None,
            model_timeout: None,
            topics: TopicConfig::default(),
        }
    }

    pub fn with_worker_pool_cap(mut self, cap: usize) -> Self {
        self.worker_pool_cap = cap;
        self
    }

    pub fn with_publish_mode(mut self, mode: PublishMode) -> Self {
        self.publish_mode = mode;
        self
    }

    pub fn with_pacing_interval(mut self, interval: Duration) -> Self {
        self.pacing_interval = Some(interval);
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = Some(timeout);
        self
    }

    pub fn with_topics(mut self, topics: TopicConfig) -> Self {
        self.topics = topics;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// How frames are acquired.
pub enum SourceKind {
    /// Camera device, stream or video file grabbed through ffmpeg.
    Capture,
    /// Still image re-read from disk for every cycle.
    Still,
}

impl SourceKind {
    /// Infer the source kind from a URI.
    pub(crate) fn from_uri(uri: &str) -> Self {
        let lower = uri.to_ascii_lowercase();
        if [".jpg", ".jpeg", ".png", ".bmp"]
            .iter()
            .any(|ext| lower.ends_with(ext))
        {
            SourceKind::Still
        } else {
            SourceKind::Capture
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// A named external detector command.
pub struct ModelSpec {
    pub name: String,
    pub command: String,
}

impl std::str::FromStr for ModelSpec {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let (name, command) = value
            .split_once('=')
            .ok_or_else(|| anyhow!("expected NAME=COMMAND, got {value:?}"))?;
        let name = name.trim();
        let command = command.trim();
        if name.is_empty() {
            bail!("model name is empty in {value:?}");
        }
        if command.is_empty() {
            bail!("model {name:?} has an empty command");
        }
        Ok(Self {
            name: name.to_string(),
            command: command.to_string(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Where published records are written.
pub enum OutputTarget {
    Stdout,
    File(PathBuf),
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing and runtime inspection.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing cycle spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Lower the default log filter to `debug`.
    pub verbose: bool,
}

#[derive(Clone, Debug)]
/// Canonical configuration for one runner process.
pub struct RunnerConfig {
    pub source_uri: String,
    pub source_kind: SourceKind,
    pub capture_timeout: Duration,
    pub models: Vec<ModelSpec>,
    /// Detections under this confidence are dropped before publishing.
    pub confidence: f32,
    pub scheduler: SchedulerConfig,
    pub output: OutputTarget,
    pub telemetry: TelemetryOptions,
    /// Dump Prometheus-formatted metrics to stderr when the run ends.
    pub dump_metrics: bool,
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct RunnerCliArgs {
    /// Camera device index, `/dev/videoN`, stream URI, or still image path.
    #[arg(long = "source", value_name = "URI")]
    pub source: String,
    /// Detector as NAME=COMMAND; repeat for every model.
    #[arg(long = "model", value_name = "NAME=COMMAND", required = true)]
    pub models: Vec<ModelSpec>,
    /// Seconds during which new cycles may start.
    #[arg(long = "budget", value_name = "SECS")]
    pub budget_secs: Option<f64>,
    /// Maximum number of models run concurrently.
    #[arg(long = "workers", value_name = "N")]
    pub workers: Option<usize>,
    /// Buffer results and publish them after the budget is spent.
    #[arg(long = "deferred", action = clap::ArgAction::SetTrue)]
    pub deferred: bool,
    /// Start cycles on multiples of this many seconds.
    #[arg(long = "interval", value_name = "SECS")]
    pub interval_secs: Option<f64>,
    /// Give up on a model invocation after this many seconds.
    #[arg(long = "model-timeout", value_name = "SECS")]
    pub model_timeout_secs: Option<f64>,
    /// Give up on a frame grab after this many seconds.
    #[arg(long = "capture-timeout", value_name = "SECS")]
    pub capture_timeout_secs: Option<f64>,
    /// Minimum detection confidence (0-1).
    #[arg(long = "confidence", value_name = "SCORE")]
    pub confidence: Option<f32>,
    /// JSON-lines output file; `-` or omitted writes to stdout.
    #[arg(long = "output", value_name = "PATH")]
    pub output: Option<PathBuf>,
    /// Prefix for every published topic.
    #[arg(long = "topic-prefix", value_name = "PREFIX")]
    pub topic_prefix: Option<String>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Print collected metrics to stderr on exit.
    #[arg(long = "metrics", action = clap::ArgAction::SetTrue)]
    pub metrics: bool,
    /// Enable verbose logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl TryFrom<RunnerCliArgs> for RunnerConfig {
    type Error = anyhow::Error;

    fn try_from(args: RunnerCliArgs) -> Result<Self> {
        let source_uri = args.source.trim().to_string();
        if source_uri.is_empty() {
            bail!("--source must not be empty");
        }

        if args.models.is_empty() {
            bail!("Provide at least one --model NAME=COMMAND");
        }
        let mut seen = HashSet::new();
        for model in &args.models {
            if !seen.insert(model.name.as_str()) {
                bail!("model name {:?} given more than once", model.name);
            }
        }

        let budget = seconds("--budget", args.budget_secs.unwrap_or(DEFAULT_BUDGET_SECS))?;

        let worker_pool_cap = args.workers.unwrap_or(DEFAULT_WORKER_POOL_CAP);
        if worker_pool_cap == 0 {
            bail!("--workers must be at least 1");
        }

        let pacing_interval = args
            .interval_secs
            .map(|secs| positive_seconds("--interval", secs))
            .transpose()?;
        let model_timeout = args
            .model_timeout_secs
            .map(|secs| positive_seconds("--model-timeout", secs))
            .transpose()?;
        let capture_timeout = positive_seconds(
            "--capture-timeout",
            args.capture_timeout_secs.unwrap_or(10.0),
        )?;

        let confidence = args.confidence.unwrap_or(0.0);
        if !(0.0..=1.0).contains(&confidence) {
            bail!("--confidence must be between 0 and 1");
        }

        let topics = match args.topic_prefix.as_deref().map(str::trim) {
            Some("") => bail!("--topic-prefix must not be empty"),
            Some(prefix) => TopicConfig::with_prefix(prefix),
            None => TopicConfig::default(),
        };

        let output = match args.output {
            Some(path) if path.as_os_str() != "-" => OutputTarget::File(path),
            _ => OutputTarget::Stdout,
        };

        let scheduler = SchedulerConfig {
            budget,
            worker_pool_cap,
            publish_mode: if args.deferred {
                PublishMode::Deferred
            } else {
                PublishMode::Immediate
            },
            pacing_interval,
            model_timeout,
            topics,
        };

        let source_kind = SourceKind::from_uri(&source_uri);

        Ok(Self {
            source_uri,
            source_kind,
            capture_timeout,
            models: args.models,
            confidence,
            scheduler,
            output,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                verbose: args.verbose,
            },
            dump_metrics: args.metrics,
        })
    }
}

fn seconds(flag: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow!("{flag} must be a finite, non-negative number of seconds"))
}

fn positive_seconds(flag: &str, secs: f64) -> Result<Duration> {
    let duration = seconds(flag, secs)?;
    if duration.is_zero() {
        bail!("{flag} must be greater than zero");
    }
    Ok(duration)
}
