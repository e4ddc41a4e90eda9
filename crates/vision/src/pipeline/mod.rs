//! Time-budgeted capture → multi-model inference → publish loop.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing and the scheduler's fixed settings.
//! - `scheduler`: The budget loop, pacing and publish-mode routing.
//! - `cycle`: One capture plus bounded fan-out/fan-in across models.
//! - `pool`: Named detector handles and invocation error attribution.
//! - `watchdog`: Per-invocation deadlines for hung models.
//! - `publisher`: Sinks and the record/topic layout.
//! - `data`: Records passed between stages.
//! - `telemetry`: Tracing subscribers and metrics recorder.

use std::sync::Arc;

use anyhow::{Context, Result};
use ml_core::CommandDetector;
use tracing::debug;
use video_ingest::{FfmpegSnapshotSource, FrameSource, StillImageSource};

pub use config::{
    ModelSpec, OutputTarget, PublishMode, RunnerCliArgs, RunnerConfig, SchedulerConfig,
    SourceKind, TelemetryOptions,
};
pub use cycle::{CycleRunner, effective_workers};
pub use data::{CycleResult, FatalRecord, ModelError, ModelErrorKind, RunSummary};
pub use pool::{ModelHandle, ModelInvocationError, ModelPool, PoolError};
pub use publisher::{
    JsonLinesSink, MemorySink, PublishError, Published, ResultPublisher, Sink, TopicConfig,
};
pub use scheduler::{BudgetScheduler, SchedulerError, next_pacing_point};

mod config;
mod cycle;
mod data;
mod pool;
mod publisher;
mod scheduler;
pub mod telemetry;
mod watchdog;

/// Build every collaborator described by `config` and run one budget window.
pub fn run(config: RunnerConfig) -> Result<RunSummary> {
    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    if config.dump_metrics {
        telemetry::init_metrics_recorder();
    }

    let source: Box<dyn FrameSource> = match config.source_kind {
        SourceKind::Capture => Box::new(
            FfmpegSnapshotSource::new(config.source_uri.clone())
                .with_timeout(config.capture_timeout),
        ),
        SourceKind::Still => Box::new(StillImageSource::new(&config.source_uri)),
    };

    let mut handles = Vec::with_capacity(config.models.len());
    for spec in &config.models {
        let detector = CommandDetector::from_command_line(&spec.command)
            .with_context(|| format!("Invalid command for model {:?}", spec.name))?
            .with_confidence_threshold(config.confidence);
        debug!(model = %spec.name, program = detector.program(), "registered model");
        handles.push(ModelHandle::new(spec.name.clone(), detector));
    }
    let pool = ModelPool::new(handles).context("Failed to build model pool")?;

    let sink: Arc<dyn Sink> = match &config.output {
        OutputTarget::Stdout => Arc::new(JsonLinesSink::stdout()),
        OutputTarget::File(path) => Arc::new(
            JsonLinesSink::append(path)
                .with_context(|| format!("Failed to open output {}", path.display()))?,
        ),
    };

    let mut scheduler = BudgetScheduler::new(config.scheduler.clone(), pool, source, sink);
    let outcome = scheduler.run();

    if config.dump_metrics {
        if let Some(handle) = telemetry::prometheus_handle() {
            eprintln!("{}", handle.render());
        }
    }

    outcome.context("Detection run aborted")
}
