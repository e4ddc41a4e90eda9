//! The outer loop: run cycles until the budget is spent, then publish.
//!
//! The budget only gates whether a new cycle may start. An in-flight cycle is
//! never interrupted, so a run can overshoot the budget by up to one cycle.

use std::{
    collections::VecDeque,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info};
use video_ingest::{CaptureError, FrameSource};

use crate::pipeline::{
    config::{PublishMode, SchedulerConfig},
    cycle::CycleRunner,
    data::{FatalRecord, RunSummary},
    pool::ModelPool,
    publisher::{ResultPublisher, Sink},
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("capture failed on cycle {cycle} after {completed} completed cycle(s)")]
    Capture {
        cycle: u64,
        completed: u64,
        #[source]
        source: CaptureError,
    },
}

/// Offset from the run start at which the next paced cycle should begin, or
/// `None` when that point would fall outside the budget.
pub fn next_pacing_point(elapsed: Duration, interval: Duration, budget: Duration) -> Option<Duration> {
    let step = interval.as_nanos();
    if step == 0 {
        return Some(elapsed);
    }
    let slots = elapsed.as_nanos() / step + 1;
    let next = step.checked_mul(slots)?;
    let next = Duration::from_nanos(u64::try_from(next).ok()?);
    (next < budget).then_some(next)
}

pub struct BudgetScheduler {
    config: SchedulerConfig,
    runner: CycleRunner,
    source: Box<dyn FrameSource>,
    publisher: ResultPublisher,
}

impl BudgetScheduler {
    pub fn new(
        config: SchedulerConfig,
        pool: ModelPool,
        source: Box<dyn FrameSource>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        let runner = CycleRunner::new(pool, config.worker_pool_cap, config.model_timeout);
        let publisher = ResultPublisher::new(sink, config.topics.clone());
        Self {
            config,
            runner,
            source,
            publisher,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.runner.worker_count()
    }

    /// Publishes that failed so far; failures never stop a run.
    pub fn publish_failures(&self) -> u64 {
        self.publisher.failures()
    }

    /// Run cycles until the budget is spent.
    ///
    /// A summary is published exactly once, also when the run ends on a capture
    /// failure; in that case results buffered before the failure are still
    /// flushed and a diagnostic record precedes the summary.
    pub fn run(&mut self) -> Result<RunSummary, SchedulerError> {
        let budget = self.config.budget;
        let mode = self.config.publish_mode;
        let pacing = self.config.pacing_interval.filter(|interval| !interval.is_zero());

        let span = tracing::info_span!(
            "run",
            source = %self.source.describe(),
            models = self.runner.pool().len(),
            workers = self.runner.worker_count(),
            budget_ms = budget.as_millis() as u64,
            deferred = matches!(mode, PublishMode::Deferred),
        );
        let _guard = span.enter();

        let start = Instant::now();
        let start_time = Utc::now();
        let mut buffer = VecDeque::new();
        let mut cycle_count: u64 = 0;
        let mut fatal: Option<SchedulerError> = None;

        while start.elapsed() < budget {
            match self.runner.run_cycle(self.source.as_mut()) {
                Ok(result) => {
                    cycle_count += 1;
                    match mode {
                        PublishMode::Immediate => self.publisher.publish_cycle(&result),
                        PublishMode::Deferred => buffer.push_back(result),
                    }
                }
                Err(source) => {
                    error!("capture failed, ending run: {source}");
                    fatal = Some(SchedulerError::Capture {
                        cycle: cycle_count + 1,
                        completed: cycle_count,
                        source,
                    });
                    break;
                }
            }

            if let Some(interval) = pacing {
                let elapsed = start.elapsed();
                match next_pacing_point(elapsed, interval, budget) {
                    Some(next) => thread::sleep(next.saturating_sub(elapsed)),
                    None => break,
                }
            }
        }

        let publish_duration = match mode {
            PublishMode::Deferred => Some(self.publisher.flush(&mut buffer)),
            PublishMode::Immediate => None,
        };

        if let Some(SchedulerError::Capture {
            cycle,
            completed,
            source,
        }) = &fatal
        {
            self.publisher.publish_fatal(&FatalRecord {
                cycle: *cycle,
                completed_cycles: *completed,
                error: source.to_string(),
            });
        }

        let summary = RunSummary {
            cycle_count,
            total_runtime: start.elapsed(),
            publish_duration,
            start_time,
            end_time: Utc::now(),
        };
        self.publisher.publish_summary(&summary);
        info!(
            cycles = summary.cycle_count,
            runtime_ms = summary.total_runtime.as_millis() as u64,
            publish_failures = self.publisher.failures(),
            "run finished"
        );

        match fatal {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn pacing_targets_next_multiple_of_interval() {
        let interval = 100 * MS;
        let budget = 1000 * MS;
        assert_eq!(next_pacing_point(Duration::ZERO, interval, budget), Some(100 * MS));
        assert_eq!(next_pacing_point(30 * MS, interval, budget), Some(100 * MS));
        assert_eq!(next_pacing_point(100 * MS, interval, budget), Some(200 * MS));
        // A cycle that overran several slots resumes on the next free slot.
        assert_eq!(next_pacing_point(350 * MS, interval, budget), Some(400 * MS));
    }

    #[test]
    fn pacing_refuses_to_sleep_past_the_budget() {
        let interval = 100 * MS;
        assert_eq!(next_pacing_point(250 * MS, interval, 300 * MS), None);
        assert_eq!(next_pacing_point(250 * MS, interval, 301 * MS), Some(300 * MS));
        assert_eq!(next_pacing_point(Duration::ZERO, 3 * interval, 300 * MS), None);
    }
}
