//! Deadline tracking for in-flight model invocations.
//!
//! The cycle runner reports every invocation start and finish here. When a
//! per-model timeout is configured the watchdog tells the runner how long it
//! may block waiting for results and which invocations have overrun, so a hung
//! detector costs one `timed_out` error instead of stalling the whole cycle.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

#[derive(Clone, Copy, Debug)]
struct Inflight {
    worker: usize,
    started_at: Instant,
}

/// Invocation that outlived its deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Overrun {
    pub(crate) model_index: usize,
    pub(crate) worker: usize,
}

pub(crate) struct InvocationWatchdog {
    timeout: Option<Duration>,
    inflight: HashMap<usize, Inflight>,
}

impl InvocationWatchdog {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            inflight: HashMap::new(),
        }
    }

    /// Record that `worker` began invoking the model at `model_index`.
    pub(crate) fn started(&mut self, model_index: usize, worker: usize, started_at: Instant) {
        self.inflight.insert(model_index, Inflight { worker, started_at });
    }

    /// Forget a finished invocation. Returns `false` if it had already been
    /// declared overrun.
    pub(crate) fn finished(&mut self, model_index: usize) -> bool {
        self.inflight.remove(&model_index).is_some()
    }

    /// Earliest instant at which a tracked invocation overruns, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let timeout = self.timeout?;
        self.inflight
            .values()
            .map(|entry| entry.started_at + timeout)
            .min()
    }

    /// Remove and return every invocation whose deadline is at or before `now`,
    /// ordered by model index.
    pub(crate) fn take_overruns(&mut self, now: Instant) -> Vec<Overrun> {
        let Some(timeout) = self.timeout else {
            return Vec::new();
        };
        let mut overruns: Vec<Overrun> = self
            .inflight
            .iter()
            .filter(|(_, entry)| entry.started_at + timeout <= now)
            .map(|(&model_index, entry)| Overrun {
                model_index,
                worker: entry.worker,
            })
            .collect();
        overruns.sort_by_key(|overrun| overrun.model_index);
        for overrun in &overruns {
            self.inflight.remove(&overrun.model_index);
        }
        overruns
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
