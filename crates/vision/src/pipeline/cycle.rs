//! One capture followed by a bounded fan-out to every model and a full fan-in.
//!
//! Workers are plain threads spawned per cycle. They pull model indices from a
//! job queue, run the model against the shared frame, and report back over an
//! event channel read only by the control thread. The control thread owns all
//! bookkeeping, so workers never share mutable state. A worker abandoned after
//! a timeout is told to stop and never takes another job once its stuck
//! invocation returns.

use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ml_core::Detections;
use tracing::{debug, error, warn};
use video_ingest::{CaptureError, Frame, FrameSource};

use crate::pipeline::{
    data::{CycleResult, ModelError, ModelErrorKind},
    pool::{ModelHandle, ModelInvocationError, ModelPool},
    telemetry,
    watchdog::InvocationWatchdog,
};

type Outcome = Result<Detections, ModelInvocationError>;

enum WorkerEvent {
    Started {
        model_index: usize,
        worker: usize,
        at: Instant,
    },
    Finished {
        model_index: usize,
        outcome: Outcome,
    },
    Exited {
        worker: usize,
    },
}

/// Number of fan-out workers for a cycle: the configured cap, limited by the
/// host's parallelism and by how many models there are to run.
pub fn effective_workers(cap: usize, model_count: usize) -> usize {
    let available = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cap.min(available).min(model_count).max(1)
}

pub struct CycleRunner {
    pool: ModelPool,
    workers: usize,
    model_timeout: Option<Duration>,
    cycles: u64,
}

impl CycleRunner {
    pub fn new(pool: ModelPool, worker_pool_cap: usize, model_timeout: Option<Duration>) -> Self {
        let workers = effective_workers(worker_pool_cap, pool.len());
        Self {
            pool,
            workers,
            model_timeout,
            cycles: 0,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn pool(&self) -> &ModelPool {
        &self.pool
    }

    /// Capture one frame and run every model on it.
    ///
    /// A capture failure aborts the cycle before any model runs. Model failures
    /// never do; they end up in [`CycleResult::errors`].
    pub fn run_cycle(&mut self, source: &mut dyn FrameSource) -> Result<CycleResult, CaptureError> {
        let frame = tracing::info_span!("capture.snapshot").in_scope(|| source.snapshot())?;
        self.cycles += 1;
        let cycle = self.cycles;
        let timestamp_ns = frame.timestamp_ns;

        let span = tracing::info_span!(
            "cycle",
            cycle,
            timestamp = timestamp_ns,
            models = self.pool.len(),
            workers = self.workers
        );
        let _guard = span.enter();
        let started = Instant::now();

        let outcomes = self.fan_out(Arc::new(frame));

        let mut results = BTreeMap::new();
        let mut errors = Vec::new();
        for (handle, outcome) in self.pool.handles().iter().zip(outcomes) {
            match outcome {
                Ok(detections) => {
                    results.insert(handle.name().to_string(), detections);
                }
                Err(err) => {
                    warn!(model = %err.model_name, kind = %err.kind, "{}", err.message);
                    metrics::counter!(
                        "runner_model_errors_total",
                        "model" => err.model_name.clone(),
                        "kind" => err.kind.label()
                    )
                    .increment(1);
                    errors.push(ModelError::from(err));
                }
            }
        }

        let elapsed = started.elapsed();
        metrics::counter!("runner_cycles_total").increment(1);
        metrics::histogram!("runner_cycle_latency_seconds").record(elapsed.as_secs_f64());
        debug!(
            ok = results.len(),
            failed = errors.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "cycle complete"
        );

        Ok(CycleResult {
            cycle,
            timestamp_ns,
            results,
            errors,
        })
    }

    /// Run every model once against `frame` and return outcomes in pool order.
    fn fan_out(&self, frame: Arc<Frame>) -> Vec<Outcome> {
        let models = self.pool.shared();
        let model_count = models.len();

        let (job_tx, job_rx) = crossbeam_channel::bounded::<usize>(model_count);
        for index in 0..model_count {
            // Capacity equals the number of jobs, so this never blocks.
            let _ = job_tx.send(index);
        }
        drop(job_tx);
        let (event_tx, event_rx) = crossbeam_channel::unbounded::<WorkerEvent>();

        let mut workers: HashMap<usize, WorkerSlot> = HashMap::with_capacity(self.workers);
        let mut next_worker = 0usize;
        for _ in 0..self.workers {
            match spawn_worker(
                next_worker,
                models.clone(),
                frame.clone(),
                job_rx.clone(),
                event_tx.clone(),
            ) {
                Ok(slot) => {
                    workers.insert(next_worker, slot);
                }
                Err(err) => error!("failed to spawn model worker #{next_worker}: {err}"),
            }
            next_worker += 1;
        }

        let mut outcomes: Vec<Option<Outcome>> = (0..model_count).map(|_| None).collect();
        let mut pending = model_count;
        let mut live = workers.len();
        let mut watchdog = InvocationWatchdog::new(self.model_timeout);

        while pending > 0 {
            if live == 0 {
                for (index, slot) in outcomes.iter_mut().enumerate() {
                    if slot.is_none() {
                        *slot = Some(Err(models[index].error(
                            ModelErrorKind::WorkerLost,
                            "no model worker was available to run this model".to_string(),
                        )));
                    }
                }
                break;
            }

            let event = match watchdog.next_deadline() {
                Some(deadline) => match event_rx.recv_deadline(deadline) {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match event_rx.recv() {
                    Ok(event) => Some(event),
                    Err(_) => break,
                },
            };

            match event {
                Some(WorkerEvent::Started {
                    model_index,
                    worker,
                    at,
                }) => watchdog.started(model_index, worker, at),
                Some(WorkerEvent::Finished {
                    model_index,
                    outcome,
                }) => {
                    if watchdog.finished(model_index) && outcomes[model_index].is_none() {
                        outcomes[model_index] = Some(outcome);
                        pending -= 1;
                    }
                }
                Some(WorkerEvent::Exited { worker }) => {
                    if workers.get(&worker).is_some_and(|slot| !slot.is_cancelled()) {
                        live = live.saturating_sub(1);
                    }
                }
                None => {
                    let timeout = watchdog.timeout().unwrap_or_default();
                    for overrun in watchdog.take_overruns(Instant::now()) {
                        let handle = &models[overrun.model_index];
                        error!(
                            model = handle.name(),
                            worker = overrun.worker,
                            "model exceeded its {} ms deadline; abandoning worker",
                            timeout.as_millis()
                        );
                        outcomes[overrun.model_index] = Some(Err(handle.error(
                            ModelErrorKind::TimedOut,
                            format!("no result within {} ms", timeout.as_millis()),
                        )));
                        pending -= 1;
                        if let Some(slot) = workers
                            .get(&overrun.worker)
                            .filter(|slot| !slot.is_cancelled())
                        {
                            slot.cancel();
                            live = live.saturating_sub(1);
                        }

                        // Keep the pool at strength for models still queued.
                        if !job_rx.is_empty() {
                            match spawn_worker(
                                next_worker,
                                models.clone(),
                                frame.clone(),
                                job_rx.clone(),
                                event_tx.clone(),
                            ) {
                                Ok(slot) => {
                                    workers.insert(next_worker, slot);
                                    live += 1;
                                }
                                Err(err) => {
                                    error!("failed to spawn replacement worker #{next_worker}: {err}")
                                }
                            }
                            next_worker += 1;
                        }
                    }
                }
            }
        }

        drop(event_tx);
        drop(job_rx);
        for (worker, slot) in workers {
            if slot.is_cancelled() {
                continue;
            }
            if slot.handle.join().is_err() {
                error!("model worker #{worker} panicked outside a model invocation");
            }
        }

        outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| {
                outcome.unwrap_or_else(|| {
                    Err(models[index].error(
                        ModelErrorKind::WorkerLost,
                        "model worker stopped before reporting".to_string(),
                    ))
                })
            })
            .collect()
    }
}

struct WorkerSlot {
    handle: JoinHandle<()>,
    cancelled: Arc<AtomicBool>,
}

impl WorkerSlot {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Sends `Exited` when a worker leaves its loop, including by unwinding.
struct ExitNotice {
    worker: usize,
    events: Sender<WorkerEvent>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.events.send(WorkerEvent::Exited {
            worker: self.worker,
        });
    }
}

fn spawn_worker(
    worker: usize,
    models: Arc<[ModelHandle]>,
    frame: Arc<Frame>,
    jobs: Receiver<usize>,
    events: Sender<WorkerEvent>,
) -> io::Result<WorkerSlot> {
    let cancelled = Arc::new(AtomicBool::new(false));
    let stop = cancelled.clone();
    let handle = telemetry::spawn_thread(format!("model-worker-{worker}"), move || {
        let _exit = ExitNotice {
            worker,
            events: events.clone(),
        };
        // An abandoned worker stops before taking another job.
        while !stop.load(Ordering::Acquire) {
            let Ok(model_index) = jobs.recv() else {
                break;
            };
            let handle = &models[model_index];
            let at = Instant::now();
            if events
                .send(WorkerEvent::Started {
                    model_index,
                    worker,
                    at,
                })
                .is_err()
            {
                break;
            }

            let outcome = tracing::debug_span!("model.invoke", model = handle.name(), worker)
                .in_scope(|| handle.invoke(&frame));
            metrics::histogram!(
                "runner_model_latency_seconds",
                "model" => handle.name().to_string()
            )
            .record(at.elapsed().as_secs_f64());

            if events
                .send(WorkerEvent::Finished {
                    model_index,
                    outcome,
                })
                .is_err()
            {
                break;
            }
        }
    })?;
    Ok(WorkerSlot { handle, cancelled })
}
