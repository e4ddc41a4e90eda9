//! Runs a fixed set of object detectors against camera snapshots for a bounded
//! window of time and publishes what they found.

pub mod pipeline;

pub use pipeline::{RunnerCliArgs, RunnerConfig, run};
