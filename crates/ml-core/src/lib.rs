//! Detector interface shared by every model the runner can schedule.

pub mod command;
pub mod detector;

pub use command::CommandDetector;
pub use detector::{Detection, Detections, Detector, MAX_DETECTIONS};
