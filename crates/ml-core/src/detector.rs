use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Upper bound on detections kept per frame.
pub const MAX_DETECTIONS: usize = 512;

/// Single detection returned by a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    pub confidence: f32,
    /// Corner coordinates `[x1, y1, x2, y2]` in source pixels.
    pub bbox: [f32; 4],
}

/// Detections produced by one model for one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Detections {
    pub detections: Vec<Detection>,
}

impl Detections {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Number of detections per class label.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for det in &self.detections {
            *counts.entry(det.class.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Drop detections under `threshold` and cap the list at [`MAX_DETECTIONS`].
    pub fn filtered(mut self, threshold: f32) -> Self {
        self.detections.retain(|det| det.confidence >= threshold);
        self.detections.truncate(MAX_DETECTIONS);
        self
    }
}

/// Uniform capability every detection model exposes.
///
/// Implementations may keep internal state across calls but are never invoked
/// concurrently with themselves by the scheduler.
pub trait Detector: Send + Sync {
    /// Run inference on encoded image bytes.
    fn detect(&self, image: &[u8]) -> Result<Detections>;
}

impl<F> Detector for F
where
    F: Fn(&[u8]) -> Result<Detections> + Send + Sync,
{
    fn detect(&self, image: &[u8]) -> Result<Detections> {
        self(image)
    }
}
