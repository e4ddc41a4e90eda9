use std::{io, process::ExitStatus};

use chrono::Utc;
use thiserror::Error;

/// Single encoded still captured from a video source.
///
/// A frame is never mutated after capture; the cycle that captured it shares it
/// read-only with its detector workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Capture time in nanoseconds since the Unix epoch.
    pub timestamp_ns: i64,
    /// Encoded image bytes exactly as produced by the source.
    pub data: Vec<u8>,
}

impl Frame {
    /// Wrap freshly captured bytes, stamping them with the current time.
    pub fn stamped_now(data: Vec<u8>) -> Self {
        Self {
            timestamp_ns: now_nanos(),
            data,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to launch capture process for {uri:?}")]
    Spawn {
        uri: String,
        #[source]
        source: io::Error,
    },
    #[error("capture device {uri:?} exited with {status}: {stderr}")]
    Device {
        uri: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("capture device {uri:?} returned an empty frame")]
    Empty { uri: String },
    #[error("capture from {uri:?} did not complete within {timeout_ms} ms")]
    TimedOut { uri: String, timeout_ms: u128 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Anything able to hand out one frame per call.
///
/// Implementations perform blocking device I/O and are not retried by callers.
/// Taking `&mut self` keeps snapshots on one device strictly sequential.
pub trait FrameSource: Send {
    fn snapshot(&mut self) -> Result<Frame, CaptureError>;

    /// Short label used in logs and run records.
    fn describe(&self) -> String;
}

/// Wall-clock nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000))
}
