//! Single-frame capture adapters.
//!
//! Every source implements [`FrameSource`]: one blocking call, one frame, no
//! background threads left running between calls.

mod ffmpeg;
mod still;
mod types;

pub use ffmpeg::{DEFAULT_CAPTURE_TIMEOUT, FfmpegSnapshotSource, SnapshotFormat};
pub use still::StillImageSource;
pub use types::{CaptureError, Frame, FrameSource, now_nanos};
