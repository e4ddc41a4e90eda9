use std::path::{Path, PathBuf};

use crate::types::{CaptureError, Frame, FrameSource};

/// Serves the contents of an image file as if it were a camera.
///
/// The file is re-read on every snapshot, so replacing it on disk between
/// cycles changes what the detectors see.
pub struct StillImageSource {
    path: PathBuf,
}

impl StillImageSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl FrameSource for StillImageSource {
    fn snapshot(&mut self) -> Result<Frame, CaptureError> {
        let data = std::fs::read(&self.path)?;
        if data.is_empty() {
            return Err(CaptureError::Empty {
                uri: self.path.display().to_string(),
            });
        }
        Ok(Frame::stamped_now(data))
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}
