use std::{
    io::Read,
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{RecvTimeoutError, bounded};
use tracing::debug;

use crate::types::{CaptureError, Frame, FrameSource};

/// Default upper bound on a single ffmpeg grab before the child is killed.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Encoding requested from ffmpeg for each snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotFormat {
    Jpeg,
    Png,
}

impl SnapshotFormat {
    fn codec(self) -> &'static str {
        match self {
            SnapshotFormat::Jpeg => "mjpeg",
            SnapshotFormat::Png => "png",
        }
    }
}

/// Grabs one frame per call by running ffmpeg against a device or stream URI.
///
/// A fresh process is launched for every snapshot so that nothing keeps
/// reading the device between cycles.
pub struct FfmpegSnapshotSource {
    uri: String,
    program: String,
    format: SnapshotFormat,
    timeout: Duration,
}

impl FfmpegSnapshotSource {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            program: "ffmpeg".to_string(),
            format: SnapshotFormat::Jpeg,
            timeout: DEFAULT_CAPTURE_TIMEOUT,
        }
    }

    /// Override the ffmpeg executable (useful when it is not on `PATH`).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_format(mut self, format: SnapshotFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        if let Some(index) = parse_device_index(&self.uri) {
            cmd.arg("-f")
                .arg("video4linux2")
                .arg("-i")
                .arg(format!("/dev/video{index}"));
        } else if self.uri.starts_with("rtsp://") || self.uri.starts_with("rtsps://") {
            cmd.arg("-rtsp_transport")
                .arg("tcp")
                .arg("-i")
                .arg(&self.uri);
        } else {
            cmd.arg("-i").arg(&self.uri);
        }

        cmd.arg("-frames:v")
            .arg("1")
            .arg("-an")
            .arg("-f")
            .arg("image2pipe")
            .arg("-vcodec")
            .arg(self.format.codec())
            .arg("-");

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl FrameSource for FfmpegSnapshotSource {
    fn snapshot(&mut self) -> Result<Frame, CaptureError> {
        let mut child = self
            .build_command()
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                uri: self.uri.clone(),
                source,
            })?;

        let stderr_reader = child.stderr.take().map(drain_pipe);
        let (tx, rx) = bounded(1);
        let stdout_reader = child.stdout.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = tx.send(pipe.read_to_end(&mut buf).map(|_| buf));
            })
        });

        let stdout = match rx.recv_timeout(self.timeout) {
            Ok(read) => read,
            Err(RecvTimeoutError::Timeout) => {
                let _ = child.kill();
                let _ = child.wait();
                join_reader(stdout_reader);
                let _ = collect_pipe(stderr_reader);
                return Err(CaptureError::TimedOut {
                    uri: self.uri.clone(),
                    timeout_ms: self.timeout.as_millis(),
                });
            }
            Err(RecvTimeoutError::Disconnected) => Err(std::io::Error::other(
                "ffmpeg stdout was not captured",
            )),
        };
        let stdout = match stdout {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Io(err));
            }
        };
        let status = child.wait()?;
        join_reader(stdout_reader);
        let stderr = collect_pipe(stderr_reader);

        if !status.success() {
            return Err(CaptureError::Device {
                uri: self.uri.clone(),
                status,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        if stdout.is_empty() {
            return Err(CaptureError::Empty {
                uri: self.uri.clone(),
            });
        }

        let frame = Frame::stamped_now(stdout);
        debug!(
            source = %self.uri,
            bytes = frame.data.len(),
            timestamp = frame.timestamp_ns,
            "captured snapshot"
        );
        Ok(frame)
    }

    fn describe(&self) -> String {
        format!("ffmpeg:{}", self.uri)
    }
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect_pipe(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default()
}

fn join_reader(reader: Option<JoinHandle<()>>) {
    if let Some(reader) = reader {
        let _ = reader.join();
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_index_accepts_bare_numbers_and_dev_paths() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam/stream"), None);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let mut source = FfmpegSnapshotSource::new("0").with_program("definitely-not-ffmpeg-xyz");
        let err = source.snapshot().unwrap_err();
        assert!(matches!(err, CaptureError::Spawn { .. }), "got {err:?}");
    }

    #[cfg(unix)]
    fn fake_ffmpeg(dir: &std::path::Path, script: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[test]
    fn stalled_grab_is_killed_at_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_ffmpeg(dir.path(), "exec sleep 30");
        let mut source = FfmpegSnapshotSource::new("0")
            .with_program(program)
            .with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = source.snapshot().unwrap_err();
        assert!(matches!(err, CaptureError::TimedOut { .. }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn noisy_stderr_does_not_delay_the_frame() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_ffmpeg(
            dir.path(),
            "head -c 200000 /dev/zero | tr '\\0' x >&2; printf frame",
        );
        let mut source = FfmpegSnapshotSource::new("0")
            .with_program(program)
            .with_timeout(Duration::from_secs(5));

        let frame = source.snapshot().unwrap();
        assert_eq!(frame.data, b"frame");
    }

    #[cfg(unix)]
    #[test]
    fn failing_grab_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_ffmpeg(dir.path(), "echo 'no such device' >&2; exit 1");
        let mut source = FfmpegSnapshotSource::new("0").with_program(program);

        match source.snapshot() {
            Err(CaptureError::Device { stderr, .. }) => assert_eq!(stderr, "no such device"),
            other => panic!("expected device error, got {other:?}"),
        }
    }

    #[test]
    fn command_requests_a_single_frame() {
        let source = FfmpegSnapshotSource::new("rtsp://cam/stream").with_format(SnapshotFormat::Png);
        let cmd = source.build_command();
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let frames = args.iter().position(|a| a == "-frames:v").unwrap();
        assert_eq!(args[frames + 1], "1");
        assert!(args.contains(&"png".to_string()));
        assert!(args.contains(&"tcp".to_string()));
    }
}
