//! Detector backed by an external program.
//!
//! The program receives the encoded frame on stdin and prints its detections
//! as JSON on stdout, either a bare array or an object with a `detections`
//! field:
//!
//! ```text
//! [{"class": "car", "confidence": 0.91, "bbox": [12.0, 40.5, 220.0, 180.0]}]
//! ```

use std::{
    io::{Read, Write},
    process::{Command, Stdio},
    thread,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::trace;

use crate::detector::{Detection, Detections, Detector};

pub struct CommandDetector {
    program: String,
    args: Vec<String>,
    confidence_threshold: f32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandOutput {
    Bare(Vec<Detection>),
    Wrapped { detections: Vec<Detection> },
}

impl CommandDetector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            confidence_threshold: 0.0,
        }
    }

    /// Split a shell-like command line on whitespace into program and args.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .with_context(|| format!("empty detector command {line:?}"))?;
        Ok(Self::new(program, parts.collect()))
    }

    /// Override the confidence threshold used for filtering detections.
    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Detector for CommandDetector {
    fn detect(&self, image: &[u8]) -> Result<Detections> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to launch detector {:?}", self.program))?;

        let mut stdin = child
            .stdin
            .take()
            .context("detector stdin was not captured")?;
        let payload = image.to_vec();
        let writer = thread::spawn(move || stdin.write_all(&payload));

        // Stderr is drained alongside stdout; either pipe can fill first.
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        let mut stdout = Vec::new();
        if let Some(mut pipe) = child.stdout.take() {
            if let Err(err) = pipe.read_to_end(&mut stdout) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err).context("failed to read detector stdout");
            }
        }
        let status = child.wait()?;
        let stderr = stderr_reader
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();

        // A detector may exit before consuming all input; only its status matters.
        let _ = writer.join();

        if !status.success() {
            bail!(
                "detector {:?} exited with {status}: {}",
                self.program,
                String::from_utf8_lossy(&stderr).trim()
            );
        }

        trace!(program = %self.program, bytes = stdout.len(), "detector output");
        let parsed: CommandOutput = serde_json::from_slice(&stdout)
            .with_context(|| format!("detector {:?} produced malformed JSON", self.program))?;
        let detections = match parsed {
            CommandOutput::Bare(list) => list,
            CommandOutput::Wrapped { detections } => detections,
        };

        for det in &detections {
            if !(0.0..=1.0).contains(&det.confidence) {
                bail!(
                    "detector {:?} reported confidence {} outside [0, 1]",
                    self.program,
                    det.confidence
                );
            }
        }

        Ok(Detections::new(detections).filtered(self.confidence_threshold))
    }
}
