//! Named detector handles scheduled by the cycle runner.

use std::{
    any::Any,
    collections::HashSet,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use ml_core::{Detections, Detector};
use thiserror::Error;
use video_ingest::Frame;

use crate::pipeline::data::{ModelError, ModelErrorKind};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("at least one model is required")]
    Empty,
    #[error("model names must not be empty")]
    EmptyName,
    #[error("model name {0:?} is registered more than once")]
    DuplicateName(String),
}

/// Failure of a single model invocation, attributed to that model.
#[derive(Debug, Clone, Error)]
#[error("model {model_name} failed ({kind}): {message}")]
pub struct ModelInvocationError {
    pub model_name: String,
    pub kind: ModelErrorKind,
    pub message: String,
}

impl From<ModelInvocationError> for ModelError {
    fn from(err: ModelInvocationError) -> Self {
        ModelError {
            model_name: err.model_name,
            kind: err.kind,
            message: err.message,
        }
    }
}

/// A detector plus the name its results and errors are published under.
pub struct ModelHandle {
    name: String,
    detector: Arc<dyn Detector>,
    in_flight: AtomicBool,
}

impl ModelHandle {
    pub fn new<D: Detector + 'static>(name: impl Into<String>, detector: D) -> Self {
        Self::from_arc(name, Arc::new(detector))
    }

    pub fn from_arc(name: impl Into<String>, detector: Arc<dyn Detector>) -> Self {
        Self {
            name: name.into(),
            detector,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the detector on `frame`, converting errors and panics into a
    /// [`ModelInvocationError`].
    ///
    /// Refuses to start while an earlier invocation of this handle is still
    /// running.
    pub fn invoke(&self, frame: &Frame) -> Result<Detections, ModelInvocationError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(self.error(
                ModelErrorKind::Busy,
                "previous invocation has not returned yet".to_string(),
            ));
        }
        let _release = InFlightRelease(&self.in_flight);

        match panic::catch_unwind(AssertUnwindSafe(|| self.detector.detect(&frame.data))) {
            Ok(Ok(detections)) => Ok(detections),
            Ok(Err(err)) => Err(self.error(ModelErrorKind::Inference, format!("{err:#}"))),
            Err(payload) => Err(self.error(ModelErrorKind::Panicked, panic_message(&*payload))),
        }
    }

    pub(crate) fn error(&self, kind: ModelErrorKind, message: String) -> ModelInvocationError {
        ModelInvocationError {
            model_name: self.name.clone(),
            kind,
            message,
        }
    }
}

struct InFlightRelease<'a>(&'a AtomicBool);

impl Drop for InFlightRelease<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "detector panicked".to_string()
    }
}

/// Fixed, ordered set of uniquely named models.
#[derive(Clone)]
pub struct ModelPool {
    handles: Arc<[ModelHandle]>,
}

impl ModelPool {
    pub fn new(handles: Vec<ModelHandle>) -> Result<Self, PoolError> {
        if handles.is_empty() {
            return Err(PoolError::Empty);
        }
        let mut seen = HashSet::new();
        for handle in &handles {
            if handle.name.trim().is_empty() {
                return Err(PoolError::EmptyName);
            }
            if !seen.insert(handle.name.as_str()) {
                return Err(PoolError::DuplicateName(handle.name.clone()));
            }
        }
        Ok(Self {
            handles: handles.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handles.iter().map(|handle| handle.name())
    }

    pub(crate) fn handles(&self) -> &[ModelHandle] {
        &self.handles
    }

    pub(crate) fn shared(&self) -> Arc<[ModelHandle]> {
        self.handles.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use anyhow::{Result, anyhow};
    use ml_core::Detection;

    use super::*;

    fn frame() -> Frame {
        Frame {
            timestamp_ns: 1,
            data: vec![1, 2, 3],
        }
    }

    fn ok_detector(_: &[u8]) -> Result<Detections> {
        Ok(Detections::new(vec![Detection {
            class: "car".into(),
            confidence: 0.5,
            bbox: [0.0; 4],
        }]))
    }

    #[test]
    fn pool_rejects_empty_duplicate_and_blank_names() {
        assert!(matches!(ModelPool::new(vec![]), Err(PoolError::Empty)));
        let dup = vec![
            ModelHandle::new("a", ok_detector),
            ModelHandle::new("a", ok_detector),
        ];
        assert!(matches!(ModelPool::new(dup), Err(PoolError::DuplicateName(name)) if name == "a"));
        assert!(matches!(
            ModelPool::new(vec![ModelHandle::new(" ", ok_detector)]),
            Err(PoolError::EmptyName)
        ));

        let pool = ModelPool::new(vec![
            ModelHandle::new("b", ok_detector),
            ModelHandle::new("a", ok_detector),
        ])
        .unwrap();
        assert_eq!(pool.names().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn invoke_maps_errors_and_panics() {
        let failing = ModelHandle::new("bad", |_: &[u8]| -> Result<Detections> {
            Err(anyhow!("tensor shape mismatch"))
        });
        let err = failing.invoke(&frame()).unwrap_err();
        assert_eq!(err.kind, ModelErrorKind::Inference);
        assert_eq!(err.model_name, "bad");
        assert!(err.message.contains("tensor shape mismatch"));

        let panicking = ModelHandle::new("boom", |_: &[u8]| -> Result<Detections> {
            panic!("out of memory")
        });
        let err = panicking.invoke(&frame()).unwrap_err();
        assert_eq!(err.kind, ModelErrorKind::Panicked);
        assert!(err.message.contains("out of memory"));

        // The in-flight flag is released even after a panic.
        assert_eq!(
            panicking.invoke(&frame()).unwrap_err().kind,
            ModelErrorKind::Panicked
        );
    }

    #[test]
    fn concurrent_invocation_of_one_handle_is_refused() {
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered_tx = std::sync::Mutex::new(entered_tx);
        let release_rx = std::sync::Mutex::new(release_rx);
        let handle = Arc::new(ModelHandle::new("slow", move |_: &[u8]| -> Result<Detections> {
            entered_tx.lock().unwrap().send(()).unwrap();
            release_rx
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5))
                .ok();
            Ok(Detections::default())
        }));

        let worker = {
            let handle = handle.clone();
            thread::spawn(move || handle.invoke(&frame()))
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let err = handle.invoke(&frame()).unwrap_err();
        assert_eq!(err.kind, ModelErrorKind::Busy);

        release_tx.send(()).unwrap();
        assert!(worker.join().unwrap().is_ok());
    }
}
