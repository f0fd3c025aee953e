//! Native worker thread for off-task pipeline processing.
//!
//! [`PipelineWorker`] runs `crackdiff_pipeline::worker::handle_request` on
//! a dedicated OS thread and streams its replies back over a channel. The
//! orchestrating task never touches pixels while the worker runs, so it
//! stays responsive to priority changes and aborts.
//!
//! Dropping a `PipelineWorker` discards it: the request's cancel flag is
//! raised, so the thread stops at its next check, and any later message
//! from the thread is ignored. [`WorkerExit`] tells when the thread has
//! actually returned.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crackdiff_pipeline::worker::{WorkerReply, WorkerRequest, handle_request};
use crackdiff_pipeline::{CancelFlag, CompareOutcome, Phase, PipelineError};
use tokio::sync::{mpsc, watch};

/// Errors that end a worker run without an outcome.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The thread could not be started.
    #[error("failed to start worker: {0}")]
    Spawn(String),

    /// The thread panicked.
    #[error("worker crashed: {0}")]
    Crashed(String),

    /// The thread went away without a terminal reply.
    #[error("worker exited without a result")]
    Vanished,

    /// The pipeline itself reported an error.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Something the worker thread sent back.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A protocol reply.
    Reply(WorkerReply),
    /// The thread panicked with this message.
    Crashed(String),
}

/// Resolves once a worker thread has returned.
#[derive(Debug, Clone)]
pub struct WorkerExit(watch::Receiver<()>);

impl WorkerExit {
    /// Whether the thread has returned.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.0.has_changed().is_err()
    }

    /// Wait for the thread to return.
    pub async fn wait(mut self) {
        // The thread owns the only sender and never sends on it.
        while self.0.changed().await.is_ok() {}
    }
}

/// Handle to one in-flight request on a worker thread.
#[derive(Debug)]
pub struct PipelineWorker {
    id: u64,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    cancel: CancelFlag,
    exit: WorkerExit,
}

impl PipelineWorker {
    /// Start a thread that handles `request`.
    ///
    /// The request's images are moved into the thread.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Spawn`] if the OS refuses a new thread.
    pub fn spawn(request: WorkerRequest) -> Result<Self, WorkerError> {
        let id = request.id;
        let cancel = request.cancel.clone();
        let (tx, events) = mpsc::unbounded_channel();
        let (alive, exit) = watch::channel(());
        std::thread::Builder::new()
            .name(format!("crackdiff-worker-{id}"))
            .spawn(move || {
                let _alive = alive;
                let replies = tx.clone();
                let result = catch_unwind(AssertUnwindSafe(|| {
                    handle_request(request, |reply| {
                        // A closed channel means the run was discarded.
                        let _ = replies.send(WorkerEvent::Reply(reply));
                    });
                }));
                if let Err(payload) = result {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(id, %message, "worker panicked");
                    let _ = tx.send(WorkerEvent::Crashed(message));
                }
            })
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;
        tracing::debug!(id, "worker started");
        Ok(Self {
            id,
            events,
            cancel,
            exit: WorkerExit(exit),
        })
    }

    /// The id of the request this worker is handling.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Ask the thread to stop at its next check.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A handle that resolves when the thread returns.
    #[must_use]
    pub fn exit(&self) -> WorkerExit {
        self.exit.clone()
    }

    /// Wait for the next event; `None` once the thread has gone away.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Drive the worker to completion, reporting each phase to
    /// `on_progress`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Pipeline`] if the pipeline failed,
    /// [`WorkerError::Crashed`] if the thread panicked, and
    /// [`WorkerError::Vanished`] if it stopped without answering.
    pub async fn finish(
        mut self,
        mut on_progress: impl FnMut(Phase) + Send,
    ) -> Result<CompareOutcome, WorkerError> {
        while let Some(event) = self.next_event().await {
            match event {
                WorkerEvent::Reply(reply) if reply.id() != self.id => {
                    tracing::warn!(expected = self.id, got = reply.id(), "ignoring stale reply");
                }
                WorkerEvent::Reply(WorkerReply::Progress { phase, .. }) => on_progress(phase),
                WorkerEvent::Reply(WorkerReply::Done { outcome, .. }) => return Ok(*outcome),
                WorkerEvent::Reply(WorkerReply::Failed { error, .. }) => {
                    return Err(WorkerError::Pipeline(error));
                }
                WorkerEvent::Crashed(message) => return Err(WorkerError::Crashed(message)),
            }
        }
        Err(WorkerError::Vanished)
    }
}

impl Drop for PipelineWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use crackdiff_pipeline::{CompareConfig, FeatureMatcherKind, RgbaImage};
    use image::Rgba;

    use super::*;

    fn request(id: u64, baseline: RgbaImage, current: RgbaImage) -> WorkerRequest {
        WorkerRequest {
            id,
            baseline,
            current,
            config: CompareConfig {
                feature_matcher: FeatureMatcherKind::Disabled,
                ..CompareConfig::default()
            },
            cancel: CancelFlag::new(),
        }
    }

    fn textured(side: u32) -> RgbaImage {
        RgbaImage::from_fn(side, side, |x, y| {
            let v = u8::try_from((x * 7 + y * 13 + (x * y) % 17) % 251).unwrap();
            Rgba([v, v, v, 255])
        })
    }

    #[tokio::test]
    async fn runs_request_and_reports_phases() {
        let img = RgbaImage::from_pixel(40, 30, Rgba([70, 70, 70, 255]));
        let worker = PipelineWorker::spawn(request(1, img.clone(), img)).unwrap();
        assert_eq!(worker.id(), 1);

        let mut phases = Vec::new();
        let outcome = worker.finish(|p| phases.push(p)).await.unwrap();
        assert_eq!(phases, Phase::ALL);
        assert!(outcome.report.used_fallback);
        assert_eq!(outcome.image.dimensions(), (40, 30));
    }

    #[tokio::test]
    async fn pipeline_error_is_surfaced() {
        let worker =
            PipelineWorker::spawn(request(2, RgbaImage::new(0, 0), RgbaImage::new(3, 3))).unwrap();
        let err = worker.finish(|_| {}).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Pipeline(PipelineError::InvalidDimensions { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_worker_stops_and_exits() {
        let img = textured(900);
        let mut req = request(4, img.clone(), img);
        req.config.feature_matcher = FeatureMatcherKind::Orb;
        let worker = PipelineWorker::spawn(req).unwrap();
        let exit = worker.exit();
        worker.cancel();

        let err = worker.finish(|_| {}).await.unwrap_err();
        assert!(matches!(err, WorkerError::Pipeline(PipelineError::Cancelled)));
        tokio::time::timeout(Duration::from_secs(10), exit.clone().wait())
            .await
            .unwrap();
        assert!(exit.has_exited());
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_thread() {
        let img = textured(900);
        let mut req = request(6, img.clone(), img);
        req.config.feature_matcher = FeatureMatcherKind::Orb;
        let cancel = req.cancel.clone();
        let worker = PipelineWorker::spawn(req).unwrap();
        let exit = worker.exit();
        drop(worker);

        assert!(cancel.is_cancelled());
        tokio::time::timeout(Duration::from_secs(10), exit.wait())
            .await
            .unwrap();
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
