//! Run orchestration: debounce, priority, cancellation and timeout.
//!
//! A [`PipelineController`] owns at most one comparison at a time. A run
//! moves through `Loading → Matching → Aligning → Diffing → Done`, or to
//! `Aborted` when the caller gives up on it. Loading happens on the
//! caller's tokio runtime; everything from feature detection onward runs
//! on a [`PipelineWorker`] thread.
//!
//! Every accepted [`run`](PipelineController::run) ends with exactly one
//! call to its completion callback, unless it is aborted first, in which
//! case the callback is never called.
//!
//! Abort, timeout and drop raise the run's cancel flag, so its worker
//! thread stops at the next stage boundary. A later run waits for that
//! thread to return before starting its own, keeping at most one worker
//! thread per controller.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crackdiff_pipeline::worker::WorkerRequest;
use crackdiff_pipeline::{
    CancelFlag, CompareConfig, CompareReport, Phase, PipelineError, RgbaImage,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

use crate::bootstrap::ensure_ready;
use crate::loader::{ImageFetcher, LoadError, load};
use crate::worker::{PipelineWorker, WorkerError, WorkerExit};

/// Longest status reason shown before truncation.
const MAX_REASON_CHARS: usize = 150;

/// How urgently a run should start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    /// Wait out the debounce before starting.
    #[default]
    Background,
    /// Start immediately.
    Foreground,
}

/// Where the controller currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Nothing has run yet.
    #[default]
    Idle,
    /// Fetching and decoding the images (or waiting on the debounce).
    Loading,
    /// Detecting and matching features.
    Matching,
    /// Warping the current image.
    Aligning,
    /// Computing and painting the difference.
    Diffing,
    /// The last run delivered its result.
    Done,
    /// The last run was aborted.
    Aborted,
}

impl From<Phase> for Status {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Matching => Self::Matching,
            Phase::Aligning => Self::Aligning,
            Phase::Diffing => Self::Diffing,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Waiting",
            Self::Loading => "Loading images...",
            Self::Matching => "Matching features...",
            Self::Aligning => "Aligning images...",
            Self::Diffing => "Comparing images...",
            Self::Done => "Done",
            Self::Aborted => "Processing aborted",
        };
        f.write_str(s)
    }
}

/// Controller tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Delay before a background run starts.
    pub debounce: Duration,
    /// Upper bound on a run, from the end of the debounce to delivery.
    pub timeout: Duration,
    /// Pipeline tuning passed to every run.
    pub compare: CompareConfig,
}

impl ControllerConfig {
    /// Default [`debounce`](Self::debounce).
    pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);
    /// Default [`timeout`](Self::timeout).
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            debounce: Self::DEFAULT_DEBOUNCE,
            timeout: Self::DEFAULT_TIMEOUT,
            compare: CompareConfig::default(),
        }
    }
}

/// The image a successful run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultImage {
    /// A freshly computed highlight image.
    Image(RgbaImage),
    /// One of the inputs, passed through untouched.
    Source(String),
}

/// Why a run ended without an image.
#[derive(Debug, thiserror::Error)]
pub enum FailureReason {
    /// Neither image reference was given.
    #[error("no image reference given")]
    MissingInput,

    /// An image could not be fetched or decoded.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// The pipeline rejected its input.
    #[error(transparent)]
    Pipeline(PipelineError),

    /// The worker crashed or disappeared.
    #[error("worker error: {0}")]
    Worker(String),

    /// The run took longer than the configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<WorkerError> for FailureReason {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Pipeline(e) => Self::Pipeline(e),
            other => Self::Worker(other.to_string()),
        }
    }
}

/// The single terminal outcome of a run.
#[derive(Debug)]
pub enum PipelineResult {
    /// An image to show.
    Success {
        /// The image.
        image: ResultImage,
        /// Whether alignment failed and a raw comparison was made.
        used_fallback: bool,
        /// Details for computed images; `None` for pass-throughs.
        report: Option<Box<CompareReport>>,
    },
    /// Nothing to show.
    Failure(FailureReason),
}

impl PipelineResult {
    fn passthrough(reference: &str) -> Self {
        Self::Success {
            image: ResultImage::Source(reference.to_owned()),
            used_fallback: false,
            report: None,
        }
    }

    /// Whether the run produced an image.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The status message describing this result.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Success {
                used_fallback: true,
                ..
            } => "Alignment failed, showing a raw comparison".to_owned(),
            Self::Success { .. } => Status::Done.to_string(),
            Self::Failure(reason) => {
                let reason = reason.to_string();
                if reason.chars().count() > MAX_REASON_CHARS {
                    let short: String = reason.chars().take(MAX_REASON_CHARS).collect();
                    format!("Analysis failed: {short}...")
                } else {
                    format!("Analysis failed: {reason}")
                }
            }
        }
    }
}

/// Rejections from [`PipelineController::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// A run is already pending or in flight.
    #[error("already processing")]
    Busy,

    /// `run` was called outside a tokio runtime.
    #[error("no async runtime available")]
    NoRuntime,
}

/// Handle to an accepted run.
///
/// Dropping it does not cancel the run; use
/// [`PipelineController::abort`] for that.
#[derive(Debug)]
pub struct Subscription {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// The run's generation number.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the run has stopped, by completing or being aborted.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait until the run has stopped.
    ///
    /// # Panics
    ///
    /// Resumes the panic if the completion callback panicked.
    pub async fn finished(self) {
        let Some(task) = self.task else {
            return;
        };
        match task.await {
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            // A cancelled task is an aborted run, which is not an error.
            Ok(()) | Err(_) => {}
        }
    }
}

/// Controller state shared with the run task.
#[derive(Debug, Default)]
struct State {
    status: Status,
    message: String,
    generation: u64,
    running: bool,
    task: Option<AbortHandle>,
    cancel: Option<CancelFlag>,
    /// The most recently started worker thread.
    worker: Option<WorkerExit>,
}

impl State {
    fn set(&mut self, status: Status, message: impl Into<String>) {
        self.status = status;
        self.message = message.into();
    }

    /// Supersede the current run and stop its task and worker.
    fn cancel_run(&mut self) {
        self.generation += 1;
        self.running = false;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

/// Orchestrates one comparison at a time.
///
/// Must be used from within a tokio runtime.
pub struct PipelineController<F> {
    fetcher: Arc<F>,
    config: ControllerConfig,
    state: Arc<Mutex<State>>,
    priority: watch::Sender<Priority>,
}

impl<F: ImageFetcher + 'static> PipelineController<F> {
    /// Create an idle controller.
    #[must_use]
    pub fn new(fetcher: F, config: ControllerConfig) -> Self {
        let state = State {
            message: Status::Idle.to_string(),
            ..State::default()
        };
        Self {
            fetcher: Arc::new(fetcher),
            config,
            state: Arc::new(Mutex::new(state)),
            priority: watch::Sender::new(Priority::default()),
        }
    }

    /// The controller's configuration.
    #[must_use]
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Compare `current` against `baseline` and call `on_complete` once
    /// with the outcome.
    ///
    /// A missing reference passes the other one through; identical
    /// references pass the baseline through. Both happen immediately,
    /// without loading anything.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Busy`] while another run is pending or in
    /// flight and [`SubmitError::NoRuntime`] outside a tokio runtime.
    pub fn run(
        &self,
        baseline: Option<&str>,
        current: Option<&str>,
        priority: Priority,
        on_complete: impl FnOnce(PipelineResult) + Send + 'static,
    ) -> Result<Subscription, SubmitError> {
        let mut state = lock(&self.state);
        if state.running {
            tracing::debug!("run rejected, already processing");
            return Err(SubmitError::Busy);
        }

        let (baseline, current) = match (baseline, current) {
            (Some(b), Some(c)) if b == c => {
                state.set(Status::Done, "Same image");
                drop(state);
                on_complete(PipelineResult::passthrough(b));
                return Ok(Subscription {
                    generation: self.generation(),
                    task: None,
                });
            }
            (Some(b), Some(c)) => (b.to_owned(), c.to_owned()),
            (one, other) => {
                state.set(Status::Done, "Image reference missing");
                drop(state);
                let result = one
                    .or(other)
                    .map_or(PipelineResult::Failure(FailureReason::MissingInput), PipelineResult::passthrough);
                on_complete(result);
                return Ok(Subscription {
                    generation: self.generation(),
                    task: None,
                });
            }
        };

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SubmitError::NoRuntime)?;
        state.generation += 1;
        let generation = state.generation;
        state.running = true;
        state.set(Status::Loading, "Waiting to start");
        let cancel = CancelFlag::new();
        state.cancel = Some(cancel.clone());
        self.priority.send_replace(priority);

        let run = Run {
            generation,
            cancel,
            fetcher: Arc::clone(&self.fetcher),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            priority: self.priority.subscribe(),
        };
        let task = runtime.spawn(run.execute(baseline, current, on_complete));
        state.task = Some(task.abort_handle());
        tracing::debug!(generation, ?priority, "run accepted");

        Ok(Subscription {
            generation,
            task: Some(task),
        })
    }

    /// Change the priority of the pending run, and of future runs until
    /// the next [`run`](Self::run) sets it again.
    ///
    /// Raising a run that is still waiting on the debounce to
    /// [`Priority::Foreground`] starts it immediately.
    pub fn set_priority(&self, priority: Priority) {
        self.priority.send_replace(priority);
    }

    /// The current priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        *self.priority.borrow()
    }

    /// Abandon the pending or in-flight run.
    ///
    /// Its worker is told to stop and its callback will never be called.
    /// Returns `false` if nothing was running; a run that has already
    /// delivered its result is unaffected.
    pub fn abort(&self) -> bool {
        let mut state = lock(&self.state);
        if !state.running {
            return false;
        }
        state.cancel_run();
        state.set(Status::Aborted, Status::Aborted.to_string());
        tracing::info!("run aborted");
        true
    }

    /// Whether a run is pending or in flight.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        lock(&self.state).running
    }

    /// The current state and a human-readable progress message.
    #[must_use]
    pub fn status(&self) -> (Status, String) {
        let state = lock(&self.state);
        (state.status, state.message.clone())
    }

    /// Wait until the most recent worker thread has returned.
    ///
    /// After [`abort`](Self::abort) this resolves once the abandoned
    /// worker has wound down.
    pub async fn settled(&self) {
        let worker = lock(&self.state).worker.clone();
        if let Some(worker) = worker {
            worker.wait().await;
        }
    }

    fn generation(&self) -> u64 {
        lock(&self.state).generation
    }
}

impl<F> Drop for PipelineController<F> {
    fn drop(&mut self) {
        lock(&self.state).cancel_run();
    }
}

impl<F> fmt::Debug for PipelineController<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineController")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything one run task needs.
struct Run<F> {
    generation: u64,
    cancel: CancelFlag,
    fetcher: Arc<F>,
    config: ControllerConfig,
    state: Arc<Mutex<State>>,
    priority: watch::Receiver<Priority>,
}

impl<F: ImageFetcher + 'static> Run<F> {
    async fn execute(
        mut self,
        baseline: String,
        current: String,
        on_complete: impl FnOnce(PipelineResult) + Send + 'static,
    ) {
        self.debounce().await;
        if !self.update(Status::Loading, Status::Loading.to_string()) {
            return;
        }

        let timeout = self.config.timeout;
        let result = match tokio::time::timeout(timeout, self.compare(&baseline, &current)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(generation = self.generation, ?timeout, "run timed out");
                self.cancel.cancel();
                PipelineResult::Failure(FailureReason::Timeout(timeout))
            }
        };

        {
            let mut state = lock(&self.state);
            if state.generation != self.generation {
                return;
            }
            state.running = false;
            state.task = None;
            state.cancel = None;
            state.set(Status::Done, result.message());
        }
        on_complete(result);
    }

    /// Wait out the debounce unless the run is, or becomes, foreground.
    async fn debounce(&mut self) {
        if *self.priority.borrow_and_update() == Priority::Foreground {
            return;
        }
        let raised = self.priority.wait_for(|p| *p == Priority::Foreground);
        tokio::select! {
            () = tokio::time::sleep(self.config.debounce) => {}
            _ = raised => tracing::debug!(generation = self.generation, "raised to foreground"),
        }
    }

    async fn compare(&self, baseline: &str, current: &str) -> PipelineResult {
        ensure_ready().await;
        let fetcher = self.fetcher.as_ref();
        let (b, c) = tokio::join!(load(fetcher, baseline), load(fetcher, current));
        let (b, c) = match (b, c) {
            (Ok(b), Ok(c)) => (b, c),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "image load failed");
                return PipelineResult::Failure(e.into());
            }
        };

        // An aborted predecessor may still be winding down.
        let previous = lock(&self.state).worker.clone();
        if let Some(previous) = previous {
            previous.wait().await;
        }

        let request = WorkerRequest {
            id: self.generation,
            baseline: b,
            current: c,
            config: self.config.compare.clone(),
            cancel: self.cancel.clone(),
        };
        let worker = {
            let mut state = lock(&self.state);
            if state.generation != self.generation {
                return PipelineResult::Failure(FailureReason::Pipeline(PipelineError::Cancelled));
            }
            match PipelineWorker::spawn(request) {
                Ok(worker) => {
                    state.worker = Some(worker.exit());
                    worker
                }
                Err(e) => return PipelineResult::Failure(e.into()),
            }
        };
        match worker
            .finish(|phase| {
                self.update(phase.into(), Status::from(phase).to_string());
            })
            .await
        {
            Ok(outcome) => PipelineResult::Success {
                used_fallback: outcome.report.used_fallback,
                image: ResultImage::Image(outcome.image),
                report: Some(Box::new(outcome.report)),
            },
            Err(e) => {
                tracing::warn!(error = %e, "worker run failed");
                PipelineResult::Failure(e.into())
            }
        }
    }

    /// Record progress; `false` if this run has been superseded.
    fn update(&self, status: Status, message: String) -> bool {
        let mut state = lock(&self.state);
        if state.generation != self.generation {
            return false;
        }
        state.set(status, message);
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::Rgba;
    use tokio::sync::mpsc;

    use super::*;
    use crate::loader::MemoryFetcher;
    use crate::raster::encode_png;
    use crackdiff_pipeline::FeatureMatcherKind;

    fn png(value: u8) -> Vec<u8> {
        encode_png(&RgbaImage::from_pixel(48, 32, Rgba([value, value, value, 255]))).unwrap()
    }

    fn fetcher() -> MemoryFetcher {
        MemoryFetcher::new()
            .with("a", png(80))
            .with("b", png(90))
            .with("broken", vec![0, 1, 2, 3])
    }

    fn textured(side: u32) -> Vec<u8> {
        encode_png(&RgbaImage::from_fn(side, side, |x, y| {
            let v = u8::try_from((x * 7 + y * 13) % 251).unwrap();
            Rgba([v, v, v, 255])
        }))
        .unwrap()
    }

    fn config(debounce: Duration) -> ControllerConfig {
        ControllerConfig {
            debounce,
            timeout: Duration::from_secs(20),
            compare: CompareConfig {
                feature_matcher: FeatureMatcherKind::Disabled,
                ..CompareConfig::default()
            },
        }
    }

    type Results = mpsc::UnboundedReceiver<PipelineResult>;

    fn collector() -> (impl FnOnce(PipelineResult) + Send + 'static, Results) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |result| {
                let _ = tx.send(result);
            },
            rx,
        )
    }

    #[tokio::test]
    async fn same_reference_passes_through() {
        let controller = PipelineController::new(fetcher(), config(Duration::ZERO));
        let (done, mut results) = collector();
        let sub = controller
            .run(Some("a"), Some("a"), Priority::Foreground, done)
            .unwrap();
        assert!(sub.is_finished());
        let PipelineResult::Success {
            image,
            used_fallback,
            report,
        } = results.try_recv().unwrap()
        else {
            unreachable!("same reference must pass through")
        };
        assert_eq!(image, ResultImage::Source("a".to_owned()));
        assert!(!used_fallback);
        assert!(report.is_none());
        assert_eq!(controller.status(), (Status::Done, "Same image".to_owned()));
        assert!(!controller.is_processing());
    }

    #[tokio::test]
    async fn missing_reference_passes_other_through() {
        let controller = PipelineController::new(fetcher(), config(Duration::ZERO));
        let (done, mut results) = collector();
        let _sub = controller
            .run(None, Some("b"), Priority::Background, done)
            .unwrap();
        assert!(matches!(
            results.try_recv().unwrap(),
            PipelineResult::Success { image: ResultImage::Source(ref s), .. } if s == "b"
        ));
        assert_eq!(controller.status().1, "Image reference missing");
    }

    #[tokio::test]
    async fn both_missing_is_a_failure() {
        let controller = PipelineController::new(fetcher(), config(Duration::ZERO));
        let (done, mut results) = collector();
        let _sub = controller
            .run(None, None, Priority::Foreground, done)
            .unwrap();
        assert!(matches!(
            results.try_recv().unwrap(),
            PipelineResult::Failure(FailureReason::MissingInput)
        ));
    }

    #[tokio::test]
    async fn foreground_run_delivers_once() {
        let controller = PipelineController::new(fetcher(), config(Duration::from_secs(60)));
        let (done, mut results) = collector();
        let sub = controller
            .run(Some("a"), Some("b"), Priority::Foreground, done)
            .unwrap();
        sub.finished().await;

        let result = results.recv().await.unwrap();
        match result {
            PipelineResult::Success {
                image: ResultImage::Image(img),
                used_fallback,
                report,
            } => {
                assert!(used_fallback);
                assert_eq!(img.dimensions(), (48, 32));
                assert!(report.is_some());
            }
            other => unreachable!("unexpected {other:?}"),
        }
        // Exactly one callback: the sender is gone and nothing is queued.
        assert!(results.recv().await.is_none());
        let (status, message) = controller.status();
        assert_eq!(status, Status::Done);
        assert_eq!(message, "Alignment failed, showing a raw comparison");
        assert!(!controller.is_processing());
    }

    #[tokio::test]
    async fn second_run_while_pending_is_busy() {
        let controller = PipelineController::new(fetcher(), config(Duration::from_secs(60)));
        let (done, _results) = collector();
        let _sub = controller
            .run(Some("a"), Some("b"), Priority::Background, done)
            .unwrap();
        let (again, _) = collector();
        assert_eq!(
            controller
                .run(Some("a"), Some("b"), Priority::Foreground, again)
                .unwrap_err(),
            SubmitError::Busy
        );
        assert!(controller.abort());
    }

    #[tokio::test]
    async fn abort_suppresses_callback() {
        let controller = PipelineController::new(fetcher(), config(Duration::from_secs(60)));
        let (done, mut results) = collector();
        let sub = controller
            .run(Some("a"), Some("b"), Priority::Background, done)
            .unwrap();
        assert!(controller.abort());
        sub.finished().await;

        // The callback was dropped without being called.
        assert!(results.recv().await.is_none());
        assert_eq!(controller.status().0, Status::Aborted);
        assert!(!controller.abort());
        assert!(!controller.is_processing());
    }

    #[tokio::test]
    async fn abort_during_matching_stops_the_worker() {
        let big = textured(900);
        let fetcher = fetcher().with("x", big.clone()).with("y", big);
        let mut cfg = config(Duration::ZERO);
        cfg.compare.feature_matcher = FeatureMatcherKind::Orb;
        let controller = PipelineController::new(fetcher, cfg);
        let (done, mut results) = collector();
        let sub = controller
            .run(Some("x"), Some("y"), Priority::Foreground, done)
            .unwrap();

        tokio::time::timeout(Duration::from_secs(20), async {
            while controller.status().0 != Status::Matching {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert!(controller.abort());
        sub.finished().await;
        assert!(results.recv().await.is_none());

        // The worker thread winds down instead of finishing the comparison.
        tokio::time::timeout(Duration::from_secs(10), controller.settled())
            .await
            .unwrap();
        assert_eq!(controller.status().0, Status::Aborted);

        // The next run gets the controller to itself and delivers once.
        let (done, mut results) = collector();
        controller
            .run(Some("a"), Some("b"), Priority::Foreground, done)
            .unwrap()
            .finished()
            .await;
        assert!(results.recv().await.unwrap().is_success());
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn panicking_callback_surfaces_from_finished() {
        let controller = PipelineController::new(fetcher(), config(Duration::ZERO));
        let sub = controller
            .run(Some("a"), Some("b"), Priority::Foreground, |_| {
                std::panic::resume_unwind(Box::new("callback failed"))
            })
            .unwrap();
        let joined = tokio::spawn(sub.finished()).await;
        assert!(joined.unwrap_err().is_panic());
        assert!(!controller.is_processing());
    }

    #[tokio::test]
    async fn raising_priority_skips_debounce() {
        let controller = PipelineController::new(fetcher(), config(Duration::from_secs(60)));
        let (done, mut results) = collector();
        let sub = controller
            .run(Some("a"), Some("b"), Priority::Background, done)
            .unwrap();
        tokio::task::yield_now().await;
        controller.set_priority(Priority::Foreground);
        assert_eq!(controller.priority(), Priority::Foreground);

        tokio::time::timeout(Duration::from_secs(10), sub.finished())
            .await
            .unwrap();
        assert!(results.recv().await.unwrap().is_success());
    }

    #[tokio::test]
    async fn background_run_starts_after_debounce() {
        let controller = PipelineController::new(fetcher(), config(Duration::from_millis(20)));
        let (done, mut results) = collector();
        let sub = controller
            .run(Some("a"), Some("b"), Priority::Background, done)
            .unwrap();
        assert!(controller.is_processing());
        sub.finished().await;
        assert!(results.recv().await.unwrap().is_success());
    }

    #[tokio::test]
    async fn undecodable_image_fails() {
        let controller = PipelineController::new(fetcher(), config(Duration::ZERO));
        let (done, mut results) = collector();
        controller
            .run(Some("a"), Some("broken"), Priority::Foreground, done)
            .unwrap()
            .finished()
            .await;
        let result = results.recv().await.unwrap();
        assert!(matches!(
            result,
            PipelineResult::Failure(FailureReason::Load(LoadError::Decode { .. }))
        ));
        assert!(controller.status().1.starts_with("Analysis failed: "));
    }

    #[tokio::test]
    async fn unknown_reference_fails_to_load() {
        let controller = PipelineController::new(fetcher(), config(Duration::ZERO));
        let (done, mut results) = collector();
        controller
            .run(Some("a"), Some("nowhere"), Priority::Foreground, done)
            .unwrap()
            .finished()
            .await;
        assert!(matches!(
            results.recv().await.unwrap(),
            PipelineResult::Failure(FailureReason::Load(LoadError::Network { .. }))
        ));
    }

    #[tokio::test]
    async fn zero_timeout_fails_the_run() {
        let big = textured(900);
        let fetcher = MemoryFetcher::new().with("x", big.clone()).with("y", big);
        let mut cfg = config(Duration::ZERO);
        cfg.timeout = Duration::ZERO;
        cfg.compare.feature_matcher = FeatureMatcherKind::Orb;
        let controller = PipelineController::new(fetcher, cfg);
        let (done, mut results) = collector();
        controller
            .run(Some("x"), Some("y"), Priority::Foreground, done)
            .unwrap()
            .finished()
            .await;
        assert!(matches!(
            results.recv().await.unwrap(),
            PipelineResult::Failure(FailureReason::Timeout(_))
        ));
    }

    #[test]
    fn run_outside_runtime_is_rejected() {
        let controller = PipelineController::new(fetcher(), config(Duration::ZERO));
        let (done, _results) = collector();
        assert_eq!(
            controller
                .run(Some("a"), Some("b"), Priority::Foreground, done)
                .unwrap_err(),
            SubmitError::NoRuntime
        );
        assert!(!controller.is_processing());
    }

    #[test]
    fn long_failure_reasons_are_truncated() {
        let result = PipelineResult::Failure(FailureReason::Worker("x".repeat(400)));
        let message = result.message();
        assert!(message.starts_with("Analysis failed: worker error: "));
        assert!(message.ends_with("..."));
        assert_eq!(message.chars().count(), "Analysis failed: ".len() + MAX_REASON_CHARS + 3);
    }

    #[test]
    fn config_defaults() {
        let config: ControllerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.debounce, Duration::from_millis(300));
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn phases_map_to_statuses() {
        assert_eq!(Status::from(Phase::Diffing), Status::Diffing);
        assert_eq!(Status::Idle.to_string(), "Waiting");
    }
}
