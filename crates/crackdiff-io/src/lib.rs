//! crackdiff-io: Loading, threading and orchestration around the
//! comparison pipeline.
//!
//! Fetches source images, runs the pipeline on a worker thread, and
//! enforces the one-run-at-a-time, debounce, abort and timeout policy
//! for interactive callers. PNG encoding of results lives here too.

pub mod bootstrap;
pub mod controller;
pub mod loader;
pub mod raster;
pub mod worker;

pub use bootstrap::ensure_ready;
pub use controller::{
    ControllerConfig, FailureReason, PipelineController, PipelineResult, Priority, ResultImage,
    Status, SubmitError, Subscription,
};
pub use loader::{FsFetcher, HttpFetcher, ImageFetcher, LoadError, MemoryFetcher, load};
pub use raster::{RasterError, encode_png};
pub use worker::{PipelineWorker, WorkerError, WorkerExit};
