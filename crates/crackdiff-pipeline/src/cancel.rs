//! Cooperative cancellation of an in-flight comparison.
//!
//! The heavy stages poll a [`CancelFlag`] between stages and inside the
//! pyramid and consensus loops. Once the flag is raised, work winds down
//! at the next check and [`worker::run`](crate::worker::run) reports
//! [`PipelineError::Cancelled`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::PipelineError;

/// Shared stop request. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A flag that has not been raised.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder of this flag to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether [`cancel`](Self::cancel) has been called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// `Err(Cancelled)` once the flag is raised.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Cancelled`] if the flag has been raised.
    pub fn check(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let flag = CancelFlag::new();
        let held = flag.clone();
        assert!(held.check().is_ok());
        flag.cancel();
        assert!(held.is_cancelled());
        assert!(matches!(held.check(), Err(PipelineError::Cancelled)));
    }
}
