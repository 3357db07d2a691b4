use std::sync::Arc;

use thiserror::Error;

use crate::core::Identity;

/// The failure value carried by a goal's result slot.
///
/// Wraps the original error in an [`Arc`] so the value stays `Clone`: when a
/// dependency fails, the same error fans out verbatim to every dependent goal
/// without re-wrapping.
#[derive(Debug, Error, Clone)]
pub enum GoalError {
    #[error(transparent)]
    Failed(#[from] Arc<anyhow::Error>),

    #[error("goal was cancelled")]
    Cancelled,
}

impl GoalError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        GoalError::Failed(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for GoalError {
    fn from(err: anyhow::Error) -> Self {
        GoalError::Failed(Arc::new(err))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no entry for {0:?}")]
    NotFound(Identity),

    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}
