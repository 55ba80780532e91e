use thiserror::Error;

/// Domain errors surfaced to callers of the service layer.
///
/// Record-level trouble (bad data, transient store hiccups) is recovered
/// locally and recorded on the linkage result instead of being raised; only
/// contract violations and persistent store failures reach this enum.
#[derive(Debug, Error)]
pub enum LinkageError {
    #[error("a matching task is already running for this source")]
    TaskAlreadyRunning,

    #[error("unknown task mode: {0}")]
    InvalidMode(String),

    #[error("primary source contains no records")]
    EmptyPrimary,

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("task {0} is not running")]
    TaskNotRunning(String),

    #[error("no linkage result for {0}")]
    NotFound(String),

    #[error("review state changed concurrently for {0}; re-read and retry")]
    StaleReview(String),

    #[error("invalid review transition from {from} to {to}")]
    InvalidReviewTransition { from: String, to: String },

    #[error("unknown review status: {0}")]
    InvalidReviewStatus(String),

    #[error("unknown strategy: {0}")]
    InvalidStrategy(String),

    #[error("enhanced association aggregation failed: {0}")]
    AggregationFailed(String),

    #[error("required index {0} is not present; refusing to run")]
    MissingIndex(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl LinkageError {
    /// Stable code for transport layers and logs.
    pub fn code(&self) -> &'static str {
        match self {
            LinkageError::TaskAlreadyRunning => "TASK_ALREADY_RUNNING",
            LinkageError::InvalidMode(_) => "INVALID_MODE",
            LinkageError::EmptyPrimary => "EMPTY_PRIMARY",
            LinkageError::UnknownTask(_) => "UNKNOWN_TASK",
            LinkageError::TaskNotRunning(_) => "TASK_NOT_RUNNING",
            LinkageError::NotFound(_) => "NOT_FOUND",
            LinkageError::StaleReview(_) => "STALE_REVIEW",
            LinkageError::InvalidReviewTransition { .. } => "INVALID_REVIEW_TRANSITION",
            LinkageError::InvalidReviewStatus(_) => "INVALID_REVIEW_STATUS",
            LinkageError::InvalidStrategy(_) => "INVALID_STRATEGY",
            LinkageError::AggregationFailed(_) => "AGGREGATION_FAILED",
            LinkageError::MissingIndex(_) => "MISSING_INDEX",
            LinkageError::Store(_) => "STORE_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(LinkageError::TaskAlreadyRunning.code(), "TASK_ALREADY_RUNNING");
        assert_eq!(LinkageError::StaleReview("x".into()).code(), "STALE_REVIEW");
        assert_eq!(
            LinkageError::InvalidReviewTransition {
                from: "approved".into(),
                to: "approved".into()
            }
            .code(),
            "INVALID_REVIEW_TRANSITION"
        );
    }
}
