use thiserror::Error;

/// Status kinds carried on every reply channel.
///
/// The variants mirror the behavioral error classes of the batching core:
/// shape violations and duplicate keys are caller mistakes, `Internal` marks
/// bookkeeping failures inside the core, `Unavailable` is the synchronous
/// queue-overflow signal, and `DeadlineExceeded` is produced by the unbatch
/// timeout enforcer. `Cancelled` is what a caller observes when the resource
/// serving its request is torn down before a reply could be produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

pub type BatchResult<T> = Result<T, BatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = BatchError::InvalidArgument("rank 0 input".to_string());
        assert_eq!(err.to_string(), "invalid argument: rank 0 input");

        let err = BatchError::DeadlineExceeded("waited too long".to_string());
        assert!(err.to_string().starts_with("deadline exceeded"));
    }

    #[test]
    fn errors_are_comparable() {
        let a = BatchError::AlreadyExists("key".to_string());
        let b = BatchError::AlreadyExists("key".to_string());
        assert_eq!(a, b);
        assert_ne!(a, BatchError::Internal("key".to_string()));
    }
}
