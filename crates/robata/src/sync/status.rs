use std::sync::RwLock;

use crate::error::BatchResult;

/// A shared status cell with first-error semantics.
///
/// Concurrent splits of a single call may fail independently; the caller is
/// owed one deterministic status, so the first error observed wins and every
/// later update is a no-op. OK updates never take the exclusive lock.
pub(crate) struct ThreadSafeStatus {
    status: RwLock<BatchResult<()>>,
}

impl ThreadSafeStatus {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(Ok(())),
        }
    }

    /// Retains the first error: replaces the current status with
    /// `new_status` only if `new_status` is an error and the current status
    /// is still OK.
    pub fn update(&self, new_status: BatchResult<()>) {
        if new_status.is_ok() {
            return;
        }
        let mut current = self.status.write().unwrap();
        if current.is_ok() {
            *current = new_status;
        }
    }

    pub fn read(&self) -> BatchResult<()> {
        self.status.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BatchError;
    use std::sync::Arc;

    #[test]
    fn starts_ok() {
        let status = ThreadSafeStatus::new();
        assert!(status.read().is_ok());
    }

    #[test]
    fn ok_update_is_a_noop() {
        let status = ThreadSafeStatus::new();
        status.update(Ok(()));
        assert!(status.read().is_ok());
    }

    #[test]
    fn first_error_wins() {
        let status = ThreadSafeStatus::new();
        status.update(Err(BatchError::Internal("first".to_string())));
        status.update(Err(BatchError::InvalidArgument("second".to_string())));
        assert_eq!(
            status.read(),
            Err(BatchError::Internal("first".to_string()))
        );
    }

    #[test]
    fn concurrent_updates_settle_on_exactly_one_error() {
        let status = Arc::new(ThreadSafeStatus::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let status = status.clone();
                std::thread::spawn(move || {
                    status.update(Err(BatchError::Internal(format!("err-{i}"))));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let err = status.read().unwrap_err();
        assert!(matches!(err, BatchError::Internal(_)));
    }
}
