//! Critical section around host network mutations.
//!
//! The host's network namespace is one shared mutable resource. Every
//! validate, mutate, sync and save sequence runs while holding the
//! [`HostLock`], and so does every snapshot slot access made by the
//! managers.

use std::time::Duration;

use rol_common::{RolError, RolResult};
use tokio::sync::{Mutex, MutexGuard};

/// Global single-writer lock for the host network.
#[derive(Debug)]
pub struct HostLock {
    inner: Mutex<()>,
    timeout: Duration,
}

/// Proof that the holder owns the host network critical section.
#[derive(Debug)]
pub struct HostGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    operation: &'static str,
}

impl HostGuard<'_> {
    /// Operation that acquired the lock.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        self.operation
    }
}

impl Drop for HostGuard<'_> {
    fn drop(&mut self) {
        tracing::trace!(operation = self.operation, "Released host lock");
    }
}

impl HostLock {
    /// Create a lock whose acquisition waits at most `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(()),
            timeout,
        }
    }

    /// Acquisition timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire the lock on behalf of `operation`.
    ///
    /// # Errors
    ///
    /// Returns `IoFailure` if the lock is not obtained within the timeout.
    pub async fn acquire(&self, operation: &'static str) -> RolResult<HostGuard<'_>> {
        let guard = tokio::time::timeout(self.timeout, self.inner.lock())
            .await
            .map_err(|_| {
                tracing::warn!(operation, timeout = ?self.timeout, "Timed out waiting for host lock");
                RolError::io_failure(
                    "acquire host lock",
                    format!("{operation} timed out after {:?}", self.timeout),
                )
            })?;
        tracing::trace!(operation, "Acquired host lock");
        Ok(HostGuard {
            _guard: guard,
            operation,
        })
    }

    /// Returns true if some operation currently holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

impl Default for HostLock {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn acquire_and_release() {
        let lock = HostLock::default();
        {
            let guard = lock.acquire("test").await.unwrap();
            assert_eq!(guard.operation(), "test");
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn contended_acquire_times_out() {
        let lock = Arc::new(HostLock::new(Duration::from_millis(50)));
        let _held = lock.acquire("holder").await.unwrap();

        let err = lock.acquire("waiter").await.unwrap_err();
        assert_eq!(err.kind(), rol_common::ErrorKind::IoFailure);
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let lock = Arc::new(HostLock::new(Duration::from_secs(5)));
        let guard = lock.acquire("first").await.unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire("second").await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        drop(guard);

        waiter.await.unwrap().unwrap();
    }
}
