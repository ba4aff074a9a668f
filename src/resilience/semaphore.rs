//! Per-backend concurrency limiter.
//!
//! Wraps `tokio::sync::Semaphore`, which hands out permits to waiters in
//! FIFO order. A waiter whose timeout fires is dropped from the queue and can
//! never be granted afterwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::SemaphoreError;

/// Snapshot of a semaphore's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreStats {
    pub max: usize,
    pub available: usize,
    pub waiting: usize,
}

pub struct BackendSemaphore {
    backend: String,
    max: usize,
    inner: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
}

/// A held slot. The slot is released exactly once, when this is dropped.
#[derive(Debug)]
pub struct BackendPermit {
    backend: String,
    _permit: OwnedSemaphorePermit,
}

impl BackendPermit {
    pub fn backend(&self) -> &str {
        &self.backend
    }
}

struct WaitGuard(Arc<AtomicUsize>);

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BackendSemaphore {
    /// A limiter with `max_concurrent` slots (at least one).
    pub fn new(backend: impl Into<String>, max_concurrent: usize) -> Self {
        let max = max_concurrent.max(1);
        Self {
            backend: backend.into(),
            max,
            inner: Arc::new(Semaphore::new(max)),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Take a slot, waiting up to `timeout` behind earlier waiters.
    pub async fn acquire(&self, timeout: Duration) -> Result<BackendPermit, SemaphoreError> {
        if let Ok(permit) = Arc::clone(&self.inner).try_acquire_owned() {
            return Ok(self.permit(permit));
        }

        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _guard = WaitGuard(Arc::clone(&self.waiting));

        match tokio::time::timeout(timeout, Arc::clone(&self.inner).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(self.permit(permit)),
            Ok(Err(_)) => Err(SemaphoreError::Closed {
                backend: self.backend.clone(),
            }),
            Err(_) => {
                tracing::debug!(backend = %self.backend, ?timeout, "Semaphore acquire timed out");
                Err(SemaphoreError::Timeout {
                    backend: self.backend.clone(),
                    timeout,
                })
            }
        }
    }

    fn permit(&self, permit: OwnedSemaphorePermit) -> BackendPermit {
        BackendPermit {
            backend: self.backend.clone(),
            _permit: permit,
        }
    }

    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    pub fn stats(&self) -> SemaphoreStats {
        SemaphoreStats {
            max: self.max,
            available: self.inner.available_permits(),
            waiting: self.waiting.load(Ordering::SeqCst),
        }
    }

    /// Fail current and future waiters with `SemaphoreError::Closed`.
    pub fn close(&self) {
        self.inner.close();
    }
}
