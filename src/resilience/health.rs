//! TTL memo around a backend's health probe.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::backend::{BackendHealthReport, ExecutionBackend, HEALTH_CHECK_TIMEOUT};

/// Default memo lifetime.
pub const DEFAULT_HEALTH_TTL: Duration = Duration::from_secs(30);

pub struct CachedHealthCheck {
    backend: Arc<dyn ExecutionBackend>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, BackendHealthReport)>>,
    invalidated: AtomicBool,
}

impl CachedHealthCheck {
    pub fn new(backend: Arc<dyn ExecutionBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            cached: Mutex::new(None),
            invalidated: AtomicBool::new(false),
        }
    }

    /// Cached report while fresh, otherwise a new probe.
    ///
    /// Concurrent callers during a probe wait for it instead of probing again.
    pub async fn check(&self) -> BackendHealthReport {
        let mut cached = self.cached.lock().await;
        let forced = self.invalidated.swap(false, Ordering::SeqCst);
        if !forced
            && let Some((at, report)) = cached.as_ref()
            && at.elapsed() < self.ttl
        {
            return report.clone();
        }

        let report = match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.backend.health_check())
            .await
        {
            Ok(report) => report,
            Err(_) => BackendHealthReport::unhealthy(self.backend.id(), "health check timed out"),
        };
        tracing::debug!(
            backend = %self.backend.id(),
            status = ?report.status,
            "Health probed"
        );
        *cached = Some((Instant::now(), report.clone()));
        report
    }

    /// Force the next `check` to probe.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    /// Last report without probing.
    pub fn last(&self) -> Option<BackendHealthReport> {
        self.cached
            .try_lock()
            .ok()
            .and_then(|c| c.as_ref().map(|(_, report)| report.clone()))
    }
}
