//! Backend registry: owns each backend's lifecycle, health memo, concurrency
//! limiter and circuit breaker.
//!
//! Works standalone (direct lookup of a preferred or default backend) or with
//! a [`ProviderRouter`] for priority failover. Callers record outcomes the same
//! way in both modes. After [`BackendRegistry::stop_all`] the registry is spent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::backend::{
    BackendConfig, BackendHealthReport, ErrorClassification, ExecutionBackend, ExecutionTask,
};
use crate::error::RegistryError;
use crate::resilience::health::DEFAULT_HEALTH_TTL;
use crate::resilience::{
    BackendSemaphore, CachedHealthCheck, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    CircuitStats,
};
use crate::router::{ProviderRouter, ProviderSpec, RoutedProvider};

struct Entry {
    backend: Arc<dyn ExecutionBackend>,
    health: Arc<CachedHealthCheck>,
    semaphore: Arc<BackendSemaphore>,
    breaker: Arc<CircuitBreaker>,
    breaker_config: CircuitBreakerConfig,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    /// Registration order.
    order: Vec<String>,
    default: Option<String>,
    router: Option<Arc<ProviderRouter>>,
    stopped: bool,
}

pub struct BackendRegistry {
    state: RwLock<State>,
    health_ttl: Duration,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::with_health_ttl(DEFAULT_HEALTH_TTL)
    }

    pub fn with_health_ttl(health_ttl: Duration) -> Self {
        Self {
            state: RwLock::new(State::default()),
            health_ttl,
        }
    }

    /// Start a backend and index it with fresh collaborators.
    ///
    /// A duplicate id is rejected before the new backend is started, leaving
    /// the existing registration untouched.
    pub async fn register(
        &self,
        backend: Arc<dyn ExecutionBackend>,
        config: &BackendConfig,
        max_concurrent: usize,
        breaker_config: CircuitBreakerConfig,
    ) -> Result<(), RegistryError> {
        let id = backend.id().to_string();
        {
            let state = self.state.read().await;
            if state.stopped {
                return Err(RegistryError::Stopped);
            }
            if state.entries.contains_key(&id) {
                return Err(RegistryError::DuplicateBackend(id));
            }
        }

        backend
            .start(config)
            .await
            .map_err(|source| RegistryError::StartFailed {
                id: id.clone(),
                source,
            })?;

        let mut state = self.state.write().await;
        if state.stopped || state.entries.contains_key(&id) {
            // Lost a race with stop_all or a concurrent registration of the same id.
            if let Err(e) = backend.stop().await {
                tracing::warn!(backend = %id, "Failed to stop rejected backend: {}", e);
            }
            return Err(if state.stopped {
                RegistryError::Stopped
            } else {
                RegistryError::DuplicateBackend(id)
            });
        }

        let entry = Entry {
            health: Arc::new(CachedHealthCheck::new(Arc::clone(&backend), self.health_ttl)),
            semaphore: Arc::new(BackendSemaphore::new(id.clone(), max_concurrent)),
            breaker: Arc::new(CircuitBreaker::new(id.clone(), breaker_config.clone())),
            breaker_config,
            backend,
        };
        tracing::info!(
            backend = %id,
            kind = %entry.backend.kind(),
            max_concurrent,
            "Backend registered"
        );
        state.entries.insert(id.clone(), entry);
        state.order.push(id.clone());
        if state.default.is_none() {
            state.default = Some(id);
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn ExecutionBackend>> {
        self.state
            .read()
            .await
            .entries
            .get(id)
            .map(|e| Arc::clone(&e.backend))
    }

    pub async fn semaphore(&self, id: &str) -> Option<Arc<BackendSemaphore>> {
        self.state
            .read()
            .await
            .entries
            .get(id)
            .map(|e| Arc::clone(&e.semaphore))
    }

    /// Current state of the registry-level breaker for `id`, without reserving a probe.
    pub async fn breaker_admission(&self, id: &str) -> Option<CircuitState> {
        self.state
            .read()
            .await
            .entries
            .get(id)
            .map(|e| e.breaker.state())
    }

    /// Backend ids in registration order.
    pub async fn ids(&self) -> Vec<String> {
        self.state.read().await.order.clone()
    }

    pub async fn default_id(&self) -> Option<String> {
        self.state.read().await.default.clone()
    }

    pub async fn set_default(&self, id: &str) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        if !state.entries.contains_key(id) {
            return Err(RegistryError::UnknownBackend(id.to_string()));
        }
        state.default = Some(id.to_string());
        Ok(())
    }

    /// Adopt a router, or build one over every registered backend with
    /// ascending priority in registration order.
    pub async fn configure_router(
        &self,
        router: Option<ProviderRouter>,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        if state.stopped {
            return Err(RegistryError::Stopped);
        }

        let router = match router {
            Some(router) => router,
            None => {
                let mut router = ProviderRouter::new();
                for (priority, id) in state.order.iter().enumerate() {
                    let Some(entry) = state.entries.get(id) else {
                        continue;
                    };
                    router.add_provider(ProviderSpec {
                        provider_id: id.clone(),
                        backend: Arc::clone(&entry.backend),
                        priority: priority as u32,
                        circuit_breaker: entry.breaker_config.clone(),
                    })?;
                }
                router
            }
        };

        tracing::info!(providers = ?router.provider_ids(), "Router configured");
        state.router = Some(Arc::new(router));
        Ok(())
    }

    pub async fn has_router(&self) -> bool {
        self.state.read().await.router.is_some()
    }

    /// Choose the backend for an attempt.
    ///
    /// An admitted result may hold a half-open probe slot; if the attempt
    /// never runs, give it back with [`BackendRegistry::abandon_attempt`].
    pub async fn route_task(
        &self,
        task: &ExecutionTask,
        preferred: Option<&str>,
    ) -> Result<RoutedProvider, RegistryError> {
        let state = self.state.read().await;
        if state.stopped {
            return Err(RegistryError::Stopped);
        }

        if let Some(router) = &state.router {
            let routed = match preferred {
                Some(id) => router.route_preferring(task, id),
                None => router.route(task),
            }?;
            return Ok(routed);
        }

        let id = preferred
            .filter(|id| state.entries.contains_key(*id))
            .map(str::to_string)
            .or_else(|| state.default.clone());
        let entry = id.as_deref().and_then(|id| state.entries.get(id).map(|e| (id, e)));

        match entry {
            Some((id, entry)) if entry.breaker.can_execute() => Ok(RoutedProvider {
                provider_id: id.to_string(),
                backend: Arc::clone(&entry.backend),
                failed_over: false,
            }),
            Some((id, _)) => {
                tracing::warn!(backend = %id, task_id = %task.id, "Backend circuit open");
                Err(RegistryError::NoBackendAvailable {
                    task_id: task.id.clone(),
                })
            }
            None => Err(RegistryError::NoBackendAvailable {
                task_id: task.id.clone(),
            }),
        }
    }

    /// Feed an attempt's outcome to the router, or to the registry's own breaker.
    pub async fn record_outcome(
        &self,
        provider_id: &str,
        success: bool,
        classification: Option<ErrorClassification>,
    ) -> Result<(), RegistryError> {
        let state = self.state.read().await;

        if !success
            && classification.is_none_or(|c| c.counts_toward_breaker())
            && let Some(entry) = state.entries.get(provider_id)
        {
            entry.health.invalidate();
        }

        if let Some(router) = &state.router {
            router.record_outcome(provider_id, success, classification)?;
            return Ok(());
        }

        let entry = state
            .entries
            .get(provider_id)
            .ok_or_else(|| RegistryError::UnknownBackend(provider_id.to_string()))?;
        if success {
            entry.breaker.record_success();
        } else {
            entry
                .breaker
                .record_failure(classification.unwrap_or(ErrorClassification::Transient));
        }
        Ok(())
    }

    /// Release a half-open probe reserved by `route_task` for an attempt that never ran.
    pub async fn abandon_attempt(&self, provider_id: &str) {
        let state = self.state.read().await;
        match &state.router {
            Some(router) => router.abandon_probe(provider_id),
            None => {
                if let Some(entry) = state.entries.get(provider_id) {
                    entry.breaker.abandon_probe();
                }
            }
        }
    }

    /// Breaker stats per provider (router breakers when a router is configured).
    pub async fn circuit_states(&self) -> HashMap<String, CircuitStats> {
        let state = self.state.read().await;
        match &state.router {
            Some(router) => router.circuit_states(),
            None => state
                .entries
                .iter()
                .map(|(id, e)| (id.clone(), e.breaker.stats()))
                .collect(),
        }
    }

    /// Cached health of every backend, in registration order.
    pub async fn health_reports(&self) -> Vec<BackendHealthReport> {
        let checks: Vec<Arc<CachedHealthCheck>> = {
            let state = self.state.read().await;
            state
                .order
                .iter()
                .filter_map(|id| state.entries.get(id))
                .map(|e| Arc::clone(&e.health))
                .collect()
        };
        futures::future::join_all(checks.iter().map(|c| c.check())).await
    }

    /// Stop every backend independently and clear all state.
    pub async fn stop_all(&self) {
        let entries: Vec<(String, Entry)> = {
            let mut state = self.state.write().await;
            state.stopped = true;
            state.router = None;
            state.default = None;
            state.order.clear();
            state.entries.drain().collect()
        };

        let stops = entries.iter().map(|(id, entry)| async move {
            entry.semaphore.close();
            match entry.backend.stop().await {
                Ok(()) => tracing::info!(backend = %id, "Backend stopped"),
                Err(e) => tracing::error!(backend = %id, "Failed to stop backend: {}", e),
            }
        });
        futures::future::join_all(stops).await;
    }

    pub async fn is_stopped(&self) -> bool {
        self.state.read().await.stopped
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
