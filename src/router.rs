//! Priority- and health-aware backend selection with failover.
//!
//! Providers are tried in ascending priority (ties in registration order);
//! a provider whose breaker is open is skipped.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{ErrorClassification, ExecutionBackend, ExecutionTask};
use crate::error::RouterError;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitStats};

/// Registration input for one provider.
pub struct ProviderSpec {
    pub provider_id: String,
    pub backend: Arc<dyn ExecutionBackend>,
    /// Lower is preferred.
    pub priority: u32,
    pub circuit_breaker: CircuitBreakerConfig,
}

/// The provider chosen for an attempt.
#[derive(Clone)]
pub struct RoutedProvider {
    pub provider_id: String,
    pub backend: Arc<dyn ExecutionBackend>,
    /// A higher-priority provider was skipped because its circuit was open.
    pub failed_over: bool,
}

impl std::fmt::Debug for RoutedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedProvider")
            .field("provider_id", &self.provider_id)
            .field("failed_over", &self.failed_over)
            .finish()
    }
}

struct ProviderEntry {
    id: String,
    backend: Arc<dyn ExecutionBackend>,
    priority: u32,
    breaker: CircuitBreaker,
}

#[derive(Default)]
pub struct ProviderRouter {
    /// Kept sorted by priority; stable sort preserves registration order on ties.
    providers: Vec<ProviderEntry>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(&mut self, spec: ProviderSpec) -> Result<(), RouterError> {
        if self.providers.iter().any(|p| p.id == spec.provider_id) {
            return Err(RouterError::DuplicateProvider(spec.provider_id));
        }
        tracing::debug!(
            provider = %spec.provider_id,
            priority = spec.priority,
            "Provider added to router"
        );
        self.providers.push(ProviderEntry {
            breaker: CircuitBreaker::new(spec.provider_id.clone(), spec.circuit_breaker),
            id: spec.provider_id,
            backend: spec.backend,
            priority: spec.priority,
        });
        self.providers.sort_by_key(|p| p.priority);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Provider ids in routing order.
    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id.clone()).collect()
    }

    /// Pick the most preferred provider whose breaker admits the attempt.
    pub fn route(&self, task: &ExecutionTask) -> Result<RoutedProvider, RouterError> {
        if self.providers.is_empty() {
            return Err(RouterError::NoProviders);
        }

        let mut skipped = Vec::new();
        for provider in &self.providers {
            if provider.breaker.can_execute() {
                if !skipped.is_empty() {
                    tracing::info!(
                        task_id = %task.id,
                        provider = %provider.id,
                        skipped = ?skipped,
                        "Failing over past unavailable providers"
                    );
                }
                return Ok(RoutedProvider {
                    provider_id: provider.id.clone(),
                    backend: Arc::clone(&provider.backend),
                    failed_over: !skipped.is_empty(),
                });
            }
            skipped.push(provider.id.as_str());
        }

        tracing::warn!(task_id = %task.id, count = self.providers.len(), "All providers unavailable");
        Err(RouterError::AllProvidersOpen {
            count: self.providers.len(),
        })
    }

    /// Like `route`, but try `preferred` first when its breaker admits.
    pub fn route_preferring(
        &self,
        task: &ExecutionTask,
        preferred: &str,
    ) -> Result<RoutedProvider, RouterError> {
        if let Some(provider) = self.find(preferred)
            && provider.breaker.can_execute()
        {
            return Ok(RoutedProvider {
                provider_id: provider.id.clone(),
                backend: Arc::clone(&provider.backend),
                failed_over: false,
            });
        }
        self.route(task)
    }

    /// Feed an attempt's outcome into the provider's breaker.
    pub fn record_outcome(
        &self,
        provider_id: &str,
        success: bool,
        classification: Option<ErrorClassification>,
    ) -> Result<(), RouterError> {
        let provider = self
            .find(provider_id)
            .ok_or_else(|| RouterError::UnknownProvider(provider_id.to_string()))?;
        if success {
            provider.breaker.record_success();
        } else {
            provider
                .breaker
                .record_failure(classification.unwrap_or(ErrorClassification::Transient));
        }
        Ok(())
    }

    /// Release a half-open probe slot reserved by `route` for an attempt that never ran.
    pub fn abandon_probe(&self, provider_id: &str) {
        if let Some(provider) = self.find(provider_id) {
            provider.breaker.abandon_probe();
        }
    }

    pub fn circuit_states(&self) -> HashMap<String, CircuitStats> {
        self.providers
            .iter()
            .map(|p| (p.id.clone(), p.breaker.stats()))
            .collect()
    }

    fn find(&self, provider_id: &str) -> Option<&ProviderEntry> {
        self.providers.iter().find(|p| p.id == provider_id)
    }
}
