//! Job lifecycle orchestrator.
//!
//! One [`JobOrchestrator::process_job`] call runs one attempt of a job:
//! approval gate, routing, admission, execution with live event forwarding,
//! then settlement into the store with breaker feedback and retry scheduling.
//! [`JobOrchestrator::run`] feeds queued jobs into `process_job` with bounded
//! concurrency.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use uuid::Uuid;

use super::broadcast::{StreamBroadcaster, job_channel};
use super::classify::FailureClassifier;
use super::model::{Job, JobPayload, JobStatus, JobUpdate};
use super::queue::{AddJobOptions, JobQueue, QueuedJob};
use super::store::JobStore;
use crate::backend::{
    ErrorClassification, ExecutionError, ExecutionHandle, ExecutionResult, ExecutionStatus,
    ExecutionTask,
};
use crate::config::{RetryConfig, WorkerConfig};
use crate::error::{BackendError, Error, JobError, RegistryError, RouterError};
use crate::registry::BackendRegistry;
use crate::resilience::retry_delay;
use crate::router::RoutedProvider;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Jobs processed concurrently by `run`.
    pub worker_concurrency: usize,
    pub semaphore_timeout: Duration,
    pub approval_ttl: Duration,
    pub retry: RetryConfig,
}

impl From<&WorkerConfig> for OrchestratorConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            worker_concurrency: config.worker_concurrency,
            semaphore_timeout: config.semaphore_timeout,
            approval_ttl: config.approval_ttl,
            retry: config.retry.clone(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

pub struct JobOrchestrator {
    registry: Arc<BackendRegistry>,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    broadcaster: Arc<dyn StreamBroadcaster>,
    classifier: FailureClassifier,
    config: OrchestratorConfig,
    /// One live handle per running job.
    live: Mutex<HashMap<Uuid, Arc<ExecutionHandle>>>,
}

impl JobOrchestrator {
    pub fn new(
        registry: Arc<BackendRegistry>,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        broadcaster: Arc<dyn StreamBroadcaster>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            queue,
            broadcaster,
            classifier: FailureClassifier::default_rules(),
            config,
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Create a `Scheduled` job and enqueue it.
    pub async fn submit(
        &self,
        identifier: &str,
        payload: JobPayload,
        max_attempts: Option<u32>,
    ) -> Result<Uuid, Error> {
        let job = Job::new(
            identifier,
            payload,
            max_attempts.unwrap_or(self.config.retry.max_attempts),
        );
        let (id, max_attempts) = (job.id, job.max_attempts);
        self.store.insert(job).await?;
        self.enqueue(identifier, id, None, max_attempts).await?;
        tracing::info!(job_id = %id, identifier, max_attempts, "Job submitted");
        Ok(id)
    }

    /// Resolve a job's approval wait and, if approved, put it back on the queue.
    pub async fn resolve_approval(&self, job_id: Uuid, approved: bool) -> Result<bool, Error> {
        let Some(job) = self.store.record_approval(job_id, approved).await? else {
            return Ok(false);
        };
        self.broadcast_status(&job).await;
        if job.status == JobStatus::Scheduled {
            self.enqueue(&job.identifier, job.id, None, job.max_attempts)
                .await?;
        }
        Ok(true)
    }

    /// Cancel a job: its live execution if one is running, otherwise a job
    /// that has not started yet. Returns false when there was nothing to cancel.
    pub async fn cancel_job(&self, job_id: Uuid, reason: &str) -> Result<bool, Error> {
        if let Some(handle) = self.live.lock().await.get(&job_id) {
            tracing::info!(job_id = %job_id, reason, "Cancelling running job");
            handle.cancel(reason);
            return Ok(true);
        }

        let update = JobUpdate::to(JobStatus::Failed).with_error(format!("Cancelled: {reason}"));
        match self
            .store
            .transition(
                job_id,
                &[JobStatus::Scheduled, JobStatus::WaitingForApproval],
                update,
            )
            .await?
        {
            Some(job) => {
                tracing::info!(job_id = %job_id, reason, "Cancelled job before it started");
                self.broadcast_status(&job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of jobs with a live execution.
    pub async fn live_jobs(&self) -> usize {
        self.live.lock().await.len()
    }

    /// Run one attempt of a job.
    ///
    /// Returns the job's status afterwards, or `None` when the job was not
    /// eligible (not `Scheduled`, or another worker claimed it first).
    pub async fn process_job(&self, job_id: Uuid) -> Result<Option<JobStatus>, Error> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(JobError::NotFound { id: job_id })?;
        if job.status != JobStatus::Scheduled {
            tracing::debug!(job_id = %job_id, status = %job.status, "Skipping job");
            return Ok(None);
        }

        if job.payload.requires_approval && !job.is_approved() {
            return self.park_for_approval(&job).await;
        }

        let task = build_task(&job);
        let routed = match self
            .registry
            .route_task(&task, job.payload.preferred_backend.as_deref())
            .await
        {
            Ok(routed) => routed,
            Err(e) => {
                tracing::warn!(job_id = %job_id, "No backend for job: {}", e);
                let classification = routing_failure_classification(&e);
                return self
                    .fail_unstarted(&job, e.to_string(), classification)
                    .await
                    .map(Some);
            }
        };

        let permit = match self.registry.semaphore(&routed.provider_id).await {
            Some(semaphore) => semaphore
                .acquire(self.config.semaphore_timeout)
                .await
                .map_err(|e| e.to_string()),
            None => Err(format!("Backend {} is not registered", routed.provider_id)),
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(reason) => {
                tracing::warn!(job_id = %job_id, backend = %routed.provider_id, "Admission failed: {}", reason);
                self.registry.abandon_attempt(&routed.provider_id).await;
                return self
                    .fail_unstarted(&job, reason, ErrorClassification::Transient)
                    .await
                    .map(Some);
            }
        };

        let claimed = match self
            .store
            .transition(job_id, &[JobStatus::Scheduled], JobUpdate::start_attempt())
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                self.registry.abandon_attempt(&routed.provider_id).await;
                return Err(e.into());
            }
        };
        let Some(job) = claimed else {
            tracing::debug!(job_id = %job_id, "Job claimed elsewhere");
            self.registry.abandon_attempt(&routed.provider_id).await;
            return Ok(None);
        };

        tracing::info!(
            job_id = %job_id,
            attempt = job.attempt,
            max_attempts = job.max_attempts,
            backend = %routed.provider_id,
            failed_over = routed.failed_over,
            "Job attempt started"
        );
        self.broadcast_status(&job).await;

        let result = self.execute(&job, &routed, task).await;
        self.settle(job, &routed.provider_id, result).await.map(Some)
    }

    /// Consume queued jobs until `shutdown` resolves, then wait for in-flight jobs.
    pub async fn run(
        self: Arc<Self>,
        mut jobs: mpsc::UnboundedReceiver<QueuedJob>,
        shutdown: impl Future<Output = ()> + Send,
    ) {
        let limit = self.config.worker_concurrency.max(1);
        let mut running: JoinSet<(Uuid, Result<Option<JobStatus>, Error>)> = JoinSet::new();
        tokio::pin!(shutdown);
        tracing::info!(concurrency = limit, "Orchestrator running");

        loop {
            if running.len() >= limit {
                tokio::select! {
                    _ = &mut shutdown => break,
                    Some(joined) = running.join_next() => log_joined(joined),
                }
                continue;
            }

            tokio::select! {
                _ = &mut shutdown => break,
                next = jobs.recv() => match next {
                    Some(queued) => {
                        let this = Arc::clone(&self);
                        running.spawn(async move {
                            (queued.job_id, this.process_job(queued.job_id).await)
                        });
                    }
                    None => break,
                },
                Some(joined) = running.join_next(), if !running.is_empty() => log_joined(joined),
            }
        }

        tracing::info!(in_flight = running.len(), "Orchestrator draining");
        while let Some(joined) = running.join_next().await {
            log_joined(joined);
        }
    }

    async fn park_for_approval(&self, job: &Job) -> Result<Option<JobStatus>, Error> {
        let expires_at = after(self.config.approval_ttl);
        let update = JobUpdate::to(JobStatus::WaitingForApproval).with_approval_expiry(expires_at);
        let Some(parked) = self
            .store
            .transition(job.id, &[JobStatus::Scheduled], update)
            .await?
        else {
            return Ok(None);
        };
        tracing::info!(job_id = %job.id, %expires_at, "Job waiting for approval");
        self.broadcast_status(&parked).await;
        Ok(Some(parked.status))
    }

    /// Start the task and follow it to a result, bounded by the task's timeout.
    async fn execute(
        &self,
        job: &Job,
        routed: &RoutedProvider,
        task: ExecutionTask,
    ) -> ExecutionResult {
        let task_id = task.id.clone();
        let limit = task.constraints.timeout;

        let handle = match routed.backend.execute_task(task).await {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                let classification = match &e {
                    BackendError::Execution { classification, .. } => *classification,
                    other => self.classifier.classify(&other.to_string()),
                };
                tracing::warn!(
                    job_id = %job.id,
                    backend = %routed.provider_id,
                    %classification,
                    "Backend refused task: {}",
                    e
                );
                return ExecutionResult::failed(
                    task_id,
                    ExecutionError::new(e.to_string(), classification),
                );
            }
        };

        self.live.lock().await.insert(job.id, Arc::clone(&handle));
        let channel = job_channel(job.id);
        let outcome = tokio::time::timeout(limit, self.follow(&channel, &handle)).await;
        self.live.lock().await.remove(&job.id);

        match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(job_id = %job.id, task_id = %task_id, ?limit, "Task timed out");
                handle.cancel("timeout");
                ExecutionResult::timed_out(task_id, limit)
            }
        }
    }

    /// Forward every event to the job's channel, then return the result.
    async fn follow(&self, channel: &str, handle: &ExecutionHandle) -> ExecutionResult {
        if let Some(mut events) = handle.events() {
            while let Some(event) = events.next().await {
                match serde_json::to_value(&event) {
                    Ok(payload) => {
                        self.broadcaster
                            .broadcast(channel, event.event_type(), payload)
                            .await
                    }
                    Err(e) => tracing::warn!(channel, "Failed to serialize event: {}", e),
                }
            }
        }
        handle.result().await
    }

    /// Turn an attempt's result into the job's next status.
    async fn settle(
        &self,
        job: Job,
        provider_id: &str,
        result: ExecutionResult,
    ) -> Result<JobStatus, Error> {
        tracing::info!(
            job_id = %job.id,
            attempt = job.attempt,
            status = ?result.status,
            classification = ?result.classification(),
            duration_ms = result.duration.as_millis() as u64,
            "Job attempt settled"
        );

        match result.status {
            ExecutionStatus::Completed => {
                self.record_outcome(provider_id, true, None).await;
                self.finish(&job, JobUpdate::to(JobStatus::Completed).with_result(result))
                    .await
            }
            ExecutionStatus::Cancelled => {
                self.registry.abandon_attempt(provider_id).await;
                let update = JobUpdate::to(JobStatus::Failed)
                    .with_error(result.summary.clone())
                    .with_result(result);
                self.finish(&job, update).await
            }
            ExecutionStatus::TimedOut => {
                self.record_outcome(provider_id, false, Some(ErrorClassification::Timeout))
                    .await;
                let update = JobUpdate::to(JobStatus::TimedOut)
                    .with_error(result.summary.clone())
                    .with_result(result);
                self.finish(&job, update).await
            }
            ExecutionStatus::Failed => {
                let classification = result
                    .classification()
                    .unwrap_or(ErrorClassification::Transient);
                self.record_outcome(provider_id, false, Some(classification))
                    .await;
                let error = result.summary.clone();
                if classification.is_retryable() {
                    self.retry_or_dead_letter(&job, error, Some(result), false)
                        .await
                } else {
                    let update = JobUpdate::to(JobStatus::Failed)
                        .with_error(error)
                        .with_result(result);
                    self.finish(&job, update).await
                }
            }
        }
    }

    /// Settle a job that failed before reaching `Running`. Consumes an attempt.
    async fn fail_unstarted(
        &self,
        job: &Job,
        error: String,
        classification: ErrorClassification,
    ) -> Result<JobStatus, Error> {
        if classification.is_retryable() {
            return self.retry_or_dead_letter(job, error, None, true).await;
        }
        let mut update = JobUpdate::to(JobStatus::Failed).with_error(error);
        update.increment_attempt = true;
        self.finish(job, update).await
    }

    async fn retry_or_dead_letter(
        &self,
        job: &Job,
        error: String,
        result: Option<ExecutionResult>,
        consume_attempt: bool,
    ) -> Result<JobStatus, Error> {
        let attempts_used = job.attempt + u32::from(consume_attempt);

        let mut update = if attempts_used >= job.max_attempts {
            tracing::warn!(job_id = %job.id, attempts_used, "Retries exhausted");
            JobUpdate::to(JobStatus::DeadLetter)
                .with_error(format!("{error} (after {attempts_used} attempts)"))
        } else {
            JobUpdate::to(JobStatus::Retrying).with_error(error)
        };
        update.increment_attempt = consume_attempt;
        if let Some(result) = result {
            update = update.with_result(result);
        }
        if update.status == JobStatus::DeadLetter {
            return self.finish(job, update).await;
        }

        let Some(retrying) = self.store.transition(job.id, &[job.status], update).await? else {
            return self.current_status(job.id, JobStatus::Retrying).await;
        };
        self.broadcast_status(&retrying).await;

        let delay = retry_delay(&self.config.retry, retrying.attempt);
        let Some(scheduled) = self
            .store
            .transition(
                job.id,
                &[JobStatus::Retrying],
                JobUpdate::to(JobStatus::Scheduled),
            )
            .await?
        else {
            return self.current_status(job.id, JobStatus::Retrying).await;
        };

        match self
            .enqueue(&job.identifier, job.id, Some(after(delay)), job.max_attempts)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    job_id = %job.id,
                    attempt = scheduled.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retry scheduled"
                );
                self.broadcast_status(&scheduled).await;
                Ok(scheduled.status)
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, "Failed to enqueue retry: {}", e);
                let update = JobUpdate::to(JobStatus::DeadLetter).with_error(e.to_string());
                self.finish(&scheduled, update).await
            }
        }
    }

    /// Write a status transition from the job's current status and broadcast it.
    async fn finish(&self, job: &Job, update: JobUpdate) -> Result<JobStatus, Error> {
        let target = update.status;
        match self.store.transition(job.id, &[job.status], update).await? {
            Some(updated) => {
                if updated.status.is_terminal() {
                    tracing::info!(
                        job_id = %job.id,
                        status = %updated.status,
                        attempt = updated.attempt,
                        error = ?updated.error,
                        "Job finished"
                    );
                }
                self.broadcast_status(&updated).await;
                Ok(updated.status)
            }
            None => self.current_status(job.id, target).await,
        }
    }

    async fn current_status(&self, job_id: Uuid, fallback: JobStatus) -> Result<JobStatus, Error> {
        tracing::warn!(job_id = %job_id, "Job changed while settling");
        Ok(self
            .store
            .get(job_id)
            .await?
            .map(|j| j.status)
            .unwrap_or(fallback))
    }

    async fn record_outcome(
        &self,
        provider_id: &str,
        success: bool,
        classification: Option<ErrorClassification>,
    ) {
        if let Err(e) = self
            .registry
            .record_outcome(provider_id, success, classification)
            .await
        {
            tracing::warn!(backend = %provider_id, "Failed to record outcome: {}", e);
        }
    }

    async fn enqueue(
        &self,
        identifier: &str,
        job_id: Uuid,
        run_at: Option<DateTime<Utc>>,
        max_attempts: u32,
    ) -> Result<(), JobError> {
        self.queue
            .add_job(
                identifier,
                QueuedJob { job_id },
                AddJobOptions {
                    job_key: Some(job_id.to_string()),
                    run_at,
                    max_attempts: Some(max_attempts),
                },
            )
            .await
    }

    async fn broadcast_status(&self, job: &Job) {
        let payload = serde_json::json!({
            "status": job.status,
            "attempt": job.attempt,
            "max_attempts": job.max_attempts,
            "error": job.error,
        });
        self.broadcaster
            .broadcast(&job_channel(job.id), "status", payload)
            .await;
    }
}

/// A fresh task for this attempt.
fn build_task(job: &Job) -> ExecutionTask {
    ExecutionTask::new(
        job.id,
        job.payload.agent_id.clone(),
        job.payload.instruction.clone(),
    )
    .with_context(job.payload.context.clone())
    .with_constraints(job.payload.constraints.clone())
}

/// Routing failures that may clear up on their own are transient.
fn routing_failure_classification(error: &RegistryError) -> ErrorClassification {
    match error {
        RegistryError::NoBackendAvailable { .. }
        | RegistryError::Router(RouterError::AllProvidersOpen { .. }) => {
            ErrorClassification::Transient
        }
        _ => ErrorClassification::Permanent,
    }
}

fn after(delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn log_joined(
    joined: Result<(Uuid, Result<Option<JobStatus>, Error>), tokio::task::JoinError>,
) {
    match joined {
        Ok((job_id, Ok(status))) => {
            tracing::debug!(job_id = %job_id, status = ?status, "Job processed")
        }
        Ok((job_id, Err(e))) => tracing::error!(job_id = %job_id, "Job processing failed: {}", e),
        Err(e) => tracing::error!("Job task panicked: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendConfig, GoalType, ScriptedOutcome, StubBackend, TaskInstruction};
    use crate::jobs::broadcast::{ChannelBroadcaster, NoopBroadcaster};
    use crate::jobs::queue::InMemoryJobQueue;
    use crate::jobs::store::InMemoryJobStore;
    use crate::resilience::{CircuitBreakerConfig, CircuitState};

    struct Harness {
        orchestrator: JobOrchestrator,
        store: Arc<InMemoryJobStore>,
        _rx: mpsc::UnboundedReceiver<QueuedJob>,
    }

    fn fast_retry() -> OrchestratorConfig {
        OrchestratorConfig {
            worker_concurrency: 4,
            semaphore_timeout: Duration::from_millis(50),
            approval_ttl: Duration::from_secs(3600),
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        }
    }

    async fn harness(stub: StubBackend) -> (Harness, Arc<StubBackend>) {
        let stub = Arc::new(stub);
        let registry = Arc::new(BackendRegistry::new());
        registry
            .register(
                stub.clone(),
                &BackendConfig::Stub,
                1,
                CircuitBreakerConfig {
                    failure_threshold: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let store = Arc::new(InMemoryJobStore::new());
        let (queue, rx) = InMemoryJobQueue::channel();
        let orchestrator = JobOrchestrator::new(
            registry,
            store.clone(),
            Arc::new(queue),
            Arc::new(NoopBroadcaster),
            fast_retry(),
        );
        (
            Harness {
                orchestrator,
                store,
                _rx: rx,
            },
            stub,
        )
    }

    fn payload() -> JobPayload {
        JobPayload::new(
            "agent-1",
            TaskInstruction {
                prompt: "do the thing".into(),
                goal_type: GoalType::Code,
                target_files: vec![],
                prior_turns: vec![],
            },
        )
    }

    #[tokio::test]
    async fn permanent_failure_fails_without_retry() {
        let (h, _stub) = harness(StubBackend::new("stub").with_script([ScriptedOutcome::fail(
            "invalid prompt",
            ErrorClassification::Permanent,
        )]))
        .await;
        let id = h.orchestrator.submit("job", payload(), None).await.unwrap();

        let status = h.orchestrator.process_job(id).await.unwrap();
        assert_eq!(status, Some(JobStatus::Failed));
        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 1);
        assert_eq!(job.error.as_deref(), Some("invalid prompt"));
        assert_eq!(
            h.orchestrator.registry().circuit_states().await["stub"].window_failures,
            0
        );
    }

    #[tokio::test]
    async fn transient_failure_reschedules_then_dead_letters() {
        let (h, _stub) = harness(
            StubBackend::new("stub")
                .with_fallback(ScriptedOutcome::fail("ECONNRESET", ErrorClassification::Transient)),
        )
        .await;
        let id = h.orchestrator.submit("job", payload(), Some(2)).await.unwrap();

        assert_eq!(
            h.orchestrator.process_job(id).await.unwrap(),
            Some(JobStatus::Scheduled)
        );
        assert_eq!(
            h.orchestrator.process_job(id).await.unwrap(),
            Some(JobStatus::DeadLetter)
        );
        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 2);
        assert!(job.error.unwrap().contains("after 2 attempts"));
        assert_eq!(
            h.orchestrator.registry().circuit_states().await["stub"].state,
            CircuitState::Open
        );
    }

    #[tokio::test]
    async fn rejected_task_is_classified() {
        let (h, stub) = harness(StubBackend::new("stub").with_script([ScriptedOutcome::reject(
            "connection reset by peer",
            ErrorClassification::Transient,
        )]))
        .await;
        let id = h.orchestrator.submit("job", payload(), None).await.unwrap();

        assert_eq!(
            h.orchestrator.process_job(id).await.unwrap(),
            Some(JobStatus::Scheduled)
        );
        assert_eq!(
            h.orchestrator.process_job(id).await.unwrap(),
            Some(JobStatus::Completed)
        );
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test]
    async fn open_circuit_fails_before_running() {
        let (h, stub) = harness(StubBackend::new("stub")).await;
        for _ in 0..2 {
            h.orchestrator
                .registry()
                .record_outcome("stub", false, Some(ErrorClassification::Resource))
                .await
                .unwrap();
        }
        let id = h.orchestrator.submit("job", payload(), Some(1)).await.unwrap();

        assert_eq!(
            h.orchestrator.process_job(id).await.unwrap(),
            Some(JobStatus::DeadLetter)
        );
        let job = h.store.get(id).await.unwrap().unwrap();
        assert!(job.started_at.is_none());
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn task_timeout_cancels_and_times_out() {
        let (h, stub) = harness(StubBackend::new("stub").with_fallback(ScriptedOutcome::Hang)).await;
        let mut payload = payload();
        payload.constraints.timeout = Duration::from_millis(50);
        let id = h.orchestrator.submit("job", payload, None).await.unwrap();

        assert_eq!(
            h.orchestrator.process_job(id).await.unwrap(),
            Some(JobStatus::TimedOut)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stub.active(), 0);
        assert_eq!(h.orchestrator.live_jobs().await, 0);
        let stats = &h.orchestrator.registry().circuit_states().await["stub"];
        assert_eq!(stats.window_failures, 0);
    }

    #[tokio::test]
    async fn cancel_job_stops_live_execution() {
        let (h, _stub) = harness(StubBackend::new("stub").with_fallback(ScriptedOutcome::Hang)).await;
        let id = h.orchestrator.submit("job", payload(), None).await.unwrap();
        let orchestrator = Arc::new(h.orchestrator);

        let worker = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.process_job(id).await })
        };
        while orchestrator.live_jobs().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(orchestrator.cancel_job(id, "user request").await.unwrap());

        let status = worker.await.unwrap().unwrap();
        assert_eq!(status, Some(JobStatus::Failed));
        let job = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some("Cancelled: user request"));
    }

    #[tokio::test]
    async fn cancel_before_start_fails_job() {
        let (h, stub) = harness(StubBackend::new("stub")).await;
        let id = h.orchestrator.submit("job", payload(), None).await.unwrap();
        assert!(h.orchestrator.cancel_job(id, "nope").await.unwrap());
        assert_eq!(h.orchestrator.process_job(id).await.unwrap(), None);
        assert_eq!(stub.calls(), 0);
        assert!(!h.orchestrator.cancel_job(id, "again").await.unwrap());
    }

    #[tokio::test]
    async fn approved_job_runs() {
        let (h, _stub) = harness(StubBackend::new("stub")).await;
        let mut payload = payload();
        payload.requires_approval = true;
        let id = h.orchestrator.submit("job", payload, None).await.unwrap();

        assert_eq!(
            h.orchestrator.process_job(id).await.unwrap(),
            Some(JobStatus::WaitingForApproval)
        );
        assert!(h.orchestrator.resolve_approval(id, true).await.unwrap());
        assert_eq!(
            h.orchestrator.process_job(id).await.unwrap(),
            Some(JobStatus::Completed)
        );
    }

    #[tokio::test]
    async fn events_are_forwarded_to_job_channel() {
        let stub = Arc::new(StubBackend::new("stub").with_script([ScriptedOutcome::complete(
            "done",
        )
        .with_events(vec![crate::backend::OutputEvent::text("working")])]));
        let registry = Arc::new(BackendRegistry::new());
        registry
            .register(stub, &BackendConfig::Stub, 1, CircuitBreakerConfig::default())
            .await
            .unwrap();
        let broadcaster = Arc::new(ChannelBroadcaster::new());
        let mut rx = broadcaster.subscribe();
        let store = Arc::new(InMemoryJobStore::new());
        let (queue, _queue_rx) = InMemoryJobQueue::channel();
        let orchestrator = JobOrchestrator::new(
            registry,
            store,
            Arc::new(queue),
            broadcaster.clone(),
            fast_retry(),
        );

        let id = orchestrator.submit("job", payload(), None).await.unwrap();
        orchestrator.process_job(id).await.unwrap();

        let mut event_types = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            assert_eq!(msg.channel, job_channel(id));
            event_types.push(msg.event_type);
        }
        assert_eq!(event_types, vec!["status", "text", "complete", "status"]);
    }
}
