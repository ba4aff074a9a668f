//! Scripted backend for tests and dry runs.
//!
//! Each `execute_task` call pops the next [`ScriptedOutcome`]; once the script
//! is exhausted the fallback outcome repeats. Active and peak concurrency are
//! tracked so callers can assert on admission control.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::handle::{self, Canceller, ExecutionHandle, HandleSink};
use super::types::{
    BackendCapabilities, BackendHealthReport, ErrorClassification, ExecutionError,
    ExecutionResult, ExecutionTask, FileChange, GoalType, OutputEvent,
};
use super::{BackendConfig, BackendKind, ExecutionBackend, wrong_kind};
use crate::error::BackendError;

/// What the stub does for one task.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Emit the events, then settle completed.
    Complete {
        summary: String,
        file_changes: Vec<FileChange>,
        events: Vec<OutputEvent>,
    },
    /// Settle failed with this error.
    Fail(ExecutionError),
    /// `execute_task` itself errors; no handle is created.
    Reject {
        message: String,
        classification: ErrorClassification,
    },
    /// Never settle on its own; only a cancel ends it.
    Hang,
}

impl ScriptedOutcome {
    pub fn complete(summary: impl Into<String>) -> Self {
        Self::Complete {
            summary: summary.into(),
            file_changes: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn fail(message: impl Into<String>, classification: ErrorClassification) -> Self {
        Self::Fail(ExecutionError::new(message, classification))
    }

    pub fn reject(message: impl Into<String>, classification: ErrorClassification) -> Self {
        Self::Reject {
            message: message.into(),
            classification,
        }
    }

    pub fn with_file_changes(mut self, changes: Vec<FileChange>) -> Self {
        if let Self::Complete { file_changes, .. } = &mut self {
            *file_changes = changes;
        }
        self
    }

    pub fn with_events(mut self, new_events: Vec<OutputEvent>) -> Self {
        if let Self::Complete { events, .. } = &mut self {
            *events = new_events;
        }
        self
    }
}

/// Decrements the active counter even if the execution task is aborted.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory backend driven by a script.
pub struct StubBackend {
    id: String,
    started: AtomicBool,
    healthy: AtomicBool,
    script: Mutex<VecDeque<ScriptedOutcome>>,
    fallback: ScriptedOutcome,
    delay: Duration,
    calls: AtomicUsize,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    running: Mutex<Vec<(JoinHandle<()>, Canceller)>>,
}

impl StubBackend {
    /// A stub that completes every task with a fixed summary.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            started: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            script: Mutex::new(VecDeque::new()),
            fallback: ScriptedOutcome::complete("stub completed"),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            running: Mutex::new(Vec::new()),
        }
    }

    /// Outcomes to play in order before falling back.
    pub fn with_script(mut self, outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        self.script = Mutex::new(outcomes.into_iter().collect());
        self
    }

    /// Outcome used once the script runs out.
    pub fn with_fallback(mut self, outcome: ScriptedOutcome) -> Self {
        self.fallback = outcome;
        self
    }

    /// Simulated execution time per task.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of `execute_task` calls, including rejected ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Executions currently in flight.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous executions observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn next_outcome(&self) -> ScriptedOutcome {
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    async fn play(sink: HandleSink, outcome: ScriptedOutcome, delay: Duration) {
        let started = Instant::now();
        let task_id = sink.task_id().to_string();

        if !delay.is_zero() {
            tokio::select! {
                _ = sink.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match outcome {
            ScriptedOutcome::Complete {
                summary,
                file_changes,
                events,
            } => {
                for event in events {
                    if !sink.emit(event).await {
                        return;
                    }
                }
                for change in &file_changes {
                    if !sink
                        .emit(OutputEvent::FileChange {
                            change: change.clone(),
                        })
                        .await
                    {
                        return;
                    }
                }
                let mut result = ExecutionResult::completed(&task_id, summary)
                    .with_duration(started.elapsed());
                result.exit_code = Some(0);
                result.file_changes = file_changes;
                sink.finish(result).await;
            }
            ScriptedOutcome::Fail(error) => {
                sink.emit(OutputEvent::Error {
                    error: error.clone(),
                })
                .await;
                sink.finish(
                    ExecutionResult::failed(&task_id, error).with_duration(started.elapsed()),
                )
                .await;
            }
            ScriptedOutcome::Hang => sink.cancelled().await,
            ScriptedOutcome::Reject { .. } => {}
        }
    }
}

#[async_trait]
impl ExecutionBackend for StubBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Stub
    }

    async fn start(&self, config: &BackendConfig) -> Result<(), BackendError> {
        if !matches!(config, BackendConfig::Stub) {
            return Err(wrong_kind(&self.id, BackendKind::Stub, config));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.started.store(false, Ordering::SeqCst);
        for (task, canceller) in self.running.lock().await.drain(..) {
            canceller.cancel("backend stopped");
            let _ = task.await;
        }
        Ok(())
    }

    async fn health_check(&self) -> BackendHealthReport {
        if !self.is_started() {
            return BackendHealthReport::unhealthy(&self.id, "not started");
        }
        if self.healthy.load(Ordering::SeqCst) {
            BackendHealthReport::healthy(&self.id, Duration::ZERO)
        } else {
            BackendHealthReport::unhealthy(&self.id, "marked unhealthy")
        }
    }

    async fn execute_task(&self, task: ExecutionTask) -> Result<ExecutionHandle, BackendError> {
        if !self.is_started() {
            return Err(BackendError::NotStarted {
                id: self.id.clone(),
            });
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        let outcome = self.next_outcome().await;
        if let ScriptedOutcome::Reject {
            message,
            classification,
        } = outcome
        {
            return Err(BackendError::Execution {
                id: self.id.clone(),
                message,
                classification,
            });
        }

        let (handle, sink) = handle::channel(task.id.clone());

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.active));

        let delay = self.delay;
        let canceller = sink.canceller();
        let join = tokio::spawn(async move {
            let _guard = guard;
            Self::play(sink, outcome, delay).await;
        });

        let mut running = self.running.lock().await;
        running.retain(|(task, _)| !task.is_finished());
        running.push((join, canceller));

        tracing::debug!(backend = %self.id, task_id = %task.id, "Stub execution started");
        Ok(handle)
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            goal_types: vec![
                GoalType::Code,
                GoalType::Review,
                GoalType::Research,
                GoalType::Chat,
            ],
            streaming: true,
            cancellation: true,
            file_edits: true,
            context_window: 0,
        }
    }
}
