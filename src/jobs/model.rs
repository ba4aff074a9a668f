//! Job rows and the job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{ExecutionResult, TaskConstraints, TaskContext, TaskInstruction};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued, waiting for a worker.
    Scheduled,
    /// An attempt is executing.
    Running,
    /// Parked until a human approves or rejects it.
    WaitingForApproval,
    /// An attempt failed; the next one is being scheduled.
    Retrying,
    Completed,
    /// Failed without further retries.
    Failed,
    TimedOut,
    /// Retries exhausted.
    DeadLetter,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Scheduled
            (Scheduled, Running) | (Scheduled, WaitingForApproval) |
            (Scheduled, Retrying) | (Scheduled, Failed) | (Scheduled, DeadLetter) |
            // From WaitingForApproval (approval subsystem)
            (WaitingForApproval, Scheduled) | (WaitingForApproval, Failed) |
            // From Running
            (Running, Completed) | (Running, Failed) | (Running, TimedOut) |
            (Running, Retrying) | (Running, DeadLetter) |
            // From Retrying
            (Retrying, Scheduled) | (Retrying, DeadLetter)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::DeadLetter
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::WaitingForApproval => "WAITING_FOR_APPROVAL",
            Self::Retrying => "RETRYING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::DeadLetter => "DEAD_LETTER",
        };
        write!(f, "{s}")
    }
}

/// What a job asks an agent to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub agent_id: String,
    pub instruction: TaskInstruction,
    #[serde(default)]
    pub context: TaskContext,
    #[serde(default)]
    pub constraints: TaskConstraints,
    #[serde(default)]
    pub requires_approval: bool,
    /// Backend to try first, if it is admitted.
    #[serde(default)]
    pub preferred_backend: Option<String>,
}

impl JobPayload {
    pub fn new(agent_id: impl Into<String>, instruction: TaskInstruction) -> Self {
        Self {
            agent_id: agent_id.into(),
            instruction,
            context: TaskContext::default(),
            constraints: TaskConstraints::default(),
            requires_approval: false,
            preferred_backend: None,
        }
    }
}

/// Persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub identifier: String,
    pub status: JobStatus,
    /// Attempts started so far.
    pub attempt: u32,
    pub max_attempts: u32,
    pub error: Option<String>,
    pub result: Option<ExecutionResult>,
    pub payload: JobPayload,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub approval_expires_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh `Scheduled` job.
    pub fn new(identifier: impl Into<String>, payload: JobPayload, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            identifier: identifier.into(),
            status: JobStatus::Scheduled,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            error: None,
            result: None,
            payload,
            started_at: None,
            completed_at: None,
            approval_expires_at: None,
            approved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.approved_at.is_some()
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Apply an update; the target status must be a legal transition.
    pub(crate) fn apply(&mut self, update: JobUpdate) {
        let now = Utc::now();
        self.status = update.status;
        if update.increment_attempt {
            self.attempt += 1;
        }
        if update.mark_started {
            self.started_at = Some(now);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if let Some(result) = update.result {
            self.result = Some(*result);
        }
        if let Some(expires) = update.approval_expires_at {
            self.approval_expires_at = Some(expires);
        }
        if self.status.is_terminal() {
            self.completed_at = Some(now);
        }
        self.updated_at = now;
    }
}

/// Changes written together with a status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub increment_attempt: bool,
    pub mark_started: bool,
    pub error: Option<String>,
    pub result: Option<Box<ExecutionResult>>,
    pub approval_expires_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn to(status: JobStatus) -> Self {
        Self {
            status,
            increment_attempt: false,
            mark_started: false,
            error: None,
            result: None,
            approval_expires_at: None,
        }
    }

    /// Start a new attempt.
    pub fn start_attempt() -> Self {
        Self {
            increment_attempt: true,
            mark_started: true,
            ..Self::to(JobStatus::Running)
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_result(mut self, result: ExecutionResult) -> Self {
        self.result = Some(Box::new(result));
        self
    }

    pub fn with_approval_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.approval_expires_at = Some(expires_at);
        self
    }
}
