//! Task, result, and event types shared by every execution backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default wall-clock budget for one task attempt.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default number of agentic turns for API backends.
pub const DEFAULT_MAX_TURNS: u32 = 25;

/// What kind of work the task asks for. Backends advertise which they support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    Code,
    Review,
    Research,
    Chat,
}

/// A previous exchange carried into the task prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorTurn {
    pub role: String,
    pub content: String,
}

/// What to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstruction {
    pub prompt: String,
    pub goal_type: GoalType,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub prior_turns: Vec<PriorTurn>,
}

/// File content handed to the backend up-front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreloadedFile {
    pub path: String,
    pub content: String,
}

/// Where and with what background the task runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub workspace: Option<PathBuf>,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub memories: Vec<String>,
    #[serde(default)]
    pub preloaded_files: Vec<PreloadedFile>,
    /// Extra variables for subprocess backends. Applied after the allowlist.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// Limits applied to one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConstraints {
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub max_tokens: Option<u32>,
    pub max_turns: u32,
    pub model: Option<String>,
    /// Empty means every registered tool is allowed.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default)]
    pub allow_shell: bool,
}

impl Default for TaskConstraints {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TASK_TIMEOUT,
            max_tokens: None,
            max_turns: DEFAULT_MAX_TURNS,
            model: None,
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            allow_network: false,
            allow_shell: false,
        }
    }
}

impl TaskConstraints {
    /// Whether a tool may be invoked under these constraints. Deny wins over allow.
    pub fn permits_tool(&self, name: &str) -> bool {
        if self.denied_tools.iter().any(|t| t == name) {
            return false;
        }
        self.allowed_tools.is_empty() || self.allowed_tools.iter().any(|t| t == name)
    }
}

/// One unit of agentic work, created per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub id: String,
    pub job_id: Uuid,
    pub agent_id: String,
    pub instruction: TaskInstruction,
    #[serde(default)]
    pub context: TaskContext,
    #[serde(default)]
    pub constraints: TaskConstraints,
}

impl ExecutionTask {
    /// Create a task with a fresh id and default context/constraints.
    pub fn new(job_id: Uuid, agent_id: impl Into<String>, instruction: TaskInstruction) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id,
            agent_id: agent_id.into(),
            instruction,
            context: TaskContext::default(),
            constraints: TaskConstraints::default(),
        }
    }

    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_constraints(mut self, constraints: TaskConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}

/// Failure taxonomy. Drives both circuit breaking and job retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    /// Network or rate-limit style failure.
    Transient,
    /// Exhaustion, e.g. an out-of-memory kill.
    Resource,
    /// Exceeded a deadline; may reflect task size rather than backend health.
    Timeout,
    /// Non-retryable, e.g. bad credentials or bad input.
    Permanent,
}

impl ErrorClassification {
    /// Whether this failure says something about the backend's health.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(self, Self::Transient | Self::Resource)
    }

    /// Whether the job policy may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

impl std::fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Resource => "resource",
            Self::Timeout => "timeout",
            Self::Permanent => "permanent",
        };
        write!(f, "{s}")
    }
}

/// Failure attached to a settled result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub message: String,
    pub classification: ErrorClassification,
    pub code: Option<String>,
    /// Side effects may have happened before the failure.
    pub partial_execution: bool,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>, classification: ErrorClassification) -> Self {
        Self {
            message: message.into(),
            classification,
            code: None,
            partial_execution: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn partial(mut self, partial: bool) -> Self {
        self.partial_execution = partial;
        self
    }
}

/// Terminal status of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// How a file was touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: FileChangeKind,
}

/// Token usage, accumulated across turns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Named output produced by a task beyond file edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub content: serde_json::Value,
}

/// Terminal outcome of one task. Settled exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub summary: String,
    #[serde(default)]
    pub file_changes: Vec<FileChange>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub error: Option<ExecutionError>,
}

impl ExecutionResult {
    pub fn completed(task_id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: ExecutionStatus::Completed,
            exit_code: None,
            summary: summary.into(),
            file_changes: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            usage: TokenUsage::default(),
            artifacts: Vec::new(),
            duration: Duration::ZERO,
            error: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: ExecutionError) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            summary: error.message.clone(),
            error: Some(error),
            ..Self::completed(task_id, "")
        }
    }

    pub fn cancelled(task_id: impl Into<String>, reason: &str) -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            summary: format!("Cancelled: {reason}"),
            ..Self::completed(task_id, "")
        }
    }

    pub fn timed_out(task_id: impl Into<String>, after: Duration) -> Self {
        let error = ExecutionError::new(
            format!("Execution exceeded {}s", after.as_secs()),
            ErrorClassification::Timeout,
        );
        Self {
            status: ExecutionStatus::TimedOut,
            duration: after,
            ..Self::failed(task_id, error)
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// Classification of the failure, if any.
    pub fn classification(&self) -> Option<ErrorClassification> {
        self.error.as_ref().map(|e| e.classification)
    }
}

/// Streamed output of a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        output: String,
        is_error: bool,
    },
    FileChange {
        change: FileChange,
    },
    Progress {
        message: String,
        percent: Option<f32>,
    },
    Usage {
        usage: TokenUsage,
    },
    Error {
        error: ExecutionError,
    },
    /// Always the last event of a task that was not cancelled.
    Complete {
        result: ExecutionResult,
    },
}

impl OutputEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Event name used when forwarding to live subscribers.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::FileChange { .. } => "file_change",
            Self::Progress { .. } => "progress",
            Self::Usage { .. } => "usage",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

/// Coarse backend health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health probe result. Informational only; admission is the breaker's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendHealthReport {
    pub backend_id: String,
    pub status: HealthStatus,
    pub reason: Option<String>,
    pub checked_at: DateTime<Utc>,
    #[serde(with = "duration_millis")]
    pub latency: Duration,
}

impl BackendHealthReport {
    pub fn healthy(backend_id: impl Into<String>, latency: Duration) -> Self {
        Self {
            backend_id: backend_id.into(),
            status: HealthStatus::Healthy,
            reason: None,
            checked_at: Utc::now(),
            latency,
        }
    }

    pub fn unhealthy(backend_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            status: HealthStatus::Unhealthy,
            reason: Some(reason.into()),
            checked_at: Utc::now(),
            latency: Duration::ZERO,
        }
    }

    pub fn degraded(backend_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            ..Self::unhealthy(backend_id, reason)
        }
    }
}

/// Static feature descriptor of a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub goal_types: Vec<GoalType>,
    pub streaming: bool,
    pub cancellation: bool,
    pub file_edits: bool,
    pub context_window: u32,
}

impl BackendCapabilities {
    pub fn supports(&self, goal: GoalType) -> bool {
        self.goal_types.contains(&goal)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_breaker_and_retry_rules() {
        assert!(ErrorClassification::Transient.counts_toward_breaker());
        assert!(ErrorClassification::Resource.counts_toward_breaker());
        assert!(!ErrorClassification::Timeout.counts_toward_breaker());
        assert!(!ErrorClassification::Permanent.counts_toward_breaker());

        assert!(ErrorClassification::Timeout.is_retryable());
        assert!(!ErrorClassification::Permanent.is_retryable());
    }

    #[test]
    fn deny_list_wins_over_allow_list() {
        let constraints = TaskConstraints {
            allowed_tools: vec!["read_file".into(), "write_file".into()],
            denied_tools: vec!["write_file".into()],
            ..Default::default()
        };
        assert!(constraints.permits_tool("read_file"));
        assert!(!constraints.permits_tool("write_file"));
        assert!(!constraints.permits_tool("shell"));

        let open = TaskConstraints::default();
        assert!(open.permits_tool("anything"));
    }

    #[test]
    fn output_event_serializes_with_type_tag() {
        let event = OutputEvent::text("hello");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hello");
        assert_eq!(event.event_type(), "text");
    }

    #[test]
    fn failed_result_carries_classification() {
        let result = ExecutionResult::failed(
            "t1",
            ExecutionError::new("boom", ErrorClassification::Resource).partial(true),
        );
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.classification(), Some(ErrorClassification::Resource));
        assert!(result.error.as_ref().unwrap().partial_execution);
        assert!(!result.is_success());
    }

    #[test]
    fn timed_out_result_is_timeout_classified() {
        let result = ExecutionResult::timed_out("t1", Duration::from_secs(5));
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert_eq!(result.classification(), Some(ErrorClassification::Timeout));
    }

    #[test]
    fn token_usage_accumulates() {
        let mut usage = TokenUsage::default();
        usage.add(TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        });
        usage.add(TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
        });
        assert_eq!(usage.total(), 18);
    }
}
