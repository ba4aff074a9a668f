//! Error types for agent-dispatch.

use std::time::Duration;

use uuid::Uuid;

use crate::backend::ErrorClassification;

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Semaphore error: {0}")]
    Semaphore(#[from] SemaphoreError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by an execution backend outside of a settled result.
///
/// Failures that happen *while* a task runs are captured into the task's
/// `ExecutionResult`; these variants cover lifecycle misuse and failures that
/// prevent a handle from ever existing.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend {id} is not started")]
    NotStarted { id: String },

    #[error("Backend {id} misconfigured: {reason}")]
    Misconfigured { id: String, reason: String },

    #[error("Backend {id} executable not found: {binary}")]
    BinaryNotFound { id: String, binary: String },

    #[error("Backend {id} failed to execute task: {message}")]
    Execution {
        id: String,
        message: String,
        classification: ErrorClassification,
    },

    #[error("Backend {id} failed to stop: {reason}")]
    StopFailed { id: String, reason: String },
}

impl BackendError {
    /// Failure class used by the job lifecycle when no result exists.
    pub fn classification(&self) -> ErrorClassification {
        match self {
            Self::Execution { classification, .. } => *classification,
            Self::NotStarted { .. } => ErrorClassification::Transient,
            Self::Misconfigured { .. } | Self::BinaryNotFound { .. } => {
                ErrorClassification::Permanent
            }
            Self::StopFailed { .. } => ErrorClassification::Transient,
        }
    }
}

/// Concurrency-limiter errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SemaphoreError {
    #[error("Timed out after {timeout:?} waiting for a slot on backend {backend}")]
    Timeout { backend: String, timeout: Duration },

    #[error("Semaphore for backend {backend} was closed while waiting")]
    Closed { backend: String },
}

/// Provider routing errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("No providers registered")]
    NoProviders,

    #[error("All {count} providers have open circuits")]
    AllProvidersOpen { count: usize },

    #[error("Provider {0} already registered")]
    DuplicateProvider(String),

    #[error("Provider {0} not found")]
    UnknownProvider(String),
}

/// Backend registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Backend {0} is already registered")]
    DuplicateBackend(String),

    #[error("Backend {0} not found")]
    UnknownBackend(String),

    #[error("No backend available for task {task_id}")]
    NoBackendAvailable { task_id: String },

    #[error("Registry has been stopped")]
    Stopped,

    #[error("Failed to start backend {id}: {source}")]
    StartFailed {
        id: String,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Failed to enqueue job {id}: {reason}")]
    EnqueueFailed { id: Uuid, reason: String },

    #[error("Job store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} rejected the request: {reason}")]
    BadRequest { provider: String, reason: String },

    #[error("Context length exceeded: {used} tokens used, {limit} allowed")]
    ContextLengthExceeded { used: usize, limit: usize },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Map a provider failure onto the execution failure taxonomy.
    pub fn classification(&self) -> ErrorClassification {
        match self {
            Self::RequestFailed { .. } | Self::RateLimited { .. } => {
                ErrorClassification::Transient
            }
            Self::InvalidResponse { .. } | Self::Json(_) => ErrorClassification::Transient,
            Self::BadRequest { .. }
            | Self::ContextLengthExceeded { .. }
            | Self::AuthFailed { .. } => {
                ErrorClassification::Permanent
            }
        }
    }
}

/// Tool execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Tool {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Invalid parameters for tool {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Tool {name} is not allowed for this task")]
    NotAllowed { name: String },

    #[error("Tool {name} not authorized: {reason}")]
    NotAuthorized { name: String, reason: String },
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
