//! Execution backends: the uniform task-execution contract.
//!
//! Variants:
//! - `cli`: drives a coding CLI as a subprocess, parsing its line protocol
//! - `api`: runs an agentic tool loop against an HTTP LLM provider
//! - `stub`: scripted outcomes for tests and dry runs
//!
//! Every variant returns an [`ExecutionHandle`] from `execute_task` without
//! waiting for the work to finish. Failures during execution are captured in
//! the settled [`ExecutionResult`], never raised out of the handle.

pub mod api;
pub mod cli;
pub mod handle;
pub mod stub;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ApiBackendConfig, CliBackendConfig};
use crate::error::BackendError;

pub use api::ApiBackend;
pub use cli::CliBackend;
pub use handle::{EventStream, ExecutionHandle, HandleSink};
pub use stub::{ScriptedOutcome, StubBackend};
pub use types::*;

/// Upper bound for any backend health probe.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Which family a backend belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Cli,
    Api,
    Stub,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cli => "cli",
            Self::Api => "api",
            Self::Stub => "stub",
        };
        write!(f, "{s}")
    }
}

/// Startup configuration handed to `ExecutionBackend::start`.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Cli(CliBackendConfig),
    Api(ApiBackendConfig),
    Stub,
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Cli(_) => BackendKind::Cli,
            Self::Api(_) => BackendKind::Api,
            Self::Stub => BackendKind::Stub,
        }
    }
}

/// Contract every backend plugin implements.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Stable identifier, unique within a registry.
    fn id(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Validate configuration and get ready to accept tasks.
    ///
    /// Fails on fatal misconfiguration such as a missing credential or binary.
    async fn start(&self, config: &BackendConfig) -> Result<(), BackendError>;

    /// Terminate active executions. Safe to call when idle.
    async fn stop(&self) -> Result<(), BackendError>;

    /// Probe health. Never fails; bounded by [`HEALTH_CHECK_TIMEOUT`].
    async fn health_check(&self) -> BackendHealthReport;

    /// Begin executing a task and return its live handle immediately.
    async fn execute_task(&self, task: ExecutionTask) -> Result<ExecutionHandle, BackendError>;

    fn capabilities(&self) -> BackendCapabilities;
}

/// Error for a config meant for a different backend family.
pub(crate) fn wrong_kind(id: &str, expected: BackendKind, config: &BackendConfig) -> BackendError {
    BackendError::Misconfigured {
        id: id.to_string(),
        reason: format!("expected {expected} config, got {}", config.kind()),
    }
}
