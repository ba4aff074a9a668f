//! Job lifecycle: persisted job rows, the queue that feeds workers, live
//! event fan-out, and the orchestrator that drives each attempt.

pub mod broadcast;
pub mod classify;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod store;

pub use broadcast::{ChannelBroadcaster, NoopBroadcaster, StreamBroadcaster, StreamMessage, job_channel};
pub use classify::FailureClassifier;
pub use model::{Job, JobPayload, JobStatus, JobUpdate};
pub use orchestrator::{JobOrchestrator, OrchestratorConfig};
pub use queue::{AddJobOptions, InMemoryJobQueue, JobQueue, QueuedJob};
pub use store::{InMemoryJobStore, JobStore};
