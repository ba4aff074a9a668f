//! Agent Dispatch: execution-backend orchestration for agent jobs.

pub mod backend;
pub mod config;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod registry;
pub mod resilience;
pub mod router;
pub mod tools;
