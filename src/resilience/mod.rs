//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Attempt on a backend:
//!     → circuit_breaker.rs (admit or fail fast; lazily half-opens)
//!     → semaphore.rs (bounded wait for a concurrency slot)
//!     → On failure: backoff.rs (delay before the job is re-enqueued)
//! Registry polling:
//!     → health.rs (TTL memo around the backend probe)
//! ```
//!
//! # Design Decisions
//! - One breaker, semaphore and health cache per backend, owned by the registry
//! - Only transient/resource failures trip a breaker
//! - Permits are RAII guards; dropping one releases the slot

pub mod backoff;
pub mod circuit_breaker;
pub mod health;
pub mod semaphore;

pub use backoff::{calculate_backoff, retry_delay};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use health::CachedHealthCheck;
pub use semaphore::{BackendPermit, BackendSemaphore, SemaphoreStats};
