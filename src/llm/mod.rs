//! LLM integration for the API backend.
//!
//! Supports:
//! - **Anthropic**: Messages API over reqwest
//!
//! The API backend only talks to the `LlmProvider` trait, so tests can drive
//! it with a scripted provider.

pub mod anthropic;
pub mod provider;

pub use anthropic::AnthropicProvider;
pub use provider::*;

use std::sync::Arc;

use crate::config::ApiBackendConfig;
use crate::error::LlmError;

/// Create an LLM provider from API backend configuration.
pub fn create_provider(config: &ApiBackendConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let api_key = config.api_key.clone().ok_or_else(|| LlmError::AuthFailed {
        provider: "anthropic".to_string(),
    })?;
    let provider = AnthropicProvider::new(
        api_key,
        &config.model,
        &config.base_url,
        config.request_timeout,
    )?;
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(provider))
}
