//! Configuration types.
//!
//! Everything has a sensible `Default`; `from_env` overlays `AGENT_DISPATCH_*`
//! variables on top.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker name for identification in logs.
    pub name: String,
    /// Maximum number of jobs processed concurrently by this worker.
    pub worker_concurrency: usize,
    /// How long an attempt may wait for a backend slot.
    pub semaphore_timeout: Duration,
    /// How long a job may sit in WAITING_FOR_APPROVAL.
    pub approval_ttl: Duration,
    /// Health probe memo lifetime.
    pub health_ttl: Duration,
    /// Retry policy for failed attempts.
    pub retry: RetryConfig,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "agent-dispatch".to_string(),
            worker_concurrency: 8,
            semaphore_timeout: Duration::from_secs(30),
            approval_ttl: Duration::from_secs(24 * 3600), // 1 day
            health_ttl: Duration::from_secs(30),
            retry: RetryConfig::default(),
            log_dir: None,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            name: std::env::var("AGENT_DISPATCH_NAME").unwrap_or(defaults.name),
            worker_concurrency: env_parse(
                "AGENT_DISPATCH_CONCURRENCY",
                defaults.worker_concurrency,
            )?,
            semaphore_timeout: env_secs(
                "AGENT_DISPATCH_SEMAPHORE_TIMEOUT_SECS",
                defaults.semaphore_timeout,
            )?,
            approval_ttl: env_secs("AGENT_DISPATCH_APPROVAL_TTL_SECS", defaults.approval_ttl)?,
            health_ttl: env_secs("AGENT_DISPATCH_HEALTH_TTL_SECS", defaults.health_ttl)?,
            retry: RetryConfig::from_env()?,
            log_dir: std::env::var("AGENT_DISPATCH_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

/// Retry policy: capped exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before a job is dead-lettered, unless the job overrides it.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any retry delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_attempts: env_parse("AGENT_DISPATCH_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_delay: env_millis("AGENT_DISPATCH_RETRY_BASE_MS", defaults.base_delay)?,
            max_delay: env_millis("AGENT_DISPATCH_RETRY_MAX_MS", defaults.max_delay)?,
        };
        if config.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_DISPATCH_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(config)
    }
}

/// Environment variables a CLI subprocess always inherits from the host.
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "LANG", "TERM", "TMPDIR", "USER"];

/// Subprocess coding-CLI backend settings.
#[derive(Debug, Clone)]
pub struct CliBackendConfig {
    /// Executable name (looked up in PATH) or absolute path.
    pub binary: String,
    /// Arguments passed before the prompt is written to stdin.
    pub args: Vec<String>,
    /// Host variables passed through in addition to [`DEFAULT_ENV_ALLOWLIST`].
    pub extra_env_allowlist: Vec<String>,
    /// Working directory when the task has no workspace.
    pub working_dir: Option<PathBuf>,
    pub max_concurrent: usize,
    pub context_window: u32,
}

impl Default for CliBackendConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
            ],
            extra_env_allowlist: Vec::new(),
            working_dir: None,
            max_concurrent: 2,
            context_window: 200_000,
        }
    }
}

impl CliBackendConfig {
    /// Build from the environment. `None` when no CLI binary is configured.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(binary) = std::env::var("AGENT_DISPATCH_CLI_BIN") else {
            return Ok(None);
        };
        let defaults = Self::default();
        let args = std::env::var("AGENT_DISPATCH_CLI_ARGS")
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or(defaults.args);
        let extra_env_allowlist = std::env::var("AGENT_DISPATCH_CLI_ENV_ALLOWLIST")
            .map(|s| {
                s.split(',')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(Self {
            binary,
            args,
            extra_env_allowlist,
            working_dir: std::env::var("AGENT_DISPATCH_CLI_WORKDIR")
                .ok()
                .map(PathBuf::from),
            max_concurrent: env_parse("AGENT_DISPATCH_CLI_MAX_CONCURRENT", defaults.max_concurrent)?,
            context_window: defaults.context_window,
        }))
    }

    /// Full allowlist: defaults plus configured extras.
    pub fn env_allowlist(&self) -> Vec<String> {
        DEFAULT_ENV_ALLOWLIST
            .iter()
            .map(|s| s.to_string())
            .chain(self.extra_env_allowlist.iter().cloned())
            .collect()
    }
}

/// HTTP LLM backend settings.
#[derive(Debug, Clone)]
pub struct ApiBackendConfig {
    pub api_key: Option<SecretString>,
    pub model: String,
    pub base_url: String,
    /// Per-turn output token cap when the task sets none.
    pub max_tokens: u32,
    pub request_timeout: Duration,
    pub max_concurrent: usize,
    pub context_window: u32,
}

impl Default for ApiBackendConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 4096,
            request_timeout: Duration::from_secs(120),
            max_concurrent: 4,
            context_window: 200_000,
        }
    }
}

impl ApiBackendConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .map(SecretString::from),
            model: std::env::var("AGENT_DISPATCH_MODEL").unwrap_or(defaults.model),
            base_url: std::env::var("AGENT_DISPATCH_API_BASE_URL").unwrap_or(defaults.base_url),
            max_tokens: env_parse("AGENT_DISPATCH_MAX_TOKENS", defaults.max_tokens)?,
            request_timeout: env_secs(
                "AGENT_DISPATCH_API_TIMEOUT_SECS",
                defaults.request_timeout,
            )?,
            max_concurrent: env_parse("AGENT_DISPATCH_API_MAX_CONCURRENT", defaults.max_concurrent)?,
            context_window: defaults.context_window,
        })
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = WorkerConfig::default();
        assert!(config.worker_concurrency > 0);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.retry.base_delay < config.retry.max_delay);
    }

    #[test]
    fn env_parse_falls_back_to_default() {
        let value: u32 = env_parse("AGENT_DISPATCH_TEST_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn cli_allowlist_includes_defaults_and_extras() {
        let config = CliBackendConfig {
            extra_env_allowlist: vec!["GIT_AUTHOR_NAME".to_string()],
            ..Default::default()
        };
        let allow = config.env_allowlist();
        assert!(allow.contains(&"PATH".to_string()));
        assert!(allow.contains(&"GIT_AUTHOR_NAME".to_string()));
        assert!(!allow.contains(&"ANTHROPIC_API_KEY".to_string()));
    }
}
