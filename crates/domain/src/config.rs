//! Environment configuration for the runtime.
//!
//! Everything is read once from process environment variables at startup;
//! components receive the parsed struct and never consult the environment
//! themselves.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default TTL for broker keys owned by a live run (locks, active-run
/// markers).
pub const RUN_KEY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL applied to a run's response list once it reaches a terminal state.
pub const RESPONSE_LIST_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL for cached MCP tool catalogs.
pub const MCP_SCHEMA_TTL: Duration = Duration::from_secs(60 * 60);

/// TTL for the `stop:<run_id>` flag.
pub const STOP_FLAG_TTL: Duration = Duration::from_secs(5 * 60);

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub ssl: bool,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 6379,
            password: None,
            ssl: false,
        }
    }
}

impl RedisSettings {
    /// Connection URL in the form `redis[s]://[:password@]host:port`.
    pub fn url(&self) -> String {
        let scheme = if self.ssl { "rediss" } else { "redis" };
        match &self.password {
            Some(pw) => format!("{scheme}://:{pw}@{}:{}", self.host, self.port),
            None => format!("{scheme}://{}:{}", self.host, self.port),
        }
    }
}

/// LLM provider settings.
#[derive(Debug, Clone, Default)]
pub struct LlmSettings {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    /// Aggregator endpoint used as a fallback on persistent rate limiting.
    pub openrouter_api_base: Option<String>,
    pub openrouter_api_key: Option<String>,
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub redis: RedisSettings,
    /// Per-account concurrent run limit. `None` means unbounded (local
    /// development); production deployments set a small number.
    pub max_parallel_agent_runs: Option<usize>,
    pub llm: LlmSettings,
}

impl RuntimeConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let redis = RedisSettings {
            host: env_or("REDIS_HOST", "localhost"),
            port: env_parse("REDIS_PORT", 6379u16)?,
            password: non_empty(std::env::var("REDIS_PASSWORD").ok()),
            ssl: env_flag("REDIS_SSL"),
        };

        let max_parallel_agent_runs = match std::env::var("MAX_PARALLEL_AGENT_RUNS") {
            Ok(raw) if !raw.trim().is_empty() => Some(
                raw.trim()
                    .parse::<usize>()
                    .map_err(|e| Error::Config(format!("MAX_PARALLEL_AGENT_RUNS: {e}")))?,
            ),
            _ => None,
        };

        let llm = LlmSettings {
            api_key: non_empty(std::env::var("LLM_API_KEY").ok()),
            api_base: non_empty(std::env::var("LLM_API_BASE").ok()),
            openrouter_api_base: non_empty(std::env::var("OPENROUTER_API_BASE").ok()),
            openrouter_api_key: non_empty(std::env::var("OPENROUTER_API_KEY").ok()),
        };

        Ok(Self {
            redis,
            max_parallel_agent_runs,
            llm,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.into())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| Error::Config(format!("{key}: {e}"))),
        _ => Ok(default),
    }
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_forms() {
        let plain = RedisSettings::default();
        assert_eq!(plain.url(), "redis://localhost:6379");

        let secured = RedisSettings {
            host: "cache.internal".into(),
            port: 6380,
            password: Some("s3cret".into()),
            ssl: true,
        };
        assert_eq!(secured.url(), "rediss://:s3cret@cache.internal:6380");
    }

    #[test]
    fn defaults_without_env() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.redis, RedisSettings::default());
        assert!(cfg.max_parallel_agent_runs.is_none());
        assert!(cfg.llm.api_key.is_none());
    }
}
