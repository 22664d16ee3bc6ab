//! Configuration for agentrun.
//!
//! Everything is resolved from environment variables, after loading a
//! `.env` file from the working directory via dotenvy. Unset variables
//! fall back to defaults; malformed values are configuration errors.

mod helpers;

use std::time::Duration;

#[cfg(test)]
pub(crate) use helpers::ENV_MUTEX;
use helpers::{optional_env, parse_bool_env, parse_list_env, parse_optional_env};

use crate::error::ConfigError;
use crate::hooks::{BuiltinPattern, HookLevel};
use crate::llm::{ResilienceConfig, static_fallback};

/// Main configuration for the runtime.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub agent: AgentConfig,
    pub jobs: JobConfig,
    pub cron: CronConfig,
    pub resilience: ResilienceConfig,
    pub hooks: HooksConfig,
    pub compaction: CompactionConfig,
}

impl Config {
    /// Load configuration from `.env` and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::resolve()
    }

    /// Resolve configuration from the process environment only.
    pub fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            agent: AgentConfig::resolve()?,
            jobs: JobConfig::resolve()?,
            cron: CronConfig::resolve()?,
            resilience: resolve_resilience()?,
            hooks: HooksConfig::resolve()?,
            compaction: CompactionConfig::resolve()?,
        })
    }
}

/// Agent invocation settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum number of nested delegation hops below the entry agent.
    pub max_delegation_depth: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_delegation_depth: 3,
        }
    }
}

impl AgentConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            max_delegation_depth: parse_optional_env("MAX_DELEGATION_DEPTH", 3)?,
        })
    }
}

/// Background job settings.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Results longer than this (in chars) are truncated before storage.
    pub result_max_chars: usize,
    /// How long a finished job's event buffer is kept for reconnecting clients.
    pub buffer_retention: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            result_max_chars: 10_000,
            buffer_retention: Duration::from_secs(300),
        }
    }
}

impl JobConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            result_max_chars: parse_optional_env("JOB_RESULT_MAX_CHARS", 10_000)?,
            buffer_retention: Duration::from_secs(parse_optional_env(
                "JOB_BUFFER_RETENTION_SECS",
                300,
            )?),
        })
    }
}

/// Cron dispatcher settings.
#[derive(Debug, Clone)]
pub struct CronConfig {
    /// Whether the internal interval dispatcher runs.
    pub enabled: bool,
    /// Wall-clock interval between ticks.
    pub tick_interval: Duration,
    /// Execution summaries are truncated to this many chars.
    pub summary_max_chars: usize,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(60),
            summary_max_chars: 500,
        }
    }
}

impl CronConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let secs: u64 = parse_optional_env("CRON_TICK_INTERVAL_SECS", 60)?;
        if secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CRON_TICK_INTERVAL_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            enabled: parse_bool_env("CRON_ENABLED", true)?,
            tick_interval: Duration::from_secs(secs),
            summary_max_chars: parse_optional_env("CRON_SUMMARY_MAX_CHARS", 500)?,
        })
    }
}

/// Lifecycle hook settings.
#[derive(Debug, Clone)]
pub struct HooksConfig {
    /// Which events reach subscribers.
    pub level: HookLevel,
    /// Whether events are scrubbed before delivery.
    pub redact: bool,
    /// Built-in redaction patterns, applied in this order.
    pub patterns: Vec<BuiltinPattern>,
    /// Field names passed through without redaction. Identifier fields are
    /// listed by default so digit runs inside UUIDs are never rewritten.
    pub passthrough_fields: Vec<String>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            level: HookLevel::Summary,
            redact: true,
            patterns: BuiltinPattern::ALL.to_vec(),
            passthrough_fields: ["type", "timestamp", "job_id", "cron_id", "execution_id"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl HooksConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let patterns = match parse_list_env("HOOKS_REDACT_PATTERNS")? {
            Some(names) => names
                .iter()
                .map(|name| {
                    name.parse().map_err(|e| ConfigError::InvalidValue {
                        key: "HOOKS_REDACT_PATTERNS".to_string(),
                        message: format!("{e}"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => defaults.patterns,
        };

        Ok(Self {
            level: parse_optional_env("HOOKS_LEVEL", HookLevel::Summary)?,
            redact: parse_bool_env("HOOKS_REDACT", true)?,
            patterns,
            passthrough_fields: parse_list_env("HOOKS_REDACT_PASSTHROUGH")?
                .unwrap_or(defaults.passthrough_fields),
        })
    }
}

/// Conversation compaction settings.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Compact automatically after recording an exchange.
    pub auto: bool,
    /// Estimated token count above which a conversation is compacted.
    pub token_limit: usize,
    /// Token budget kept verbatim from the newest messages.
    pub preserve_tokens: usize,
    /// Model override for summarization calls.
    pub model: Option<String>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            auto: true,
            token_limit: 80_000,
            preserve_tokens: 8_000,
            model: None,
        }
    }
}

impl CompactionConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            auto: parse_bool_env("COMPACTION_AUTO", true)?,
            token_limit: parse_optional_env("COMPACTION_TOKEN_LIMIT", 80_000)?,
            preserve_tokens: parse_optional_env("COMPACTION_PRESERVE_TOKENS", 8_000)?,
            model: optional_env("COMPACTION_MODEL")?,
        })
    }
}

fn resolve_resilience() -> Result<ResilienceConfig, ConfigError> {
    let jitter: f64 = parse_optional_env("RESILIENCE_JITTER", 0.2)?;
    if !(0.0..=1.0).contains(&jitter) {
        return Err(ConfigError::InvalidValue {
            key: "RESILIENCE_JITTER".to_string(),
            message: format!("must be between 0 and 1, got {jitter}"),
        });
    }

    let mut config = ResilienceConfig {
        max_retries: parse_optional_env("RESILIENCE_MAX_RETRIES", 3)?,
        base_delay: Duration::from_millis(parse_optional_env("RESILIENCE_BASE_DELAY_MS", 1000)?),
        max_delay: Duration::from_millis(parse_optional_env("RESILIENCE_MAX_DELAY_MS", 30_000)?),
        jitter,
        on_fallback: None,
    };
    if let Some(model) = optional_env("RESILIENCE_FALLBACK_MODEL")? {
        config.on_fallback = Some(static_fallback(model));
    }
    Ok(config)
}
