//! Configuration inspection CLI commands.
//!
//! Shows the configuration the runtime would resolve from `.env` and the
//! process environment.

use clap::Subcommand;

use crate::config::Config;

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// List every resolved setting
    List {
        /// Show only settings matching this prefix (e.g., "cron", "hooks")
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Get a specific resolved setting
    Get {
        /// Setting path (e.g., "jobs.result_max_chars")
        path: String,
    },
}

/// Run a config command.
pub fn run_config_command(cmd: ConfigCommand) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    match cmd {
        ConfigCommand::List { filter } => list_settings(&config, filter.as_deref()),
        ConfigCommand::Get { path } => get_setting(&config, &path),
    }
}

/// Flatten `config` into `(path, value)` pairs.
pub fn entries(config: &Config) -> Vec<(&'static str, String)> {
    let join = |items: Vec<String>| items.join(",");
    vec![
        (
            "agent.max_delegation_depth",
            config.agent.max_delegation_depth.to_string(),
        ),
        ("jobs.result_max_chars", config.jobs.result_max_chars.to_string()),
        (
            "jobs.buffer_retention_secs",
            config.jobs.buffer_retention.as_secs().to_string(),
        ),
        ("cron.enabled", config.cron.enabled.to_string()),
        (
            "cron.tick_interval_secs",
            config.cron.tick_interval.as_secs().to_string(),
        ),
        ("cron.summary_max_chars", config.cron.summary_max_chars.to_string()),
        ("resilience.max_retries", config.resilience.max_retries.to_string()),
        (
            "resilience.base_delay_ms",
            config.resilience.base_delay.as_millis().to_string(),
        ),
        (
            "resilience.max_delay_ms",
            config.resilience.max_delay.as_millis().to_string(),
        ),
        ("resilience.jitter", config.resilience.jitter.to_string()),
        (
            "resilience.fallback",
            config.resilience.on_fallback.is_some().to_string(),
        ),
        ("hooks.level", config.hooks.level.to_string()),
        ("hooks.redact", config.hooks.redact.to_string()),
        (
            "hooks.redact_patterns",
            join(config.hooks.patterns.iter().map(|p| p.to_string()).collect()),
        ),
        (
            "hooks.redact_passthrough",
            join(config.hooks.passthrough_fields.clone()),
        ),
        ("compaction.auto", config.compaction.auto.to_string()),
        ("compaction.token_limit", config.compaction.token_limit.to_string()),
        (
            "compaction.preserve_tokens",
            config.compaction.preserve_tokens.to_string(),
        ),
        (
            "compaction.model",
            config.compaction.model.clone().unwrap_or_default(),
        ),
    ]
}

fn list_settings(config: &Config, filter: Option<&str>) -> anyhow::Result<()> {
    let all = entries(config);

    // Find the longest key for alignment
    let max_key_len = all.iter().map(|(k, _)| k.len()).max().unwrap_or(0);

    println!("Settings:");
    println!();

    for (key, value) in all {
        if let Some(f) = filter
            && !key.starts_with(f)
        {
            continue;
        }
        println!("  {:width$}  {}", key, value, width = max_key_len);
    }

    Ok(())
}

fn get_setting(config: &Config, path: &str) -> anyhow::Result<()> {
    match entries(config).into_iter().find(|(key, _)| *key == path) {
        Some((_, value)) => {
            println!("{}", value);
            Ok(())
        }
        None => anyhow::bail!("Setting not found: {}", path),
    }
}
