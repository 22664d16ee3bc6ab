//! Cron expression CLI commands.

use chrono::{DateTime, Utc};
use clap::Subcommand;

use crate::cron::CronExpression;

#[derive(Subcommand, Debug, Clone)]
pub enum CronCommand {
    /// Check that an expression parses
    Validate {
        /// Five-field cron expression, quoted (e.g., "*/5 * * * *")
        expr: String,
    },

    /// Print upcoming run times
    Next {
        /// Five-field cron expression, quoted
        expr: String,

        /// Start searching after this instant (RFC 3339, default now)
        #[arg(long)]
        after: Option<DateTime<Utc>>,

        /// How many run times to print
        #[arg(short, long, default_value_t = 5)]
        count: usize,
    },
}

/// Run a cron command.
pub fn run_cron_command(cmd: CronCommand) -> anyhow::Result<()> {
    match cmd {
        CronCommand::Validate { expr } => {
            let parsed: CronExpression = expr.parse()?;
            println!("valid: {}", parsed);
            Ok(())
        }
        CronCommand::Next { expr, after, count } => {
            for at in upcoming(&expr, after.unwrap_or_else(Utc::now), count)? {
                println!("{}", at.to_rfc3339());
            }
            Ok(())
        }
    }
}

/// The next `count` runs of `expr` after `after`.
pub fn upcoming(
    expr: &str,
    after: DateTime<Utc>,
    count: usize,
) -> anyhow::Result<Vec<DateTime<Utc>>> {
    let parsed: CronExpression = expr.parse()?;
    let runs: Vec<_> = parsed.upcoming(after).take(count).collect();
    if runs.is_empty() && count > 0 {
        anyhow::bail!("'{}' has no run within the next year", expr);
    }
    Ok(runs)
}
