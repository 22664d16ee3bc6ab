//! Operator CLI.

mod config;
mod cron;

pub use config::{ConfigCommand, entries, run_config_command};
pub use cron::{CronCommand, run_cron_command, upcoming};

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "agentrun", version, about = "Agent task execution runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Inspect and test cron expressions
    #[command(subcommand)]
    Cron(CronCommand),

    /// Show resolved configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}
