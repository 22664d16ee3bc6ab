//! agentrun - operator CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use agentrun::cli::{Cli, Command, run_config_command, run_cron_command};

fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agentrun=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_cli_tracing();

    match cli.command {
        Command::Cron(cmd) => run_cron_command(cmd),
        Command::Config(cmd) => run_config_command(cmd),
    }
}
