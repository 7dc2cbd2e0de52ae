use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ferrywork_relay::commands::*;
use ferrywork_relay::config::{CONFIG_ENV, load_config, resolve_config_path};

#[derive(Parser)]
#[command(name = "ferrywork-relay")]
#[command(about = "Forward RSS and email items to Telegram through durable queues")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Path to the configuration file")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Suppress output except errors")]
    quiet: bool,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, help = "Log output format")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the relay until interrupted")]
    Run(RunCommand),

    #[command(about = "Queue inspection")]
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },

    #[command(about = "Tick schedules")]
    Cron {
        #[command(subcommand)]
        command: CronCommand,
    },

    #[command(about = "Configuration management")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    let config_path = resolve_config_path(cli.config.as_deref(), std::env::var(CONFIG_ENV).ok())?;

    match execute_command(&cli.command, &config_path).await {
        Ok(()) => {
            if cli.verbose {
                info!("✅ Command completed successfully");
            }
        }
        Err(e) => {
            error!("❌ Command failed: {:#}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn setup_logging(cli: &Cli) -> Result<()> {
    let log_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    let env_filter = EnvFilter::from_default_env()
        .add_directive(format!("ferrywork_relay={}", log_level).parse()?)
        .add_directive(format!("ferrywork_web={}", log_level).parse()?)
        .add_directive(format!("ferrywork={}", log_level).parse()?);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true);

    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(())
}

async fn execute_command(command: &Commands, config_path: &std::path::Path) -> Result<()> {
    match command {
        Commands::Config { command } => command.execute(config_path).await,
        Commands::Run(command) => {
            let config = load_config(config_path)?;
            command.execute(config).await
        }
        Commands::Queue { command } => {
            let config = load_config(config_path)?;
            command.execute(&config).await
        }
        Commands::Cron { command } => {
            let config = load_config(config_path)?;
            command.execute(&config).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_run_flags() {
        let cli = Cli::parse_from(["ferrywork-relay", "-v", "--log-format", "json", "run", "--memory"]);
        assert!(cli.verbose);
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Run(run) => {
                assert!(run.memory);
                assert!(!run.no_dashboard);
            }
            _ => panic!("expected the run command"),
        }
    }

    #[test]
    fn test_parses_job_listing() {
        let cli = Cli::parse_from(["ferrywork-relay", "queue", "jobs", "slickdeals", "--status", "delayed"]);
        match cli.command {
            Commands::Queue {
                command: QueueCommand::Jobs { queue, status, limit, .. },
            } => {
                assert_eq!(queue, "slickdeals");
                assert_eq!(status, ferrywork::JobStatus::Delayed);
                assert_eq!(limit, 20);
            }
            _ => panic!("expected queue jobs"),
        }
    }
}
