use anyhow::Result;
use clap::Subcommand;
use ferrywork::FerryworkConfig;
use std::path::Path;

use crate::config::{load_config, redacted, save_config};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    #[command(about = "Write a default configuration file")]
    Init {
        #[arg(long, help = "Overwrite an existing file")]
        force: bool,
    },
    #[command(about = "Show the effective configuration")]
    Show,
    #[command(about = "Validate the configuration and list sources")]
    Check,
    #[command(about = "Show configuration file path")]
    Path,
}

impl ConfigCommand {
    pub async fn execute(&self, path: &Path) -> Result<()> {
        match self {
            ConfigCommand::Init { force } => init_config(path, *force),
            ConfigCommand::Show => {
                let config = load_config(path)?;
                print!("{}", toml::to_string_pretty(&redacted(&config))?);
                Ok(())
            }
            ConfigCommand::Check => check_config(&load_config(path)?),
            ConfigCommand::Path => {
                println!("{}", path.display());
                Ok(())
            }
        }
    }
}

pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite it", path.display());
    }
    save_config(&FerryworkConfig::default(), path)?;
    println!("✅ Wrote default configuration to {}", path.display());
    Ok(())
}

fn check_config(config: &FerryworkConfig) -> Result<()> {
    for line in check_report(config)? {
        println!("{}", line);
    }
    Ok(())
}

fn check_report(config: &FerryworkConfig) -> Result<Vec<String>> {
    config.validate()?;
    let mut lines = vec!["✅ Configuration is valid".to_string()];
    for rss in &config.sources.rss {
        lines.push(format!(
            "  rss   {:<16} {} ({} feeds)",
            rss.name,
            rss.cron,
            rss.feeds.len()
        ));
    }
    for email in &config.sources.email {
        lines.push(format!(
            "  email {:<16} {} (skipped: no mailbox transport)",
            email.name, email.cron
        ));
    }
    if !config.sources.email.is_empty() {
        lines.push(
            "⚠️  `run` has no mailbox transport and skips email sources; \
             attach one with Relay::with_mailbox when embedding the library"
                .to_string(),
        );
    }
    if !config.telegram.is_configured() {
        lines.push(
            "⚠️  telegram.token or telegram.chat_id is empty; `run` will refuse to start".to_string(),
        );
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrywork::config::EmailSourceConfig;
    use tempfile::tempdir;

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        init_config(&path, false).unwrap();
        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();

        let written = FerryworkConfig::from_file(&path).unwrap();
        assert_eq!(written, FerryworkConfig::default());
    }

    #[test]
    fn test_check_accepts_defaults() {
        check_config(&FerryworkConfig::default()).unwrap();
    }

    #[test]
    fn test_check_flags_email_sources_as_skipped() {
        let mut config = FerryworkConfig::default();
        assert!(!check_report(&config).unwrap().iter().any(|l| l.contains("mailbox")));

        config.sources.email.push(EmailSourceConfig::new("outlook"));
        let report = check_report(&config).unwrap();
        let line = report.iter().find(|l| l.contains("outlook")).unwrap();
        assert!(line.contains("skipped"));
        assert!(report.iter().any(|l| l.contains("Relay::with_mailbox")));
    }
}
