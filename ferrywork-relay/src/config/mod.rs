use anyhow::{Context, Result};
use ferrywork::FerryworkConfig;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "FERRYWORK_CONFIG";

/// `~/.config/ferrywork/config.toml`, or the platform equivalent.
pub fn default_config_path() -> Result<PathBuf> {
    let mut path = dirs::config_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Cannot find config directory"))?;

    path.push("ferrywork");
    path.push("config.toml");
    Ok(path)
}

/// The `--config` flag wins, then `FERRYWORK_CONFIG`, then the default path.
pub fn resolve_config_path(explicit: Option<&Path>, from_env: Option<String>) -> Result<PathBuf> {
    match (explicit, from_env) {
        (Some(path), _) => Ok(path.to_path_buf()),
        (None, Some(path)) if !path.trim().is_empty() => Ok(PathBuf::from(path)),
        _ => default_config_path(),
    }
}

/// Load the relay configuration. A missing file means defaults; the
/// environment is applied on top and the result validated.
pub fn load_config(path: &Path) -> Result<FerryworkConfig> {
    FerryworkConfig::load(Some(path))
        .with_context(|| format!("Invalid configuration at {}", path.display()))
}

/// Write `config` to `path`, creating parent directories.
pub fn save_config(config: &FerryworkConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    config
        .save_to_file(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Copy of `config` safe to print: the bot token is masked.
pub fn redacted(config: &FerryworkConfig) -> FerryworkConfig {
    let mut shown = config.clone();
    if !shown.telegram.token.is_empty() {
        let visible: String = shown.telegram.token.chars().take(4).collect();
        shown.telegram.token = format!("{}***", visible);
    }
    shown
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolution_order() {
        let explicit = PathBuf::from("/tmp/explicit.toml");
        assert_eq!(
            resolve_config_path(Some(&explicit), Some("/tmp/env.toml".to_string())).unwrap(),
            explicit
        );
        assert_eq!(
            resolve_config_path(None, Some("/tmp/env.toml".to_string())).unwrap(),
            PathBuf::from("/tmp/env.toml")
        );
        let fallback = resolve_config_path(None, Some("  ".to_string())).unwrap();
        assert!(fallback.ends_with("ferrywork/config.toml"));
    }

    #[test]
    fn test_save_creates_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = FerryworkConfig::new().with_concurrency(5);
        save_config(&config, &path).unwrap();

        let loaded = FerryworkConfig::from_file(&path).unwrap();
        assert_eq!(loaded.worker.concurrency, 5);
    }

    #[test]
    fn test_redacted_hides_token() {
        let mut config = FerryworkConfig::new();
        config.telegram.token = "123456:secret".to_string();
        assert_eq!(redacted(&config).telegram.token, "1234***");

        config.telegram.token.clear();
        assert_eq!(redacted(&config).telegram.token, "");
    }
}
