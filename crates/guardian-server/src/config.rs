//! Configuration loading for the Guardian server.
//!
//! Reads [`GuardianConfig`] from YAML, layers `GUARDIAN_*` environment
//! overrides on top, then validates the result.

use anyhow::Context;
use guardian_core::{Environment, GuardianConfig};
use std::path::{Path, PathBuf};

/// Environment variable naming the config file when no CLI argument is given.
pub const CONFIG_ENV_VAR: &str = "GUARDIAN_CONFIG";

/// Load a [`GuardianConfig`] from a YAML file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn load_config(path: &Path) -> anyhow::Result<GuardianConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: GuardianConfig =
        serde_yaml::from_str(&contents).context("Failed to parse config YAML")?;
    Ok(config)
}

/// Config file path from the first CLI argument, else `GUARDIAN_CONFIG`.
pub fn config_path_from_args() -> Option<PathBuf> {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok())
        .map(PathBuf::from)
}

/// Apply `GUARDIAN_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut GuardianConfig, lookup: F) -> anyhow::Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(addr) = lookup("GUARDIAN_LISTEN_ADDR") {
        config.listen_addr = addr;
    }
    if let Some(path) = lookup("GUARDIAN_DATABASE_PATH") {
        config.storage.profile = "sqlite".to_string();
        config.storage.database_path = path;
    }
    if let Some(url) = lookup("GUARDIAN_WEBHOOK_URL") {
        config.alerts.webhook_url = Some(url).filter(|u| !u.is_empty());
    }
    if let Some(token) = lookup("GUARDIAN_ADMIN_BOOTSTRAP_TOKEN") {
        config.accounts.bootstrap_token = Some(token).filter(|t| !t.is_empty());
    }
    if let Some(level) = lookup("GUARDIAN_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(env) = lookup("GUARDIAN_ENVIRONMENT") {
        config.environment = match env.to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "development" | "dev" => Environment::Development,
            other => anyhow::bail!("GUARDIAN_ENVIRONMENT: unknown environment '{other}'"),
        };
    }
    Ok(())
}

/// Resolve the full startup configuration: file (if any), environment
/// overrides, then validation.
pub fn load_guardian_config() -> anyhow::Result<GuardianConfig> {
    let mut config = match config_path_from_args() {
        Some(path) => load_config(&path)?,
        None => GuardianConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.validate().context("Invalid Guardian configuration")?;
    Ok(config)
}
