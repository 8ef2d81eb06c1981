use anyhow::{anyhow, Context, Result};
use peerlink_core::{default_config_dir, IpcConfig};
use std::fs;
use std::path::PathBuf;
use std::process::Command;

// Path of the shared config file
pub fn get_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

// Render the effective configuration, overrides included
pub fn show_config(config: &IpcConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to serialize configuration")
}

// Edit the config file, creating it with defaults first if needed
pub async fn edit_config() -> Result<()> {
    let path = get_config_path();

    if !path.exists() {
        IpcConfig::default()
            .save_to_file(&path)
            .with_context(|| format!("Failed to create default configuration file: {}", path.display()))?;
        tracing::info!("Created default configuration file: {}", path.display());
    }

    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "nano".to_string());

    let status = Command::new(&editor)
        .arg(&path)
        .status()
        .with_context(|| format!("Failed to open editor {} for file {}", editor, path.display()))?;

    if !status.success() {
        return Err(anyhow!("Editor exited with non-zero status"));
    }

    // Catch typos before an endpoint trips over them.
    IpcConfig::load_from_file(&path).context("Edited configuration does not parse")?;
    Ok(())
}

// Reset the config file to defaults, keeping a backup of the old one
pub async fn reset_config() -> Result<()> {
    let path = get_config_path();

    if path.exists() {
        let backup_path = path.with_extension("toml.bak");
        fs::copy(&path, &backup_path)
            .with_context(|| format!("Failed to create backup of configuration file: {}", path.display()))?;
        tracing::info!("Created backup at: {}", backup_path.display());
    }

    IpcConfig::default()
        .save_to_file(&path)
        .with_context(|| format!("Failed to write default configuration to {}", path.display()))?;
    Ok(())
}
