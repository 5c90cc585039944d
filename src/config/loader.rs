use std::path::{Path, PathBuf};

use crate::config::types::PlaypenConfig;
use crate::error::{PlaypenError, Result};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "playpen", "playpen") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".playpen").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values.
///
/// An explicitly requested path must exist; the default path may be absent.
pub fn load_config(config_path: Option<&Path>) -> Result<PlaypenConfig> {
    let path = match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(PlaypenError::ConfigNotFound {
                    path: path.display().to_string(),
                });
            }
            path.to_path_buf()
        }
        None => {
            let path = get_config_path();
            if !path.exists() {
                return Ok(PlaypenConfig::default());
            }
            path
        }
    };

    let content = std::fs::read_to_string(&path)?;
    let config: PlaypenConfig =
        toml::from_str(&content).map_err(|e| PlaypenError::TomlParse(e.to_string()))?;

    Ok(config)
}

/// Get the data directory; host sandbox workspaces live below it
pub fn get_data_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "playpen", "playpen") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs_fallback().join(".local").join("share").join("playpen")
    }
}
