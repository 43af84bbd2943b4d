//! JSON file loading with default materialisation.
//!
//! Missing files are not an error: the loader writes the generated defaults
//! to the requested path and returns them, so a fresh node comes up with a
//! stable identity on the second start.

use std::path::Path;

use crate::error::{ConfigError, Result};
use crate::model::WorkerConfig;

/// Load worker configuration from `path`, creating it with defaults when
/// absent.
///
/// # Errors
///
/// Returns an error when the file exists but cannot be read or parsed, when
/// the default file cannot be written, or when validation fails.
pub fn load_worker_config(path: &Path) -> Result<WorkerConfig> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    if !path.exists() {
        let config = WorkerConfig::default();
        save_worker_config(path, &config)?;
        return Ok(config);
    }

    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: WorkerConfig =
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}

/// Persist worker configuration as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error when serialisation or the write fails.
pub fn save_worker_config(path: &Path, config: &WorkerConfig) -> Result<()> {
    let raw = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, raw).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}
