//! Configuration loading.
//!
//! Settings come from the first file found among:
//! 1. an explicit path (`--config`)
//! 2. `./plugin-bridge.toml`
//! 3. the user config (see [`user_config_path`])
//!
//! and fall back to built-in defaults when none exists. Command-line flags
//! are applied on top by the binary.

pub mod settings;
pub mod user;

use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::error::ConfigError;

pub use settings::{
    BatchSettings, BridgeSettings, DEFAULT_ADDRESS, HealthSettings, QueueSettings,
    ReconnectSettings, RetrySettings, TimeoutSettings,
};
pub use user::user_config_path;

pub const CONFIG_FILE_NAME: &str = "plugin-bridge.toml";

/// Read, parse, and validate one settings file.
pub fn load_settings(path: &Path) -> Result<BridgeSettings, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let settings: BridgeSettings =
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    settings.validate()?;
    Ok(settings)
}

/// Pick the settings file to use and load it.
///
/// Returns the settings together with the file they came from, `None` for
/// built-in defaults. A missing explicit path is an error; missing implicit
/// locations are skipped.
pub fn resolve_settings(
    explicit: Option<&Path>,
    working_dir: &Path,
) -> Result<(BridgeSettings, Option<PathBuf>), ConfigError> {
    if let Some(path) = explicit {
        let settings = load_settings(path)?;
        info!(target: "plugin_bridge::config", "Loaded settings from {}", path.display());
        return Ok((settings, Some(path.to_path_buf())));
    }

    let candidates = std::iter::once(working_dir.join(CONFIG_FILE_NAME)).chain(user_config_path());
    for candidate in candidates {
        if candidate.is_file() {
            let settings = load_settings(&candidate)?;
            info!(
                target: "plugin_bridge::config",
                "Loaded settings from {}",
                candidate.display()
            );
            return Ok((settings, Some(candidate)));
        }
    }

    info!(target: "plugin_bridge::config", "No settings file found, using defaults");
    Ok((BridgeSettings::default(), None))
}
