//! User configuration location for plugin-bridge.
//!
//! User config location: $XDG_CONFIG_HOME/plugin-bridge/plugin-bridge.toml
//! Fallback: the platform config directory (`~/.config` on Linux)

use std::path::PathBuf;

use super::CONFIG_FILE_NAME;

const APP_DIR: &str = "plugin-bridge";

/// Returns the path to the user configuration file.
///
/// The path is determined by:
/// 1. If $XDG_CONFIG_HOME is set: $XDG_CONFIG_HOME/plugin-bridge/plugin-bridge.toml
/// 2. Otherwise: <platform config dir>/plugin-bridge/plugin-bridge.toml
///
/// Returns None if neither can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(xdg_config) if !xdg_config.is_empty() => PathBuf::from(xdg_config),
        _ => dirs::config_dir()?,
    };
    Some(base.join(APP_DIR).join(CONFIG_FILE_NAME))
}
