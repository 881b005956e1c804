//! Standard locations of sdrflow configuration files

use std::path::PathBuf;

/// Directory holding sdrflow configuration
///
/// Returns: `$XDG_CONFIG_HOME/sdrflow` (or the platform equivalent),
/// falling back to `./sdrflow` when no config directory is known.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sdrflow")
}

/// Path of a config file inside [`default_config_dir`]
pub fn default_config_path(filename: &str) -> PathBuf {
    default_config_dir().join(filename)
}
