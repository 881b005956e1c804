//! YAML configuration loading and saving
//!
//! Loading never fails: a missing file, a read error or a parse error all
//! yield the default config, and a parsed config goes through
//! [`Sanitize`] so out-of-range fields are reset before anything opens a
//! device with them. Saving writes a sibling temporary file and renames it
//! over the target, so a crash mid-save leaves the previous file intact.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Repair step applied to every loaded config
pub trait Sanitize {
    /// Reset invalid fields to usable values, returning one note per repair
    fn sanitize(&mut self) -> Vec<String>;
}

/// Load configuration from a YAML file
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default + Sanitize,
{
    log::info!("load_config: Loading from {:?}", path);

    let mut config = match read_config::<T>(path) {
        Ok(Some(config)) => config,
        Ok(None) => {
            log::info!("load_config: {:?} doesn't exist, using defaults", path);
            return T::default();
        }
        Err(e) => {
            log::warn!("load_config: {:#}, using defaults", e);
            return T::default();
        }
    };

    let repairs = config.sanitize();
    for note in &repairs {
        log::warn!("load_config: {:?}: {}", path, note);
    }
    log::info!(
        "load_config: Loaded config from {:?} ({} field(s) reset)",
        path,
        repairs.len()
    );
    config
}

fn read_config<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
    };
    let config = serde_yaml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
    Ok(Some(config))
}

/// Save configuration to a YAML file, creating parent directories
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    log::info!("save_config: Saving to {:?}", path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;
    let staging = staging_path(path);
    std::fs::write(&staging, yaml).with_context(|| format!("Failed to write {:?}", staging))?;
    if let Err(e) = std::fs::rename(&staging, path) {
        let _ = std::fs::remove_file(&staging);
        return Err(e).with_context(|| format!("Failed to replace config file: {:?}", path));
    }

    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct TestConfig {
        slots: usize,
        name: String,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            Self {
                slots: 8,
                name: "default".to_string(),
            }
        }
    }

    impl Sanitize for TestConfig {
        fn sanitize(&mut self) -> Vec<String> {
            let mut notes = Vec::new();
            if self.slots == 0 {
                self.slots = 8;
                notes.push("slots must be non-zero".to_string());
            }
            notes
        }
    }

    #[test]
    fn test_load_nonexistent_returns_default() {
        let config: TestConfig = load_config(Path::new("/nonexistent/sdrflow/config.yaml"));
        assert_eq!(config, TestConfig::default());
    }

    #[test]
    fn test_invalid_yaml_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "slots: [not a number").unwrap();
        let config: TestConfig = load_config(&path);
        assert_eq!(config, TestConfig::default());
    }

    #[test]
    fn test_directory_path_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config: TestConfig = load_config(dir.path());
        assert_eq!(config, TestConfig::default());
    }

    #[test]
    fn test_load_repairs_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zero.yaml");
        std::fs::write(&path, "slots: 0\nname: bench\n").unwrap();
        let config: TestConfig = load_config(&path);
        assert_eq!(config.slots, 8);
        assert_eq!(config.name, "bench");
    }

    #[test]
    fn test_roundtrip_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("core.yaml");

        let config = TestConfig {
            slots: 64,
            name: "bench".to_string(),
        };
        save_config(&config, &path).unwrap();
        let loaded: TestConfig = load_config(&path);
        assert_eq!(loaded, config);
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn test_save_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.yaml");
        std::fs::write(&path, "slots: 1\nname: old\nleftover: true\n").unwrap();

        let config = TestConfig {
            slots: 32,
            name: "new".to_string(),
        };
        save_config(&config, &path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("leftover"));
        assert_eq!(load_config::<TestConfig>(&path), config);
    }
}
