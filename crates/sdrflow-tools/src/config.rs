//! dm-create configuration
//!
//! Stored as `dm-create.yaml` next to the core config. Every field can be
//! overridden from the command line.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use sdrflow_core::config::Sanitize;
use sdrflow_core::{DeviceParam, SampleFormat, SyncType};

/// File name of the tool configuration inside the config directory
pub const TOOL_CONFIG_FILE: &str = "dm-create.yaml";

/// Prefix all frontend parameters are set below
pub const FRONTEND_PREFIX: &str = "/dm/sdr/0/";

pub const RX_FREQ: &str = "rx/freqency";
pub const TX_FREQ: &str = "tx/freqency";
pub const TDD_FREQ: &str = "tdd/freqency";
pub const RX_BANDWIDTH: &str = "rx/bandwidth";
pub const TX_BANDWIDTH: &str = "tx/bandwidth";
pub const RX_GAIN_VGA: &str = "rx/gain/vga";
pub const RX_GAIN_PGA: &str = "rx/gain/pga";
pub const RX_GAIN_LNA: &str = "rx/gain/lna";
pub const TX_GAIN: &str = "tx/gain";
pub const RX_PATH: &str = "rx/path";
pub const TX_PATH: &str = "tx/path";

/// Tool defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Device string, `None` opens the default device
    pub device: Option<String>,
    /// Sample rate in samples per second
    pub rate: f64,
    /// Host sample format
    pub format: String,
    /// Sync type applied after the streams start
    pub sync: String,
    /// RX capture file; channel `n > 0` writes to `<file>.<n>`
    pub rx_file: PathBuf,
    /// Frontend parameters below [`FRONTEND_PREFIX`]; ignored entries keep
    /// the device default unless enabled from the command line
    pub params: Vec<DeviceParam>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            device: None,
            rate: 50e6,
            format: "ci16".to_string(),
            sync: "all".to_string(),
            rx_file: PathBuf::from("out.data"),
            params: default_params(),
        }
    }
}

fn default_params() -> Vec<DeviceParam> {
    vec![
        DeviceParam::ignored(RX_FREQ, 900e6),
        DeviceParam::ignored(TX_FREQ, 920e6),
        DeviceParam::ignored(TDD_FREQ, 910e6),
        DeviceParam::ignored(RX_BANDWIDTH, 1e6),
        DeviceParam::ignored(TX_BANDWIDTH, 1e6),
        DeviceParam::ignored(RX_GAIN_VGA, 15u64),
        DeviceParam::ignored(RX_GAIN_PGA, 15u64),
        DeviceParam::ignored(RX_GAIN_LNA, 15u64),
        DeviceParam::ignored(TX_GAIN, 0u64),
        DeviceParam::new(RX_PATH, "rx_auto"),
        DeviceParam::new(TX_PATH, "tx_auto"),
    ]
}

impl ToolConfig {
    pub fn param(&self, path: &str) -> Option<&DeviceParam> {
        self.params.iter().find(|p| p.path == path)
    }

    /// Set and enable a frontend parameter, adding it if missing
    pub fn enable(&mut self, path: &str, value: impl Into<sdrflow_core::PropertyValue>) {
        match self.params.iter_mut().find(|p| p.path == path) {
            Some(param) => param.enable(value),
            None => self.params.push(DeviceParam::new(path, value)),
        }
    }

    /// Enable `path` with `value` unless it is already enabled
    pub fn enable_default(&mut self, path: &str, value: impl Into<sdrflow_core::PropertyValue>) {
        if !self.param(path).is_some_and(|p| !p.ignore) {
            self.enable(path, value);
        }
    }
}

impl Sanitize for ToolConfig {
    fn sanitize(&mut self) -> Vec<String> {
        let defaults = Self::default();
        let mut notes = Vec::new();
        if !(self.rate.is_finite() && self.rate > 0.0) {
            notes.push(format!("rate must be positive, got {}, using {}", self.rate, defaults.rate));
            self.rate = defaults.rate;
        }
        if self.format.split('@').any(|f| f.parse::<SampleFormat>().is_err()) {
            notes.push(format!("unsupported format '{}', using {}", self.format, defaults.format));
            self.format = defaults.format;
        }
        if self.sync.parse::<SyncType>().is_err() {
            notes.push(format!("unknown sync type '{}', using {}", self.sync, defaults.sync));
            self.sync = defaults.sync;
        }
        let before = self.params.len();
        self.params.retain(|p| !p.path.is_empty());
        if self.params.len() != before {
            notes.push(format!("dropped {} parameter(s) without a path", before - self.params.len()));
        }
        notes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdrflow_core::PropertyValue;

    #[test]
    fn test_defaults() {
        let config = ToolConfig::default();
        assert_eq!(config.rate, 50e6);
        assert_eq!(config.params.len(), 11);
        assert!(config.param(RX_FREQ).unwrap().ignore);
        assert!(!config.param(RX_PATH).unwrap().ignore);
    }

    #[test]
    fn test_enable() {
        let mut config = ToolConfig::default();
        config.enable(RX_GAIN_LNA, 20u64);
        let lna = config.param(RX_GAIN_LNA).unwrap();
        assert!(!lna.ignore);
        assert_eq!(lna.value, PropertyValue::U64(20));

        config.enable("rx/gain/extra", 3u64);
        assert_eq!(config.params.len(), 12);
    }

    #[test]
    fn test_enable_default_keeps_explicit_value() {
        let mut config = ToolConfig::default();
        config.enable(RX_BANDWIDTH, 2e6);
        config.enable_default(RX_BANDWIDTH, 50e6);
        config.enable_default(TX_BANDWIDTH, 50e6);
        assert_eq!(config.param(RX_BANDWIDTH).unwrap().value, PropertyValue::F64(2e6));
        assert_eq!(config.param(TX_BANDWIDTH).unwrap().value, PropertyValue::F64(50e6));
    }

    #[test]
    fn test_partial_yaml() {
        let config: ToolConfig = serde_yaml::from_str("device: \"sim:channels=2\"\nrate: 1.0e6\n").unwrap();
        assert_eq!(config.device.as_deref(), Some("sim:channels=2"));
        assert_eq!(config.rate, 1e6);
        assert_eq!(config.params, default_params());
    }

    #[test]
    fn test_sanitize_resets_bad_fields() {
        let yaml = "rate: -1.0\nformat: ci16@cq99\nsync: sometimes\nparams:\n  - path: ''\n    value: 1\n    ignore: false\n";
        let mut config: ToolConfig = serde_yaml::from_str(yaml).unwrap();
        let notes = config.sanitize();
        assert_eq!(notes.len(), 4);
        assert_eq!(config, ToolConfig {
            params: Vec::new(),
            ..ToolConfig::default()
        });
    }

    #[test]
    fn test_load_keeps_valid_tool_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TOOL_CONFIG_FILE);
        let mut config = ToolConfig::default();
        config.rate = 10e6;
        config.format = "ci16@ci12".to_string();
        config.sync = "none".to_string();
        sdrflow_core::config::save_config(&config, &path).unwrap();

        let loaded: ToolConfig = sdrflow_core::config::load_config(&path);
        assert_eq!(loaded, config);
    }
}
