//! Device strings and discovery
//!
//! A device string names a backend and optional `key=value` parameters:
//!
//! ```text
//! sim                          default simulated radio
//! sim:channels=2,loopback=1    simulated radio with overrides
//! channels=2                   backend omitted, defaults to sim
//! ```

use std::fmt;
use std::str::FromStr;

use super::backend::DeviceBackend;
use super::sim::{SimBackend, SimConfig};
use crate::error::{Error, Result};
use crate::types::SampleFormat;

/// Parsed device string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceArgs {
    pub backend: BackendKind,
    params: Vec<(String, String)>,
}

impl DeviceArgs {
    /// Parse an optional device string; `None` or empty selects the default
    pub fn parse(spec: Option<&str>) -> Result<Self> {
        let spec = spec.map(str::trim).unwrap_or("");
        if spec.is_empty() {
            return Ok(Self {
                backend: BackendKind::default(),
                params: Vec::new(),
            });
        }

        let (backend, rest) = match spec.split_once(':') {
            Some((name, rest)) => (name.parse()?, rest),
            None if spec.contains('=') => (BackendKind::default(), spec),
            None => (spec.parse()?, ""),
        };

        let mut params = Vec::new();
        for item in rest.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = item.split_once('=').ok_or_else(|| {
                Error::InvalidArgument(format!("device parameter '{}' is not key=value", item))
            })?;
            params.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        Ok(Self { backend, params })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parse parameter `key` as `T`, `Ok(None)` when absent
    pub fn parse_value<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                Error::InvalidArgument(format!("invalid value '{}' for device parameter '{}'", raw, key))
            }),
        }
    }

    /// Parse a boolean flag (`1/0`, `true/false`, `yes/no`, `on/off`)
    pub fn parse_flag(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(None),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(Error::InvalidArgument(format!(
                    "invalid flag '{}' for device parameter '{}'",
                    v, key
                ))),
            },
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(k, _)| k.as_str())
    }
}

impl fmt::Display for DeviceArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.backend.name())?;
        for (i, (k, v)) in self.params.iter().enumerate() {
            write!(f, "{}{}={}", if i == 0 { ':' } else { ',' }, k, v)?;
        }
        Ok(())
    }
}

/// The closed set of in-crate backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Sim,
}

impl BackendKind {
    pub const ALL: [BackendKind; 1] = [BackendKind::Sim];

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Sim => "sim",
        }
    }

    /// Devices of this kind matching `args`
    pub fn discover(&self, args: &DeviceArgs, defaults: &SimConfig) -> Result<Vec<DeviceDescriptor>> {
        match self {
            BackendKind::Sim => {
                let mut config = defaults.clone();
                config.apply_args(args)?;
                Ok(vec![SimBackend::descriptor(&config)])
            }
        }
    }

    /// Instantiate the backend described by `args`
    pub fn open(&self, args: &DeviceArgs, defaults: &SimConfig) -> Result<Box<dyn DeviceBackend>> {
        match self {
            BackendKind::Sim => {
                let mut config = defaults.clone();
                config.apply_args(args)?;
                let (backend, _probe) = SimBackend::new(config);
                Ok(Box::new(backend))
            }
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        BackendKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown device backend '{}'", s)))
    }
}

/// One discovered device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub backend: &'static str,
    /// Device string that opens exactly this device
    pub address: String,
    pub serial: String,
    pub channels: usize,
    pub native_format: SampleFormat,
    pub description: String,
}

/// Enumerate devices across all backends matching `filter`
pub fn discover(filter: Option<&str>, defaults: &SimConfig) -> Result<Vec<DeviceDescriptor>> {
    let args = DeviceArgs::parse(filter)?;
    let mut found = Vec::new();
    for kind in BackendKind::ALL {
        if kind == args.backend {
            found.extend(kind.discover(&args, defaults)?);
        }
    }
    log::debug!("discover({:?}): {} device(s)", filter, found.len());
    Ok(found)
}

/// Human-readable device list, one line per device
pub fn render_device_list(devices: &[DeviceDescriptor]) -> String {
    let mut out = String::new();
    for (i, d) in devices.iter().enumerate() {
        out.push_str(&format!(
            "{:>2}: {:<24} serial={} channels={} native={}  {}\n",
            i, d.address, d.serial, d.channels, d.native_format, d.description
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default() {
        let args = DeviceArgs::parse(None).unwrap();
        assert_eq!(args.backend, BackendKind::Sim);
        assert_eq!(args.keys().count(), 0);
        assert_eq!(DeviceArgs::parse(Some("  ")).unwrap(), args);
    }

    #[test]
    fn test_parse_params() {
        let args = DeviceArgs::parse(Some("sim:channels=2, loopback=1,rate=1e6")).unwrap();
        assert_eq!(args.parse_value::<usize>("channels").unwrap(), Some(2));
        assert_eq!(args.parse_flag("loopback").unwrap(), Some(true));
        assert_eq!(args.parse_value::<f64>("rate").unwrap(), Some(1e6));
        assert_eq!(args.get("missing"), None);
        assert_eq!(args.to_string(), "sim:channels=2,loopback=1,rate=1e6");

        let bare = DeviceArgs::parse(Some("channels=3")).unwrap();
        assert_eq!(bare.backend, BackendKind::Sim);
        assert_eq!(bare.get("channels"), Some("3"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(DeviceArgs::parse(Some("usb:bus=1")), Err(Error::InvalidArgument(_))));
        assert!(matches!(DeviceArgs::parse(Some("sim:channels")), Err(Error::InvalidArgument(_))));
        let args = DeviceArgs::parse(Some("sim:channels=many,loopback=maybe")).unwrap();
        assert!(args.parse_value::<usize>("channels").is_err());
        assert!(args.parse_flag("loopback").is_err());
    }

    #[test]
    fn test_discover_and_render() {
        let defaults = SimConfig::default();
        let devices = discover(None, &defaults).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].backend, "sim");
        assert_eq!(devices[0].channels, defaults.channels);

        let narrowed = discover(Some("sim:channels=2"), &defaults).unwrap();
        assert_eq!(narrowed[0].channels, 2);

        let listing = render_device_list(&devices);
        assert_eq!(listing.lines().count(), 1);
        assert!(listing.contains("native=ci12"));
    }
}
