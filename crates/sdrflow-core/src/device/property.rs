//! Property tree values
//!
//! Device properties are addressed by slash-separated paths such as
//! `/dm/rate` or `/dm/sdr/0/rx/gain/lna` and carry an integer, float or
//! string value.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Value stored at a property path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    U64(u64),
    F64(f64),
    Str(String),
}

impl PropertyValue {
    /// Integer view; floats are truncated, negative or non-finite floats fail
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::U64(v) => Some(*v),
            PropertyValue::F64(v) if v.is_finite() && *v >= 0.0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::U64(v) => Some(*v as f64),
            PropertyValue::F64(v) => Some(*v),
            PropertyValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Kind name for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::U64(_) => "u64",
            PropertyValue::F64(_) => "f64",
            PropertyValue::Str(_) => "string",
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::U64(v) => write!(f, "{}", v),
            PropertyValue::F64(v) => write!(f, "{}", v),
            PropertyValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        PropertyValue::U64(v)
    }
}

impl From<u32> for PropertyValue {
    fn from(v: u32) -> Self {
        PropertyValue::U64(v as u64)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::F64(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Str(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Str(v)
    }
}

/// One entry of a batch property update
///
/// `path` is relative to the prefix passed to `Device::set_many`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceParam {
    pub path: String,
    pub value: PropertyValue,
    /// Skip this entry entirely
    #[serde(default)]
    pub ignore: bool,
    /// Abort the batch if setting this entry fails
    #[serde(default = "default_stop_on_fail")]
    pub stop_on_fail: bool,
}

fn default_stop_on_fail() -> bool {
    true
}

impl DeviceParam {
    /// Active entry that aborts the batch on failure
    pub fn new(path: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
            ignore: false,
            stop_on_fail: true,
        }
    }

    /// Entry carrying a default value that is skipped unless enabled
    pub fn ignored(path: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self {
            ignore: true,
            ..Self::new(path, value)
        }
    }

    /// Replace the value and enable the entry
    pub fn enable(&mut self, value: impl Into<PropertyValue>) {
        self.value = value.into();
        self.ignore = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_views() {
        assert_eq!(PropertyValue::from(5u64).as_u64(), Some(5));
        assert_eq!(PropertyValue::from(900e6).as_u64(), Some(900_000_000));
        assert_eq!(PropertyValue::from(-1.0).as_u64(), None);
        assert_eq!(PropertyValue::from(7u32).as_f64(), Some(7.0));
        assert_eq!(PropertyValue::from("rx_auto").as_str(), Some("rx_auto"));
        assert_eq!(PropertyValue::from("rx_auto").as_u64(), None);
        assert_eq!(PropertyValue::from(1.5).to_string(), "1.5");
    }

    #[test]
    fn test_param_enable() {
        let mut param = DeviceParam::ignored("rx/gain/lna", 15u64);
        assert!(param.ignore);
        param.enable(20u64);
        assert!(!param.ignore);
        assert_eq!(param.value, PropertyValue::U64(20));
    }

    #[test]
    fn test_untagged_yaml() {
        let values: Vec<PropertyValue> = serde_yaml::from_str("[15, 1.5e6, tx_auto]").unwrap();
        assert_eq!(
            values,
            vec![
                PropertyValue::U64(15),
                PropertyValue::F64(1.5e6),
                PropertyValue::Str("tx_auto".into())
            ]
        );
    }
}
