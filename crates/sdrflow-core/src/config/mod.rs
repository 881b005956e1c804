//! Runtime configuration for the streaming core
//!
//! - Generic YAML config loading/saving shared with the tools, with a
//!   [`Sanitize`] pass that resets unusable fields on load
//! - Standard config paths under the user's config directory
//! - [`CoreConfig`]: ring geometry, channel cap, kernel policy and the
//!   simulated backend defaults
//!
//! # Usage
//!
//! ```ignore
//! use sdrflow_core::config::{default_config_path, load_config, CoreConfig};
//!
//! let config: CoreConfig = load_config(&default_config_path(CORE_CONFIG_FILE));
//! let device = Device::open_with_config(Some("sim"), config)?;
//! ```

mod io;
mod paths;

pub use io::{load_config, save_config, Sanitize};
pub use paths::{default_config_dir, default_config_path};

use serde::{Deserialize, Serialize};

use crate::caps::{CapabilitySet, CpuFeature};
use crate::device::sim::SimConfig;
use crate::types::DEFAULT_RING_SLOTS;

/// File name of the core configuration inside the config directory
pub const CORE_CONFIG_FILE: &str = "core.yaml";

/// Default cap on channels per stream
pub const DEFAULT_MAX_CHANNELS: usize = 32;

/// Channels a [`crate::ChannelMask`] can address
const MASK_CHANNELS: usize = 64;

/// Which conversion kernels may be selected
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelPolicy {
    /// Only use the portable reference kernels
    pub portable_only: bool,
    /// Features never used even when the CPU reports them
    pub disabled: Vec<CpuFeature>,
}

impl KernelPolicy {
    /// Narrow `caps` according to this policy
    pub fn apply(&self, caps: CapabilitySet) -> CapabilitySet {
        if self.portable_only {
            return CapabilitySet::portable();
        }
        self.disabled.iter().fold(caps, |acc, f| acc.without(*f))
    }
}

impl Sanitize for KernelPolicy {
    fn sanitize(&mut self) -> Vec<String> {
        let before = self.disabled.len();
        let mut seen = Vec::with_capacity(before);
        self.disabled.retain(|f| {
            if seen.contains(f) {
                false
            } else {
                seen.push(*f);
                true
            }
        });
        if self.disabled.len() == before {
            return Vec::new();
        }
        vec![format!(
            "kernel_policy.disabled lists {} duplicate feature(s), dropped",
            before - self.disabled.len()
        )]
    }
}

/// Core configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Slots per channel ring buffer
    pub ring_slots: usize,
    /// Maximum channels a single stream may carry
    pub max_channels: usize,
    pub kernel_policy: KernelPolicy,
    /// Defaults for `sim` devices; device string arguments override them
    pub sim: SimConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ring_slots: DEFAULT_RING_SLOTS,
            max_channels: DEFAULT_MAX_CHANNELS,
            kernel_policy: KernelPolicy::default(),
            sim: SimConfig::default(),
        }
    }
}

impl Sanitize for CoreConfig {
    fn sanitize(&mut self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.ring_slots == 0 {
            notes.push(format!("ring_slots must be non-zero, using {}", DEFAULT_RING_SLOTS));
            self.ring_slots = DEFAULT_RING_SLOTS;
        }
        if self.max_channels == 0 || self.max_channels > MASK_CHANNELS {
            notes.push(format!(
                "max_channels must be 1..={}, got {}, using {}",
                MASK_CHANNELS, self.max_channels, DEFAULT_MAX_CHANNELS
            ));
            self.max_channels = DEFAULT_MAX_CHANNELS;
        }
        notes.extend(self.kernel_policy.sanitize());
        if let Err(e) = self.sim.validate() {
            notes.push(format!("{}, using sim defaults", e));
            self.sim = SimConfig::default();
        }
        notes
    }
}

impl CoreConfig {
    /// Capability set used for kernel selection
    pub fn capabilities(&self) -> CapabilitySet {
        self.kernel_policy.apply(crate::caps::detect())
    }
}
