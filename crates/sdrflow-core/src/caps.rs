//! Runtime CPU capability detection
//!
//! Probes the executing CPU for SIMD extensions once per process. The
//! result is cached for the process lifetime and is only ever narrowed
//! afterwards (e.g. to force the portable kernels), never widened, so a
//! `CapabilitySet` can only claim features the CPU really has.

use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// SIMD instruction-set extensions relevant to the conversion kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuFeature {
    Sse2,
    Sse41,
    Avx,
    Avx2,
    Fma,
    Avx512f,
    Neon,
}

impl CpuFeature {
    pub const ALL: [CpuFeature; 7] = [
        CpuFeature::Sse2,
        CpuFeature::Sse41,
        CpuFeature::Avx,
        CpuFeature::Avx2,
        CpuFeature::Fma,
        CpuFeature::Avx512f,
        CpuFeature::Neon,
    ];

    fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CpuFeature::Sse2 => "sse2",
            CpuFeature::Sse41 => "sse4.1",
            CpuFeature::Avx => "avx",
            CpuFeature::Avx2 => "avx2",
            CpuFeature::Fma => "fma",
            CpuFeature::Avx512f => "avx512f",
            CpuFeature::Neon => "neon",
        }
    }
}

/// Set of CPU features available to kernel selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilitySet {
    bits: u32,
}

static DETECTED: OnceLock<CapabilitySet> = OnceLock::new();

/// Detect the capabilities of the executing CPU
///
/// The first call probes the CPU; later calls return the cached set.
pub fn detect() -> CapabilitySet {
    *DETECTED.get_or_init(|| {
        let caps = probe();
        log::debug!("CPU capabilities: {}", caps);
        caps
    })
}

#[allow(unused_mut)]
fn probe() -> CapabilitySet {
    let mut bits = 0u32;

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("sse2") {
            bits |= CpuFeature::Sse2.bit();
        }
        if is_x86_feature_detected!("sse4.1") {
            bits |= CpuFeature::Sse41.bit();
        }
        if is_x86_feature_detected!("avx") {
            bits |= CpuFeature::Avx.bit();
        }
        if is_x86_feature_detected!("avx2") {
            bits |= CpuFeature::Avx2.bit();
        }
        if is_x86_feature_detected!("fma") {
            bits |= CpuFeature::Fma.bit();
        }
        if is_x86_feature_detected!("avx512f") {
            bits |= CpuFeature::Avx512f.bit();
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        if std::arch::is_aarch64_feature_detected!("neon") {
            bits |= CpuFeature::Neon.bit();
        }
    }

    CapabilitySet { bits }
}

impl CapabilitySet {
    /// The empty set: only portable kernels are eligible
    pub const fn portable() -> Self {
        Self { bits: 0 }
    }

    pub fn has(&self, feature: CpuFeature) -> bool {
        self.bits & feature.bit() != 0
    }

    /// Whether every feature in `required` is present
    pub fn has_all(&self, required: &[CpuFeature]) -> bool {
        required.iter().all(|f| self.has(*f))
    }

    /// This set with `feature` removed
    pub fn without(self, feature: CpuFeature) -> Self {
        Self {
            bits: self.bits & !feature.bit(),
        }
    }

    /// This set limited to the features listed in `allowed`
    pub fn restrict_to(self, allowed: &[CpuFeature]) -> Self {
        let mask = allowed.iter().fold(0u32, |acc, f| acc | f.bit());
        Self {
            bits: self.bits & mask,
        }
    }

    /// Features present in both sets
    pub fn intersect(self, other: CapabilitySet) -> Self {
        Self {
            bits: self.bits & other.bits,
        }
    }

    pub fn is_portable(&self) -> bool {
        self.bits == 0
    }

    pub fn features(&self) -> impl Iterator<Item = CpuFeature> + '_ {
        CpuFeature::ALL.into_iter().filter(move |f| self.has(*f))
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_portable() {
            return f.write_str("generic");
        }
        let names: Vec<&str> = self.features().map(|f| f.name()).collect();
        f.write_str(&names.join(","))
    }
}
