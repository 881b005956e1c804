//! Runtime-dispatched sample format conversion
//!
//! Each ordered pair of [`SampleFormat`]s has a portable reference kernel
//! and zero or more SIMD kernels. The registry is built once per process;
//! [`select`] filters it by a [`CapabilitySet`] and returns the highest
//! priority eligible variant.
//!
//! # Numeric contract
//!
//! - int -> float: `f = i16 * (1 / 32767)`, 12-bit values are left-aligned
//!   to 16 bits first (`i12 << 4`)
//! - float -> int: scale by 32767, saturate, round half to even
//! - 16 -> 12 bit: arithmetic shift right by 4
//!
//! All variants of a pair produce identical output for finite input; the
//! equivalence tests below enforce this for every variant the running CPU
//! can execute.
//!
//! ```text
//! Priority  Variant   Requirement   Pairs
//! ────────  ────────  ───────────   ───────────────────────────────
//! 30        avx2      AVX2          ci16<->cf32, ci12<->cf32 (staged)
//! 20        sse41     SSE4.1        ci16->cf32
//! 20        neon      NEON          ci16<->cf32
//! 0         generic   -             all pairs
//! ```

mod generic;
#[cfg(target_arch = "aarch64")]
mod neon;
#[cfg(target_arch = "x86_64")]
mod x86;

use std::fmt;
use std::sync::OnceLock;

use crate::caps::{CapabilitySet, CpuFeature};
use crate::error::{Error, Result};
use crate::types::SampleFormat;

pub(crate) use generic::{pack_i12, quantize};

/// Raw kernel: convert `count` complex samples from `src` into `dst`
pub type KernelFn = fn(src: &[u8], dst: &mut [u8], count: usize);

/// Source and destination formats of a conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatPair {
    pub from: SampleFormat,
    pub to: SampleFormat,
}

impl FormatPair {
    pub fn new(from: SampleFormat, to: SampleFormat) -> Self {
        Self { from, to }
    }

    /// Whether this pair is a plain copy
    pub fn is_identity(&self) -> bool {
        self.from == self.to
    }
}

impl fmt::Display for FormatPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

struct KernelEntry {
    pair: FormatPair,
    variant: &'static str,
    requires: &'static [CpuFeature],
    priority: u8,
    func: KernelFn,
}

/// A selected conversion kernel
#[derive(Clone, Copy)]
pub struct Kernel {
    pair: FormatPair,
    variant: &'static str,
    func: KernelFn,
}

impl Kernel {
    pub fn pair(&self) -> FormatPair {
        self.pair
    }

    /// Variant name for diagnostics, e.g. `avx2`
    pub fn variant(&self) -> &'static str {
        self.variant
    }

    /// Full diagnostic name, e.g. `ci16->cf32/avx2`
    pub fn name(&self) -> String {
        format!("{}/{}", self.pair, self.variant)
    }

    /// Convert `count` samples, validating buffer lengths first
    pub fn convert(&self, src: &[u8], dst: &mut [u8], count: usize) -> Result<()> {
        let need_src = self.pair.from.block_bytes(count);
        let need_dst = self.pair.to.block_bytes(count);
        if src.len() < need_src || dst.len() < need_dst {
            return Err(Error::ContractViolation(format!(
                "{}: {} samples need {}/{} bytes, got {}/{}",
                self.name(),
                count,
                need_src,
                need_dst,
                src.len(),
                dst.len()
            )));
        }
        (self.func)(src, dst, count);
        Ok(())
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("pair", &self.pair)
            .field("variant", &self.variant)
            .finish()
    }
}

static REGISTRY: OnceLock<Vec<KernelEntry>> = OnceLock::new();

fn registry() -> &'static [KernelEntry] {
    REGISTRY.get_or_init(build_registry)
}

fn build_registry() -> Vec<KernelEntry> {
    use SampleFormat::*;

    fn entry(
        from: SampleFormat,
        to: SampleFormat,
        variant: &'static str,
        requires: &'static [CpuFeature],
        priority: u8,
        func: KernelFn,
    ) -> KernelEntry {
        KernelEntry {
            pair: FormatPair::new(from, to),
            variant,
            requires,
            priority,
            func,
        }
    }

    #[allow(unused_mut)]
    let mut table = vec![
        entry(Ci12, Ci12, "copy", &[], 0, generic::copy_ci12),
        entry(Ci16, Ci16, "copy", &[], 0, generic::copy_ci16),
        entry(Cf32, Cf32, "copy", &[], 0, generic::copy_cf32),
        entry(Ci16, Cf32, "generic", &[], 0, generic::ci16_to_cf32),
        entry(Cf32, Ci16, "generic", &[], 0, generic::cf32_to_ci16),
        entry(Ci12, Ci16, "generic", &[], 0, generic::ci12_to_ci16),
        entry(Ci16, Ci12, "generic", &[], 0, generic::ci16_to_ci12),
        entry(Ci12, Cf32, "generic", &[], 0, generic::ci12_to_cf32),
        entry(Cf32, Ci12, "generic", &[], 0, generic::cf32_to_ci12),
    ];

    #[cfg(target_arch = "x86_64")]
    {
        table.push(entry(Ci16, Cf32, "avx2", &[CpuFeature::Avx2], 30, x86::ci16_to_cf32_avx2));
        table.push(entry(Ci16, Cf32, "sse41", &[CpuFeature::Sse41], 20, x86::ci16_to_cf32_sse41));
        table.push(entry(Cf32, Ci16, "avx2", &[CpuFeature::Avx2], 30, x86::cf32_to_ci16_avx2));
        table.push(entry(Ci12, Cf32, "avx2", &[CpuFeature::Avx2], 30, x86::ci12_to_cf32_avx2));
        table.push(entry(Cf32, Ci12, "avx2", &[CpuFeature::Avx2], 30, x86::cf32_to_ci12_avx2));
    }

    #[cfg(target_arch = "aarch64")]
    {
        table.push(entry(Ci16, Cf32, "neon", &[CpuFeature::Neon], 20, neon::ci16_to_cf32_neon));
        table.push(entry(Cf32, Ci16, "neon", &[CpuFeature::Neon], 20, neon::cf32_to_ci16_neon));
    }

    // Highest priority first; stable sort keeps registration order on ties
    table.sort_by(|a, b| b.priority.cmp(&a.priority));
    table
}

/// All variants of `pair` eligible under `caps`, fastest first
pub fn variants(pair: FormatPair, caps: CapabilitySet) -> Vec<Kernel> {
    registry()
        .iter()
        .filter(|e| e.pair == pair && caps.has_all(e.requires))
        .map(|e| Kernel {
            pair: e.pair,
            variant: e.variant,
            func: e.func,
        })
        .collect()
}

/// Select the fastest kernel for `pair` that is safe on `caps`
pub fn select(pair: FormatPair, caps: CapabilitySet) -> Result<Kernel> {
    variants(pair, caps)
        .into_iter()
        .next()
        .ok_or_else(|| Error::UnsupportedFormat(pair.to_string()))
}

/// The portable reference kernel for `pair`
pub fn reference(pair: FormatPair) -> Result<Kernel> {
    select(pair, CapabilitySet::portable())
}
