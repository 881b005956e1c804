//! Complex tone generation
//!
//! Phase-accumulator sine source used by the simulated radio for RX data
//! and by the tools to produce TX test signals. Frequencies are normalized
//! (cycles per sample); the phase is kept in `f64` so long runs do not
//! drift.

use std::f64::consts::TAU;

use crate::convert::{pack_i12, quantize};
use crate::error::{Error, Result};
use crate::types::{ComplexF32, ComplexI16, SampleFormat};

/// Complex exponential `amplitude * e^(j 2 pi phase)` with a fixed step
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    phase: f64,
    step: f64,
    amplitude: f32,
}

impl ToneGenerator {
    /// Tone at `step` cycles per sample, `amplitude` relative to full scale
    pub fn new(step: f64, amplitude: f32) -> Self {
        Self {
            phase: 0.0,
            step,
            amplitude,
        }
    }

    /// Start at `phase` cycles instead of zero
    pub fn with_phase(mut self, phase: f64) -> Self {
        self.phase = phase.rem_euclid(1.0);
        self
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }

    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }

    /// Next sample, advancing the phase by one step
    #[inline]
    pub fn next_sample(&mut self) -> ComplexF32 {
        let (sin, cos) = (TAU * self.phase).sin_cos();
        self.phase = (self.phase + self.step).rem_euclid(1.0);
        ComplexF32::new(cos as f32 * self.amplitude, sin as f32 * self.amplitude)
    }

    pub fn fill_cf32(&mut self, out: &mut [ComplexF32]) {
        for s in out.iter_mut() {
            *s = self.next_sample();
        }
    }

    pub fn fill_ci16(&mut self, out: &mut [ComplexI16]) {
        for s in out.iter_mut() {
            let v = self.next_sample();
            *s = ComplexI16::new(quantize(v.i), quantize(v.q));
        }
    }

    /// Fill `samples` samples of `format` into a little-endian byte buffer
    ///
    /// Works on unaligned buffers such as ring buffer slots.
    pub fn fill_bytes(&mut self, format: SampleFormat, out: &mut [u8], samples: usize) -> Result<()> {
        let need = format.block_bytes(samples);
        if out.len() < need {
            return Err(Error::ContractViolation(format!(
                "tone buffer of {} bytes cannot hold {} {} samples",
                out.len(),
                samples,
                format
            )));
        }

        let out = &mut out[..need];
        match format {
            SampleFormat::Cf32 => {
                for chunk in out.chunks_exact_mut(8) {
                    let v = self.next_sample();
                    chunk[..4].copy_from_slice(&v.i.to_le_bytes());
                    chunk[4..].copy_from_slice(&v.q.to_le_bytes());
                }
            }
            SampleFormat::Ci16 => {
                for chunk in out.chunks_exact_mut(4) {
                    let v = self.next_sample();
                    chunk[..2].copy_from_slice(&quantize(v.i).to_le_bytes());
                    chunk[2..].copy_from_slice(&quantize(v.q).to_le_bytes());
                }
            }
            SampleFormat::Ci12 => {
                for chunk in out.chunks_exact_mut(3) {
                    let v = self.next_sample();
                    pack_i12(quantize(v.i), quantize(v.q), chunk);
                }
            }
        }
        Ok(())
    }
}
