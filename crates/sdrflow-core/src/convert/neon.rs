//! aarch64 NEON kernels
//!
//! Loads and stores go through byte vectors so host buffers need no
//! particular alignment.

use std::arch::aarch64::*;

use super::generic;
use crate::types::{CONV_SCALE, FULL_SCALE};

pub(super) fn ci16_to_cf32_neon(src: &[u8], dst: &mut [u8], count: usize) {
    assert!(src.len() >= count * 4 && dst.len() >= count * 8, "short buffer");
    // SAFETY: neon present (registry requirement), lengths checked above
    unsafe { widen(src.as_ptr(), dst.as_mut_ptr(), count * 2) }
}

pub(super) fn cf32_to_ci16_neon(src: &[u8], dst: &mut [u8], count: usize) {
    assert!(src.len() >= count * 8 && dst.len() >= count * 4, "short buffer");
    // SAFETY: neon present (registry requirement), lengths checked above
    unsafe { quantize(src.as_ptr(), dst.as_mut_ptr(), count * 2) }
}

#[target_feature(enable = "neon")]
unsafe fn widen(src: *const u8, dst: *mut u8, values: usize) {
    let chunks = values / 8;

    for i in 0..chunks {
        let v = vreinterpretq_s16_u8(vld1q_u8(src.add(i * 16)));
        let lo = vcvtq_f32_s32(vmovl_s16(vget_low_s16(v)));
        let hi = vcvtq_f32_s32(vmovl_high_s16(v));
        vst1q_u8(dst.add(i * 32), vreinterpretq_u8_f32(vmulq_n_f32(lo, CONV_SCALE)));
        vst1q_u8(dst.add(i * 32 + 16), vreinterpretq_u8_f32(vmulq_n_f32(hi, CONV_SCALE)));
    }

    let done = chunks * 8;
    let rest = values - done;
    if rest > 0 {
        let s = std::slice::from_raw_parts(src.add(done * 2), rest * 2);
        let d = std::slice::from_raw_parts_mut(dst.add(done * 4), rest * 4);
        generic::widen_values(s, d, rest);
    }
}

#[target_feature(enable = "neon")]
unsafe fn quantize(src: *const u8, dst: *mut u8, values: usize) {
    let scale = vdupq_n_f32(FULL_SCALE);
    let lo = vdupq_n_f32(-32768.0);
    let hi = vdupq_n_f32(32767.0);
    let chunks = values / 8;

    for i in 0..chunks {
        let a = vreinterpretq_f32_u8(vld1q_u8(src.add(i * 32)));
        let b = vreinterpretq_f32_u8(vld1q_u8(src.add(i * 32 + 16)));
        // maxnm picks the non-NaN operand, matching f32::max
        let a = vminnmq_f32(vmaxnmq_f32(vmulq_f32(a, scale), lo), hi);
        let b = vminnmq_f32(vmaxnmq_f32(vmulq_f32(b, scale), lo), hi);
        let packed = vcombine_s16(vqmovn_s32(vcvtnq_s32_f32(a)), vqmovn_s32(vcvtnq_s32_f32(b)));
        vst1q_u8(dst.add(i * 16), vreinterpretq_u8_s16(packed));
    }

    let done = chunks * 8;
    let rest = values - done;
    if rest > 0 {
        let s = std::slice::from_raw_parts(src.add(done * 4), rest * 4);
        let d = std::slice::from_raw_parts_mut(dst.add(done * 2), rest * 2);
        generic::quantize_values(s, d, rest);
    }
}
