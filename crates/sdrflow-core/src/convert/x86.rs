//! x86_64 SIMD kernels
//!
//! The safe wrappers here are only ever registered behind the matching
//! [`CpuFeature`](crate::caps::CpuFeature) requirement, and a
//! `CapabilitySet` can only contain features the CPU reported, so the
//! `unsafe` calls below never execute on a CPU without the extension.
//!
//! The 12-bit kernels are staged: pack/unpack is done with the portable
//! code into a small stack buffer and the arithmetic runs vectorized.

use super::generic;

/// i16 values per staging chunk (256 complex samples)
const STAGE: usize = 512;

fn check(src: &[u8], src_bps: usize, dst: &[u8], dst_bps: usize, count: usize) {
    assert!(src.len() >= count * src_bps, "source shorter than {} samples", count);
    assert!(dst.len() >= count * dst_bps, "destination shorter than {} samples", count);
}

pub(super) fn ci16_to_cf32_avx2(src: &[u8], dst: &mut [u8], count: usize) {
    check(src, 4, dst, 8, count);
    // SAFETY: avx2 present (registry requirement), lengths checked above
    unsafe { avx2::widen(src.as_ptr(), dst.as_mut_ptr(), count * 2) }
}

pub(super) fn ci16_to_cf32_sse41(src: &[u8], dst: &mut [u8], count: usize) {
    check(src, 4, dst, 8, count);
    // SAFETY: sse4.1 present (registry requirement), lengths checked above
    unsafe { sse41::widen(src.as_ptr(), dst.as_mut_ptr(), count * 2) }
}

pub(super) fn cf32_to_ci16_avx2(src: &[u8], dst: &mut [u8], count: usize) {
    check(src, 8, dst, 4, count);
    // SAFETY: avx2 present (registry requirement), lengths checked above
    unsafe { avx2::quantize(src.as_ptr(), dst.as_mut_ptr(), count * 2) }
}

pub(super) fn ci12_to_cf32_avx2(src: &[u8], dst: &mut [u8], count: usize) {
    check(src, 3, dst, 8, count);
    let mut stage = [0i16; STAGE];
    let per_chunk = STAGE / 2;
    let mut done = 0;
    while done < count {
        let n = (count - done).min(per_chunk);
        generic::unpack_i12_into(&src[done * 3..], &mut stage, n);
        let out = &mut dst[done * 8..done * 8 + n * 8];
        // SAFETY: avx2 present; stage holds 2n values, out holds 2n floats
        unsafe { avx2::widen(stage.as_ptr() as *const u8, out.as_mut_ptr(), n * 2) }
        done += n;
    }
}

pub(super) fn cf32_to_ci12_avx2(src: &[u8], dst: &mut [u8], count: usize) {
    check(src, 8, dst, 3, count);
    let mut stage = [0i16; STAGE];
    let per_chunk = STAGE / 2;
    let mut done = 0;
    while done < count {
        let n = (count - done).min(per_chunk);
        let input = &src[done * 8..done * 8 + n * 8];
        // SAFETY: avx2 present; input holds 2n floats, stage has room for 2n values
        unsafe { avx2::quantize(input.as_ptr(), stage.as_mut_ptr() as *mut u8, n * 2) }
        generic::pack_i12_from(&stage, &mut dst[done * 3..], n);
        done += n;
    }
}

mod avx2 {
    use std::arch::x86_64::*;

    use crate::convert::generic;
    use crate::types::{CONV_SCALE, FULL_SCALE};

    const LANES: usize = 8;

    /// Widen `values` little-endian i16 components to f32
    ///
    /// # Safety
    /// AVX2 must be available; `src` must hold `values * 2` bytes and `dst`
    /// `values * 4` bytes.
    #[target_feature(enable = "avx2")]
    pub unsafe fn widen(src: *const u8, dst: *mut u8, values: usize) {
        let scale = _mm256_set1_ps(CONV_SCALE);
        let chunks = values / LANES;

        for i in 0..chunks {
            let v = _mm_loadu_si128(src.add(i * 16) as *const __m128i);
            let w = _mm256_cvtepi16_epi32(v);
            let f = _mm256_mul_ps(_mm256_cvtepi32_ps(w), scale);
            _mm256_storeu_ps(dst.add(i * 32) as *mut f32, f);
        }

        let done = chunks * LANES;
        let rest = values - done;
        if rest > 0 {
            let s = std::slice::from_raw_parts(src.add(done * 2), rest * 2);
            let d = std::slice::from_raw_parts_mut(dst.add(done * 4), rest * 4);
            generic::widen_values(s, d, rest);
        }
    }

    /// Quantize `values` little-endian f32 components to i16
    ///
    /// # Safety
    /// AVX2 must be available; `src` must hold `values * 4` bytes and `dst`
    /// `values * 2` bytes.
    #[target_feature(enable = "avx2")]
    pub unsafe fn quantize(src: *const u8, dst: *mut u8, values: usize) {
        let scale = _mm256_set1_ps(FULL_SCALE);
        let lo = _mm256_set1_ps(-32768.0);
        let hi = _mm256_set1_ps(32767.0);
        let chunks = values / (2 * LANES);

        for i in 0..chunks {
            let a = _mm256_loadu_ps(src.add(i * 64) as *const f32);
            let b = _mm256_loadu_ps(src.add(i * 64 + 32) as *const f32);
            // max(x, lo) returns lo for NaN lanes, same as f32::max
            let a = _mm256_min_ps(_mm256_max_ps(_mm256_mul_ps(a, scale), lo), hi);
            let b = _mm256_min_ps(_mm256_max_ps(_mm256_mul_ps(b, scale), lo), hi);
            let ia = _mm256_cvtps_epi32(a);
            let ib = _mm256_cvtps_epi32(b);
            // packs works per 128-bit lane: [a0 b0 a1 b1] -> reorder to [a0 a1 b0 b1]
            let packed = _mm256_packs_epi32(ia, ib);
            let ordered = _mm256_permute4x64_epi64::<0b11_01_10_00>(packed);
            _mm256_storeu_si256(dst.add(i * 32) as *mut __m256i, ordered);
        }

        let done = chunks * 2 * LANES;
        let rest = values - done;
        if rest > 0 {
            let s = std::slice::from_raw_parts(src.add(done * 4), rest * 4);
            let d = std::slice::from_raw_parts_mut(dst.add(done * 2), rest * 2);
            generic::quantize_values(s, d, rest);
        }
    }
}

mod sse41 {
    use std::arch::x86_64::*;

    use crate::convert::generic;
    use crate::types::CONV_SCALE;

    /// # Safety
    /// SSE4.1 must be available; buffer sizes as for the AVX2 variant.
    #[target_feature(enable = "sse4.1")]
    pub unsafe fn widen(src: *const u8, dst: *mut u8, values: usize) {
        let scale = _mm_set1_ps(CONV_SCALE);
        let chunks = values / 4;

        for i in 0..chunks {
            let v = _mm_loadl_epi64(src.add(i * 8) as *const __m128i);
            let f = _mm_mul_ps(_mm_cvtepi32_ps(_mm_cvtepi16_epi32(v)), scale);
            _mm_storeu_ps(dst.add(i * 16) as *mut f32, f);
        }

        let done = chunks * 4;
        let rest = values - done;
        if rest > 0 {
            let s = std::slice::from_raw_parts(src.add(done * 2), rest * 2);
            let d = std::slice::from_raw_parts_mut(dst.add(done * 4), rest * 4);
            generic::widen_values(s, d, rest);
        }
    }
}
