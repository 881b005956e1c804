//! Portable reference kernels
//!
//! Every accelerated variant must match these bit for bit on finite input.
//! All kernels read and write little-endian byte buffers so host buffers of
//! any alignment can be passed straight through.

use crate::types::{CONV_SCALE, FULL_SCALE};

/// Quantize one float to the 16-bit integer grid
///
/// Scale by full scale, saturate, round half to even. NaN saturates to the
/// negative rail, matching the SIMD max/min semantics.
#[inline]
pub(crate) fn quantize(v: f32) -> i16 {
    let scaled = (v * FULL_SCALE).max(-32768.0).min(32767.0);
    scaled.round_ties_even() as i16
}

#[inline]
pub(crate) fn widen(v: i16) -> f32 {
    v as f32 * CONV_SCALE
}

#[inline]
fn read_i16(b: &[u8]) -> i16 {
    i16::from_le_bytes([b[0], b[1]])
}

#[inline]
fn read_f32(b: &[u8]) -> f32 {
    f32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Unpack one 3-byte group into two 16-bit aligned values
#[inline]
pub(crate) fn unpack_i12(b: &[u8]) -> (i16, i16) {
    let a = (b[0] as u16) | (((b[1] & 0x0f) as u16) << 8);
    let c = ((b[1] >> 4) as u16) | ((b[2] as u16) << 4);
    ((a << 4) as i16, (c << 4) as i16)
}

/// Pack two 16-bit aligned values into one 3-byte group (drops the low nibble)
#[inline]
pub(crate) fn pack_i12(a: i16, c: i16, out: &mut [u8]) {
    let a = ((a >> 4) as u16) & 0x0fff;
    let c = ((c >> 4) as u16) & 0x0fff;
    out[0] = (a & 0xff) as u8;
    out[1] = ((a >> 8) as u8) | (((c & 0x0f) as u8) << 4);
    out[2] = (c >> 4) as u8;
}

pub(crate) fn copy(src: &[u8], dst: &mut [u8], bytes: usize) {
    dst[..bytes].copy_from_slice(&src[..bytes]);
}

pub(crate) fn copy_ci12(src: &[u8], dst: &mut [u8], count: usize) {
    copy(src, dst, count * 3);
}

pub(crate) fn copy_ci16(src: &[u8], dst: &mut [u8], count: usize) {
    copy(src, dst, count * 4);
}

pub(crate) fn copy_cf32(src: &[u8], dst: &mut [u8], count: usize) {
    copy(src, dst, count * 8);
}

/// ci16 -> cf32 over `values` scalar components (2 per complex sample)
pub(crate) fn widen_values(src: &[u8], dst: &mut [u8], values: usize) {
    for (s, d) in src[..values * 2]
        .chunks_exact(2)
        .zip(dst[..values * 4].chunks_exact_mut(4))
    {
        d.copy_from_slice(&widen(read_i16(s)).to_le_bytes());
    }
}

/// cf32 -> ci16 over `values` scalar components
pub(crate) fn quantize_values(src: &[u8], dst: &mut [u8], values: usize) {
    for (s, d) in src[..values * 4]
        .chunks_exact(4)
        .zip(dst[..values * 2].chunks_exact_mut(2))
    {
        d.copy_from_slice(&quantize(read_f32(s)).to_le_bytes());
    }
}

pub(crate) fn ci16_to_cf32(src: &[u8], dst: &mut [u8], count: usize) {
    widen_values(src, dst, count * 2);
}

pub(crate) fn cf32_to_ci16(src: &[u8], dst: &mut [u8], count: usize) {
    quantize_values(src, dst, count * 2);
}

pub(crate) fn ci12_to_ci16(src: &[u8], dst: &mut [u8], count: usize) {
    for (s, d) in src[..count * 3]
        .chunks_exact(3)
        .zip(dst[..count * 4].chunks_exact_mut(4))
    {
        let (i, q) = unpack_i12(s);
        d[..2].copy_from_slice(&i.to_le_bytes());
        d[2..].copy_from_slice(&q.to_le_bytes());
    }
}

pub(crate) fn ci16_to_ci12(src: &[u8], dst: &mut [u8], count: usize) {
    for (s, d) in src[..count * 4]
        .chunks_exact(4)
        .zip(dst[..count * 3].chunks_exact_mut(3))
    {
        pack_i12(read_i16(&s[..2]), read_i16(&s[2..]), d);
    }
}

pub(crate) fn ci12_to_cf32(src: &[u8], dst: &mut [u8], count: usize) {
    for (s, d) in src[..count * 3]
        .chunks_exact(3)
        .zip(dst[..count * 8].chunks_exact_mut(8))
    {
        let (i, q) = unpack_i12(s);
        d[..4].copy_from_slice(&widen(i).to_le_bytes());
        d[4..].copy_from_slice(&widen(q).to_le_bytes());
    }
}

pub(crate) fn cf32_to_ci12(src: &[u8], dst: &mut [u8], count: usize) {
    for (s, d) in src[..count * 8]
        .chunks_exact(8)
        .zip(dst[..count * 3].chunks_exact_mut(3))
    {
        pack_i12(quantize(read_f32(&s[..4])), quantize(read_f32(&s[4..])), d);
    }
}

/// Unpack `count` ci12 samples into an i16 scratch (used by staged SIMD kernels)
#[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
pub(crate) fn unpack_i12_into(src: &[u8], out: &mut [i16], count: usize) {
    for (s, d) in src[..count * 3].chunks_exact(3).zip(out[..count * 2].chunks_exact_mut(2)) {
        let (i, q) = unpack_i12(s);
        d[0] = i;
        d[1] = q;
    }
}

/// Pack `count` samples from an i16 scratch into ci12 bytes
#[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
pub(crate) fn pack_i12_from(values: &[i16], dst: &mut [u8], count: usize) {
    for (s, d) in values[..count * 2].chunks_exact(2).zip(dst[..count * 3].chunks_exact_mut(3)) {
        pack_i12(s[0], s[1], d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_edges() {
        assert_eq!(quantize(0.0), 0);
        assert_eq!(quantize(1.0), 32767);
        assert_eq!(quantize(-1.0), -32767);
        assert_eq!(quantize(2.0), 32767);
        assert_eq!(quantize(-2.0), -32768);
        assert_eq!(quantize(f32::NAN), -32768);
        assert_eq!(quantize(f32::INFINITY), 32767);
        assert_eq!(quantize(f32::NEG_INFINITY), -32768);
    }

    #[test]
    fn test_i12_packing() {
        let mut packed = [0u8; 3];
        pack_i12(0x7ff0, -16, &mut packed);
        assert_eq!(unpack_i12(&packed), (0x7ff0, -16));

        pack_i12(i16::MIN, 0x0010, &mut packed);
        assert_eq!(unpack_i12(&packed), (i16::MIN, 0x0010));

        // Low nibble is not representable in 12 bits
        pack_i12(0x0123, -0x0123, &mut packed);
        assert_eq!(unpack_i12(&packed), (0x0120, -0x0130));
    }

    #[test]
    fn test_i12_scratch_staging() {
        let values: [i16; 6] = [0x7ff0, -16, i16::MIN, 0x0010, 0, -32];
        let mut wire = [0u8; 9];
        pack_i12_from(&values, &mut wire, 3);
        assert_eq!(&wire[..3], &[0xff, 0xf7, 0xff]);

        let mut back = [0i16; 6];
        unpack_i12_into(&wire, &mut back, 3);
        assert_eq!(back, values);

        // Only `count` samples are touched
        let mut partial = [7i16; 6];
        unpack_i12_into(&wire, &mut partial, 1);
        assert_eq!(partial, [0x7ff0, -16, 7, 7, 7, 7]);
    }

    #[test]
    fn test_known_wire_layout() {
        // I = 0x123, Q = 0xabc as raw 12-bit fields
        let wire = [0x23u8, 0xc1, 0xab];
        let (i, q) = unpack_i12(&wire);
        assert_eq!(i, 0x1230);
        assert_eq!(q, (0xabc0u16) as i16);
    }

    #[test]
    fn test_ci16_cf32_roundtrip_exact() {
        let values: Vec<i16> = vec![0, 1, -1, 32767, -32767, 1234, -4321, 16];
        let src: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let count = values.len() / 2;
        let mut floats = vec![0u8; count * 8];
        let mut back = vec![0u8; count * 4];
        ci16_to_cf32(&src, &mut floats, count);
        cf32_to_ci16(&floats, &mut back, count);
        assert_eq!(src, back);
    }
}
