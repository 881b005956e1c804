//! Shared helpers for the integration tests

#![allow(dead_code)]

use sdrflow_core::config::CoreConfig;
use sdrflow_core::convert::{self, FormatPair};
use sdrflow_core::{ComplexF32, SampleFormat};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Core config for a simulated device with TX taps of `tap_bytes` per channel
pub fn sim_config(tap_bytes: usize) -> CoreConfig {
    let mut config = CoreConfig::default();
    config.sim.tap_bytes = tap_bytes;
    config
}

/// Drain everything currently in a TX tap
pub fn drain_tap(tap: &mut rtrb::Consumer<u8>) -> Vec<u8> {
    let available = tap.slots();
    let mut out = Vec::with_capacity(available);
    if let Ok(chunk) = tap.read_chunk(available) {
        let (head, tail) = chunk.as_slices();
        out.extend_from_slice(head);
        out.extend_from_slice(tail);
        chunk.commit_all();
    }
    out
}

/// Decode native ci12 bytes into complex floats with the reference kernel
pub fn decode_ci12(bytes: &[u8]) -> Vec<ComplexF32> {
    let count = bytes.len() / SampleFormat::Ci12.bytes_per_sample();
    let kernel = convert::reference(FormatPair::new(SampleFormat::Ci12, SampleFormat::Cf32)).unwrap();
    let mut out = vec![ComplexF32::default(); count];
    kernel
        .convert(bytes, bytemuck::cast_slice_mut(&mut out), count)
        .unwrap();
    out
}
