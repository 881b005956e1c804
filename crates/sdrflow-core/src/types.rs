//! Common types for sdrflow
//!
//! Sample formats, stream directions, channel masks and the hardware
//! timestamp used throughout the streaming core.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Full-scale value of the 16-bit integer representation
pub const FULL_SCALE: f32 = 32767.0;

/// Reciprocal of [`FULL_SCALE`], applied when widening integers to floats
pub const CONV_SCALE: f32 = 1.0 / FULL_SCALE;

/// Default number of slots per channel ring buffer
pub const DEFAULT_RING_SLOTS: usize = 256;

/// Default packet size in samples
pub const DEFAULT_PACKET_SAMPLES: usize = 4096;

/// Complex sample wire/host formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Packed complex 12-bit signed integers (3 bytes per I/Q pair)
    Ci12,
    /// Complex 16-bit signed integers, little endian
    Ci16,
    /// Complex 32-bit floats, little endian
    Cf32,
}

impl SampleFormat {
    pub const ALL: [SampleFormat; 3] = [SampleFormat::Ci12, SampleFormat::Ci16, SampleFormat::Cf32];

    /// Bytes occupied by one complex sample
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::Ci12 => 3,
            SampleFormat::Ci16 => 4,
            SampleFormat::Cf32 => 8,
        }
    }

    /// Bytes needed for `samples` complex samples
    pub fn block_bytes(&self, samples: usize) -> usize {
        samples * self.bytes_per_sample()
    }

    /// Format identifier as used in format strings
    pub fn name(&self) -> &'static str {
        match self {
            SampleFormat::Ci12 => "ci12",
            SampleFormat::Ci16 => "ci16",
            SampleFormat::Cf32 => "cf32",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ci12" | "i12" => Ok(SampleFormat::Ci12),
            "ci16" | "i16" | "sc16" => Ok(SampleFormat::Ci16),
            "cf32" | "f32" | "fc32" => Ok(SampleFormat::Cf32),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Rx,
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => f.write_str("RX"),
            Direction::Tx => f.write_str("TX"),
        }
    }
}

/// Bitmask of active logical channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelMask(pub u64);

impl ChannelMask {
    /// Mask with the lowest `n` channels set
    pub fn first(n: usize) -> Self {
        if n >= 64 {
            ChannelMask(u64::MAX)
        } else {
            ChannelMask((1u64 << n) - 1)
        }
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Logical channel numbers in ascending order
    pub fn channels(&self) -> impl Iterator<Item = usize> + '_ {
        (0..64usize).filter(move |bit| self.0 & (1u64 << bit) != 0)
    }

    /// Highest selected channel number
    pub fn highest(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(63 - self.0.leading_zeros() as usize)
        }
    }
}

impl fmt::Display for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Stream creation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamFlags(pub u32);

impl StreamFlags {
    pub const NONE: StreamFlags = StreamFlags(0);
    /// RX stream also reports TX underrun statistics
    pub const NEED_TX_STAT: StreamFlags = StreamFlags(1 << 0);

    pub fn contains(&self, other: StreamFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Hardware sample counter shared by all streams of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn samples(&self) -> u64 {
        self.0
    }

    /// Timestamp `n` samples later
    pub fn offset(&self, n: u64) -> Self {
        Timestamp(self.0 + n)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// One complex 16-bit sample, laid out as on the wire: [i, q]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ComplexI16 {
    pub i: i16,
    pub q: i16,
}

impl ComplexI16 {
    #[inline]
    pub fn new(i: i16, q: i16) -> Self {
        Self { i, q }
    }
}

/// One complex float sample: [i, q]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ComplexF32 {
    pub i: f32,
    pub q: f32,
}

impl ComplexF32 {
    #[inline]
    pub fn new(i: f32, q: f32) -> Self {
        Self { i, q }
    }

    /// Magnitude of the sample
    #[inline]
    pub fn norm(&self) -> f32 {
        (self.i * self.i + self.q * self.q).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!("ci16".parse::<SampleFormat>().unwrap(), SampleFormat::Ci16);
        assert_eq!("CF32".parse::<SampleFormat>().unwrap(), SampleFormat::Cf32);
        assert_eq!("ci12".parse::<SampleFormat>().unwrap(), SampleFormat::Ci12);
        assert!(matches!(
            "cs8".parse::<SampleFormat>(),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_block_bytes() {
        assert_eq!(SampleFormat::Ci16.block_bytes(4096), 16384);
        assert_eq!(SampleFormat::Cf32.block_bytes(4096), 32768);
        assert_eq!(SampleFormat::Ci12.block_bytes(4096), 12288);
    }

    #[test]
    fn test_channel_mask() {
        let mask = ChannelMask(0b1011);
        assert_eq!(mask.count(), 3);
        assert_eq!(mask.channels().collect::<Vec<_>>(), vec![0, 1, 3]);
        assert_eq!(mask.highest(), Some(3));
        assert_eq!(ChannelMask::first(2), ChannelMask(0b11));
        assert_eq!(ChannelMask::first(64).count(), 64);
        assert!(ChannelMask::default().is_empty());
    }

    #[test]
    fn test_timestamp_offset() {
        assert_eq!(Timestamp(10).offset(5), Timestamp(15));
        assert_eq!(Timestamp(4096).samples(), 4096);
        assert!(Timestamp(1) < Timestamp(2));
    }
}
