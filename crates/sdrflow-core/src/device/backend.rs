//! Backend contract
//!
//! A device backend supplies the property tree, the timestamp domain and a
//! [`StreamOps`] table per opened stream. The core only ever talks to
//! radios through these two traits.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::property::PropertyValue;
use super::DeviceDescriptor;
use crate::error::{Error, Result};
use crate::ring::CancelToken;
use crate::types::{ChannelMask, Direction, SampleFormat, StreamFlags, Timestamp};

/// Device-unique stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything a backend needs to open a stream
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub id: StreamId,
    pub direction: Direction,
    pub endpoint: String,
    pub channels: ChannelMask,
    pub packet_samples: usize,
    pub flags: StreamFlags,
}

/// Metadata of one received block
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RecvInfo {
    /// Device time of the first sample, if the backend timestamps blocks
    pub timestamp: Option<Timestamp>,
    pub samples: usize,
    /// Samples were lost before this block
    pub overrun: bool,
    /// TX underrun counter, reported when the stream was created with
    /// [`StreamFlags::NEED_TX_STAT`]
    pub tx_underruns: Option<u64>,
}

/// Counters reported by a stream backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub blocks: u64,
    pub samples: u64,
    pub overruns: u64,
    pub underruns: u64,
    /// TX blocks rejected for a timestamp in the past
    pub late: u64,
}

/// Synchronization policy applied to a device's timestamp domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    /// Align every given stream to a common start
    All,
    /// Align to the next one-pulse-per-second boundary
    #[serde(rename = "1pps")]
    OnePps,
    /// Align RX streams only
    Rx,
    /// Align TX streams only
    Tx,
    /// Align on whichever stream triggers first
    Any,
    /// Leave the domain free-running
    None,
    /// Disengage any previous alignment
    Off,
}

impl SyncType {
    pub const ALL: [SyncType; 7] = [
        SyncType::All,
        SyncType::OnePps,
        SyncType::Rx,
        SyncType::Tx,
        SyncType::Any,
        SyncType::None,
        SyncType::Off,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SyncType::All => "all",
            SyncType::OnePps => "1pps",
            SyncType::Rx => "rx",
            SyncType::Tx => "tx",
            SyncType::Any => "any",
            SyncType::None => "none",
            SyncType::Off => "off",
        }
    }

    /// Whether this policy realigns stream timestamps
    pub fn engages_alignment(&self) -> bool {
        !matches!(self, SyncType::None | SyncType::Off)
    }

    /// Whether a stream of `direction` takes part in the alignment
    pub fn applies_to(&self, direction: Direction) -> bool {
        match self {
            SyncType::Rx => direction == Direction::Rx,
            SyncType::Tx => direction == Direction::Tx,
            other => other.engages_alignment(),
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SyncType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        SyncType::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown sync type '{}'", s)))
    }
}

/// Per-stream operation table
///
/// Buffers are in the device's native format; conversion to the host
/// format happens in the stream handle.
pub trait StreamOps: Send {
    fn start(&mut self, at: Option<Timestamp>) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Fill one packet per channel
    fn recv(
        &mut self,
        buffers: &mut [&mut [u8]],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<RecvInfo>;

    /// Emit `samples` samples per channel at `timestamp` (`None`: as soon as possible)
    fn send(
        &mut self,
        buffers: &[&[u8]],
        samples: usize,
        timestamp: Option<Timestamp>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<()>;

    fn option_get(&self, name: &str) -> Result<i64>;

    fn option_set(&mut self, name: &str, value: i64) -> Result<()>;

    fn stat(&self) -> StreamStats;
}

/// A radio implementation
pub trait DeviceBackend: Send {
    /// Short backend name, e.g. `sim`
    fn name(&self) -> &str;

    fn native_format(&self) -> SampleFormat;

    /// Hardware channel limit per stream
    fn max_channels(&self) -> usize;

    fn describe(&self) -> DeviceDescriptor;

    fn open_stream(&mut self, request: &StreamRequest) -> Result<Box<dyn StreamOps>>;

    /// Called when a stream unregisters from the device
    fn close_stream(&mut self, _id: StreamId) {}

    fn get(&self, path: &str) -> Result<PropertyValue>;

    fn set(&mut self, path: &str, value: PropertyValue) -> Result<()>;

    /// Apply a synchronization policy to the given streams
    fn timer_op(&mut self, streams: &[(StreamId, Direction)], sync: SyncType) -> Result<()>;
}
