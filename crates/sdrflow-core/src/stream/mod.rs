//! Stream handles
//!
//! A [`StreamHandle`] binds one RX or TX endpoint of a device to a set of
//! channels. It owns a [`RingBuffer`] per channel for the application
//! threads, the backend's [`StreamOps`] table for the hardware side and the
//! conversion kernel between the host format and the device's wire format.
//!
//! Creation opens the backend stream, selects the kernel and allocates the
//! rings in one step, so a handle is `Configured` from the moment it exists.
//!
//! ```text
//!   create ──▶ Configured ──start──▶ Running ──stop──▶ Stopped
//!                  │                   ▲                  │
//!                  │                   └──────start───────┘
//!                  └───────── destroy (any state) ──────────▶ Destroyed
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::convert::{self, FormatPair, Kernel};
use crate::device::{Device, DeviceShared, RecvInfo, StreamId, StreamOps, StreamRequest, StreamStats};
use crate::error::{Error, Result};
use crate::ring::{CancelToken, RingBuffer, SlotConsumer, SlotProducer};
use crate::types::{ChannelMask, Direction, SampleFormat, StreamFlags, Timestamp};

/// Default RX endpoint
pub const RX_ENDPOINT: &str = "/ll/srx/0";
/// Default TX endpoint
pub const TX_ENDPOINT: &str = "/ll/stx/0";

/// Lifecycle state of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Configured,
    Running,
    Stopped,
    Destroyed,
}

impl StreamState {
    pub fn name(&self) -> &'static str {
        match self {
            StreamState::Configured => "configured",
            StreamState::Running => "running",
            StreamState::Stopped => "stopped",
            StreamState::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Commands accepted by [`StreamHandle::op`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCommand {
    Start,
    Stop,
}

/// Packet geometry of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub packet_samples: usize,
    /// Bytes per packet per channel in the host format
    pub packet_bytes: usize,
    pub channels: usize,
}

/// Direction of an endpoint path
pub fn endpoint_direction(endpoint: &str) -> Result<Direction> {
    if endpoint.starts_with("/ll/srx/") {
        Ok(Direction::Rx)
    } else if endpoint.starts_with("/ll/stx/") {
        Ok(Direction::Tx)
    } else {
        Err(Error::InvalidArgument(format!(
            "endpoint '{}' is neither /ll/srx/<n> nor /ll/stx/<n>",
            endpoint
        )))
    }
}

/// Parse `host[@native]`, e.g. `ci16` or `cf32@ci12`
fn parse_format(format: &str, native: SampleFormat) -> Result<SampleFormat> {
    let (host, wire) = match format.split_once('@') {
        Some((host, wire)) => (host, Some(wire)),
        None => (format, None),
    };
    let host: SampleFormat = host.parse()?;
    if let Some(wire) = wire {
        let wire: SampleFormat = wire.parse()?;
        if wire != native {
            return Err(Error::UnsupportedFormat(format!(
                "device wire format is {}, not {}",
                native, wire
            )));
        }
    }
    Ok(host)
}

/// A logical RX or TX endpoint
pub struct StreamHandle {
    id: StreamId,
    direction: Direction,
    endpoint: String,
    state: StreamState,
    device: Weak<DeviceShared>,
    ops: Option<Box<dyn StreamOps>>,
    mask: ChannelMask,
    flags: StreamFlags,
    host_format: SampleFormat,
    native_format: SampleFormat,
    packet_samples: usize,
    kernel: Kernel,
    rings: Vec<RingBuffer>,
    /// Native-format packet per channel, used when a conversion is needed
    scratch: Vec<Vec<u8>>,
}

impl StreamHandle {
    /// Create a stream on `device`
    ///
    /// `format` is the host format, optionally followed by `@` and the wire
    /// format the caller expects the device to use.
    pub fn create(
        device: &Device,
        endpoint: &str,
        format: &str,
        channels: ChannelMask,
        packet_samples: usize,
        flags: StreamFlags,
    ) -> Result<Self> {
        let shared = device.shared();
        let direction = endpoint_direction(endpoint)?;
        let native_format = shared.native_format();
        let host_format = parse_format(format, native_format)?;

        if channels.is_empty() {
            return Err(Error::InvalidArgument("channel mask selects no channels".into()));
        }
        if packet_samples == 0 {
            return Err(Error::InvalidArgument("packet size must be non-zero".into()));
        }
        let max = shared.max_channels();
        let count = channels.count();
        if count > max {
            return Err(Error::TooManyChannels { requested: count, max });
        }

        let pair = match direction {
            Direction::Rx => FormatPair::new(native_format, host_format),
            Direction::Tx => FormatPair::new(host_format, native_format),
        };
        let kernel = convert::select(pair, shared.config.capabilities())?;

        let packet_bytes = host_format.block_bytes(packet_samples);
        let rings = (0..count)
            .map(|_| RingBuffer::new(shared.config.ring_slots, packet_bytes))
            .collect::<Result<Vec<_>>>()?;
        let scratch = if pair.is_identity() {
            Vec::new()
        } else {
            let bytes = native_format.block_bytes(packet_samples);
            (0..count)
                .map(|_| {
                    let mut buf = Vec::new();
                    buf.try_reserve_exact(bytes)
                        .map_err(|_| Error::OutOfMemory { bytes })?;
                    buf.resize(bytes, 0);
                    Ok(buf)
                })
                .collect::<Result<Vec<_>>>()?
        };

        let id = shared.register(direction)?;
        let request = StreamRequest {
            id,
            direction,
            endpoint: endpoint.to_string(),
            channels,
            packet_samples,
            flags,
        };
        let opened = shared.backend().and_then(|mut backend| backend.open_stream(&request));
        let ops = match opened {
            Ok(ops) => ops,
            Err(e) => {
                shared.unregister(id);
                return Err(e);
            }
        };

        let stream = Self {
            id,
            direction,
            endpoint: endpoint.to_string(),
            state: StreamState::Configured,
            device: Arc::downgrade(shared),
            ops: Some(ops),
            mask: channels,
            flags,
            host_format,
            native_format,
            packet_samples,
            kernel,
            rings,
            scratch,
        };
        log::info!(
            "Created {} stream {} on {}: channels {} ({}), {} samples/packet, {} bytes/packet, kernel {}",
            direction,
            id,
            endpoint,
            channels,
            count,
            packet_samples,
            packet_bytes,
            stream.kernel.name()
        );
        Ok(stream)
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn channel_mask(&self) -> ChannelMask {
        self.mask
    }

    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    pub fn host_format(&self) -> SampleFormat {
        self.host_format
    }

    pub fn native_format(&self) -> SampleFormat {
        self.native_format
    }

    /// Diagnostic name of the selected conversion kernel
    pub fn kernel_name(&self) -> String {
        self.kernel.name()
    }

    pub(crate) fn belongs_to(&self, device: &Arc<DeviceShared>) -> bool {
        std::ptr::eq(self.device.as_ptr(), Arc::as_ptr(device))
    }

    pub(crate) fn ensure_alive(&self, op: &'static str) -> Result<()> {
        if self.state == StreamState::Destroyed {
            Err(self.invalid_state(op))
        } else {
            Ok(())
        }
    }

    fn invalid_state(&self, op: &'static str) -> Error {
        Error::InvalidState {
            op,
            direction: self.direction,
            state: self.state.name(),
        }
    }

    fn ops(&mut self, op: &'static str) -> Result<&mut Box<dyn StreamOps>> {
        let err = self.invalid_state(op);
        self.ops.as_mut().ok_or(err)
    }

    /// Packet geometry
    pub fn info(&self) -> Result<StreamInfo> {
        self.ensure_alive("query")?;
        Ok(StreamInfo {
            packet_samples: self.packet_samples,
            packet_bytes: self.host_format.block_bytes(self.packet_samples),
            channels: self.rings.len(),
        })
    }

    /// Run a lifecycle command
    pub fn op(&mut self, command: StreamCommand, at: Option<Timestamp>) -> Result<()> {
        match command {
            StreamCommand::Start => self.start(at),
            StreamCommand::Stop => self.stop(),
        }
    }

    /// Start streaming, optionally at device time `at`
    pub fn start(&mut self, at: Option<Timestamp>) -> Result<()> {
        match self.state {
            StreamState::Configured | StreamState::Stopped => {}
            _ => return Err(self.invalid_state("start")),
        }
        self.ops("start")?.start(at)?;
        self.state = StreamState::Running;
        match at {
            Some(ts) => log::info!("{} stream {} started at {}", self.direction, self.id, ts),
            None => log::info!("{} stream {} started", self.direction, self.id),
        }
        Ok(())
    }

    /// Stop streaming
    ///
    /// The stream leaves `Running` even when the backend reports an error;
    /// the error is still returned.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            StreamState::Running => {}
            StreamState::Destroyed => return Err(self.invalid_state("stop")),
            _ => return Ok(()),
        }
        let result = self.ops("stop")?.stop();
        self.state = StreamState::Stopped;
        match &result {
            Ok(()) => log::info!("{} stream {} stopped", self.direction, self.id),
            Err(e) => log::warn!("{} stream {} stopped with error: {}", self.direction, self.id, e),
        }
        result
    }

    fn ensure_running(&self, op: &'static str, direction: Direction) -> Result<()> {
        if self.state != StreamState::Running || self.direction != direction {
            return Err(self.invalid_state(op));
        }
        Ok(())
    }

    /// Receive one packet per channel into `buffers` (host format)
    pub fn recv(
        &mut self,
        buffers: &mut [&mut [u8]],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<RecvInfo> {
        self.ensure_running("recv", Direction::Rx)?;
        let bytes = self.host_format.block_bytes(self.packet_samples);
        check_buffers(buffers.iter().map(|b| b.len()), self.rings.len(), bytes)?;

        let ops = self.ops.as_mut().ok_or(Error::DeviceClosed)?;
        if self.scratch.is_empty() {
            return ops.recv(buffers, timeout, cancel);
        }

        let mut native: Vec<&mut [u8]> = self.scratch.iter_mut().map(|b| b.as_mut_slice()).collect();
        let info = ops.recv(&mut native, timeout, cancel)?;
        let samples = info.samples.min(self.packet_samples);
        for (src, dst) in self.scratch.iter().zip(buffers.iter_mut()) {
            self.kernel.convert(src, dst, samples)?;
        }
        Ok(info)
    }

    /// Transmit `samples` samples per channel from `buffers` (host format)
    pub fn send(
        &mut self,
        buffers: &[&[u8]],
        samples: usize,
        timestamp: Option<Timestamp>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.ensure_running("send", Direction::Tx)?;
        if samples == 0 || samples > self.packet_samples {
            return Err(Error::InvalidArgument(format!(
                "send of {} samples, packet holds {}",
                samples, self.packet_samples
            )));
        }
        let bytes = self.host_format.block_bytes(samples);
        check_buffers(buffers.iter().map(|b| b.len()), self.rings.len(), bytes)?;

        let ops = self.ops.as_mut().ok_or(Error::DeviceClosed)?;
        if self.scratch.is_empty() {
            return ops.send(buffers, samples, timestamp, timeout, cancel);
        }

        for (src, dst) in buffers.iter().zip(self.scratch.iter_mut()) {
            self.kernel.convert(src, dst, samples)?;
        }
        let native: Vec<&[u8]> = self.scratch.iter().map(|b| b.as_slice()).collect();
        ops.send(&native, samples, timestamp, timeout, cancel)
    }

    pub fn option_get(&mut self, name: &str) -> Result<i64> {
        self.ensure_alive("get option of")?;
        self.ops("get option of")?.option_get(name)
    }

    pub fn option_set(&mut self, name: &str, value: i64) -> Result<()> {
        self.ensure_alive("set option of")?;
        self.ops("set option of")?.option_set(name, value)
    }

    pub fn stats(&mut self) -> Result<StreamStats> {
        self.ensure_alive("query")?;
        Ok(self.ops("query")?.stat())
    }

    /// Ring buffer of the `index`-th selected channel
    pub fn ring(&self, index: usize) -> Result<&RingBuffer> {
        self.ensure_alive("access ring of")?;
        self.rings.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!("stream has {} channels, no index {}", self.rings.len(), index))
        })
    }

    /// Producer role of every channel ring, in channel order
    pub fn take_producers(&mut self) -> Result<Vec<SlotProducer>> {
        self.ensure_alive("take producers of")?;
        self.rings.iter_mut().map(RingBuffer::take_producer).collect()
    }

    /// Consumer role of every channel ring, in channel order
    pub fn take_consumers(&mut self) -> Result<Vec<SlotConsumer>> {
        self.ensure_alive("take consumers of")?;
        self.rings.iter_mut().map(RingBuffer::take_consumer).collect()
    }

    /// Tear the stream down
    ///
    /// A running stream is stopped first, then the stream leaves the device
    /// registry and finally its rings are closed and released. Ring roles
    /// still held by other threads fail with `Disconnected` afterwards.
    pub fn destroy(&mut self) -> Result<()> {
        if self.state == StreamState::Destroyed {
            return Err(self.invalid_state("destroy"));
        }
        if self.state == StreamState::Running {
            if let Err(e) = self.stop() {
                log::warn!("{} stream {}: stop during destroy failed: {}", self.direction, self.id, e);
            }
        }

        if let Some(device) = self.device.upgrade() {
            device.unregister(self.id);
        }
        self.ops = None;
        for ring in &self.rings {
            ring.close();
        }
        self.rings.clear();
        self.scratch.clear();
        self.state = StreamState::Destroyed;
        log::info!("{} stream {} destroyed", self.direction, self.id);
        Ok(())
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.state != StreamState::Destroyed {
            if let Err(e) = self.destroy() {
                log::error!("{} stream {}: implicit destroy failed: {}", self.direction, self.id, e);
            }
        }
    }
}

fn check_buffers(lens: impl ExactSizeIterator<Item = usize>, channels: usize, bytes: usize) -> Result<()> {
    if lens.len() != channels {
        return Err(Error::ContractViolation(format!(
            "{} buffers given for {} channels",
            lens.len(),
            channels
        )));
    }
    for (ch, len) in lens.enumerate() {
        if len < bytes {
            return Err(Error::ContractViolation(format!(
                "channel {} buffer holds {} bytes, {} needed",
                ch, len, bytes
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::device::SyncType;

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn device() -> Device {
        Device::open(Some("sim:channels=4")).unwrap()
    }

    #[test]
    fn test_endpoint_direction() {
        assert_eq!(endpoint_direction(RX_ENDPOINT).unwrap(), Direction::Rx);
        assert_eq!(endpoint_direction(TX_ENDPOINT).unwrap(), Direction::Tx);
        assert!(endpoint_direction("/dm/rate").is_err());
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(parse_format("cf32", SampleFormat::Ci12).unwrap(), SampleFormat::Cf32);
        assert_eq!(parse_format("ci16@ci12", SampleFormat::Ci12).unwrap(), SampleFormat::Ci16);
        assert!(matches!(
            parse_format("ci16@ci16", SampleFormat::Ci12),
            Err(Error::UnsupportedFormat(_))
        ));
        assert!(matches!(parse_format("cs8", SampleFormat::Ci12), Err(Error::UnsupportedFormat(_))));
    }

    #[test]
    fn test_create_validation() {
        let dev = device();
        let create = |mask: u64, packet: usize, format: &str| {
            dev.create_stream(RX_ENDPOINT, format, ChannelMask(mask), packet, StreamFlags::NONE)
        };
        assert!(matches!(create(0, 64, "ci16"), Err(Error::InvalidArgument(_))));
        assert!(matches!(create(1, 0, "ci16"), Err(Error::InvalidArgument(_))));
        assert_eq!(
            create(0b11111, 64, "ci16").err(),
            Some(Error::TooManyChannels { requested: 5, max: 4 })
        );
        assert!(matches!(create(1, 64, "cu8"), Err(Error::UnsupportedFormat(_))));
        assert!(matches!(
            dev.create_stream("/ll/sdr/0", "ci16", ChannelMask(1), 64, StreamFlags::NONE),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(dev.open_streams(), 0);
    }

    #[test]
    fn test_configured_channel_cap() {
        let config = CoreConfig {
            max_channels: 2,
            ..CoreConfig::default()
        };
        let dev = Device::open_with_config(None, config).unwrap();
        assert_eq!(
            dev.create_stream(RX_ENDPOINT, "ci16", ChannelMask(0b111), 64, StreamFlags::NONE)
                .err(),
            Some(Error::TooManyChannels { requested: 3, max: 2 })
        );
    }

    #[test]
    fn test_backend_error_unregisters() {
        let dev = device();
        let _rx = dev
            .create_stream(RX_ENDPOINT, "ci16", ChannelMask(1), 64, StreamFlags::NONE)
            .unwrap();
        let busy = dev.create_stream(RX_ENDPOINT, "ci16", ChannelMask(1), 64, StreamFlags::NONE);
        assert!(matches!(busy, Err(Error::Backend { .. })));
        assert_eq!(dev.open_streams(), 1);
    }

    #[test]
    fn test_info_and_kernel() {
        let dev = device();
        let rx = dev
            .create_stream(RX_ENDPOINT, "cf32", ChannelMask(0b101), 1000, StreamFlags::NONE)
            .unwrap();
        assert_eq!(rx.state(), StreamState::Configured);
        assert_eq!(
            rx.info().unwrap(),
            StreamInfo {
                packet_samples: 1000,
                packet_bytes: 8000,
                channels: 2
            }
        );
        assert!(rx.kernel_name().starts_with("ci12->cf32/"));
        assert_eq!(rx.ring(1).unwrap().slot_size(), 8000);
        assert_eq!(rx.ring(0).unwrap().slot_count(), dev.config().ring_slots);
        assert!(rx.ring(2).is_err());
    }

    #[test]
    fn test_state_machine() {
        let dev = device();
        let mut rx = dev
            .create_stream(RX_ENDPOINT, "ci16", ChannelMask(1), 128, StreamFlags::NONE)
            .unwrap();
        let cancel = CancelToken::new();
        let mut buf = vec![0u8; 512];

        let err = rx.recv(&mut [buf.as_mut_slice()], TIMEOUT, &cancel).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidState {
                op: "recv",
                direction: Direction::Rx,
                state: "configured"
            }
        );

        // Stopping a stream that never ran is a no-op
        rx.stop().unwrap();
        assert_eq!(rx.state(), StreamState::Configured);

        rx.op(StreamCommand::Start, None).unwrap();
        assert_eq!(rx.state(), StreamState::Running);
        assert!(matches!(rx.start(None), Err(Error::InvalidState { op: "start", .. })));
        assert!(matches!(
            rx.send(&[buf.as_slice()], 128, None, TIMEOUT, &cancel),
            Err(Error::InvalidState { op: "send", .. })
        ));
        rx.recv(&mut [buf.as_mut_slice()], TIMEOUT, &cancel).unwrap();

        rx.op(StreamCommand::Stop, None).unwrap();
        assert_eq!(rx.state(), StreamState::Stopped);
        rx.stop().unwrap();
        rx.start(None).unwrap();

        rx.destroy().unwrap();
        assert_eq!(rx.state(), StreamState::Destroyed);
        assert!(matches!(rx.destroy(), Err(Error::InvalidState { op: "destroy", .. })));
        assert!(rx.info().is_err());
        assert!(rx.stop().is_err());
        assert_eq!(dev.open_streams(), 0);
    }

    #[test]
    fn test_recv_buffer_contract() {
        let dev = device();
        let mut rx = dev
            .create_stream(RX_ENDPOINT, "ci16", ChannelMask(0b11), 64, StreamFlags::NONE)
            .unwrap();
        rx.start(None).unwrap();
        let cancel = CancelToken::new();

        let mut a = vec![0u8; 256];
        let mut b = vec![0u8; 255];
        assert!(matches!(
            rx.recv(&mut [a.as_mut_slice()], TIMEOUT, &cancel),
            Err(Error::ContractViolation(_))
        ));
        assert!(matches!(
            rx.recv(&mut [a.as_mut_slice(), b.as_mut_slice()], TIMEOUT, &cancel),
            Err(Error::ContractViolation(_))
        ));
    }

    #[test]
    fn test_send_conversion_reaches_tap() {
        let mut config = CoreConfig::default();
        config.sim.tap_bytes = 1 << 12;
        let (dev, mut probe) = Device::open_sim(config).unwrap();
        let mut tap = probe.take_tx_tap(0).unwrap();

        let mut tx = dev
            .create_stream(TX_ENDPOINT, "ci16", ChannelMask(1), 4, StreamFlags::NONE)
            .unwrap();
        tx.start(None).unwrap();

        let block: Vec<u8> = bytemuck::cast_slice::<i16, u8>(&[16, -16, 32752, -32768, 0, 0, 0, 0]).to_vec();
        tx.send(&[block.as_slice()], 2, None, TIMEOUT, &CancelToken::new()).unwrap();
        assert!(matches!(
            tx.send(&[block.as_slice()], 5, None, TIMEOUT, &CancelToken::new()),
            Err(Error::InvalidArgument(_))
        ));

        // Two ci12 samples: (1, -1), (2047, -2048)
        let chunk = tap.read_chunk(6).unwrap();
        let (head, tail) = chunk.as_slices();
        let bytes: Vec<u8> = head.iter().chain(tail).copied().collect();
        chunk.commit_all();
        assert_eq!(bytes, vec![0x01, 0xf0, 0xff, 0xff, 0x07, 0x80]);
    }

    #[test]
    fn test_option_passthrough() {
        let dev = device();
        let mut rx = dev
            .create_stream(RX_ENDPOINT, "ci12", ChannelMask(0b11), 64, StreamFlags::NONE)
            .unwrap();
        assert_eq!(rx.option_get("channels").unwrap(), 2);
        assert!(matches!(rx.option_get("fd"), Err(Error::Backend { .. })));
        rx.option_set("ready", 1).unwrap();
        assert_eq!(rx.option_get("ready").unwrap(), 1);
        assert_eq!(rx.stats().unwrap().blocks, 0);
    }

    #[test]
    fn test_drop_destroys() {
        let dev = device();
        {
            let mut rx = dev
                .create_stream(RX_ENDPOINT, "ci16", ChannelMask(1), 64, StreamFlags::NONE)
                .unwrap();
            rx.start(None).unwrap();
            assert_eq!(dev.open_streams(), 1);
        }
        assert_eq!(dev.open_streams(), 0);
        // The endpoint is free again
        let rx = dev.create_stream(RX_ENDPOINT, "ci16", ChannelMask(1), 64, StreamFlags::NONE);
        assert!(rx.is_ok());
    }

    #[test]
    fn test_destroy_disconnects_ring_roles() {
        let dev = device();
        let mut rx = dev
            .create_stream(RX_ENDPOINT, "ci16", ChannelMask(1), 64, StreamFlags::NONE)
            .unwrap();
        let mut producers = rx.take_producers().unwrap();
        let mut consumers = rx.take_consumers().unwrap();
        assert!(rx.take_producers().is_err());

        rx.destroy().unwrap();
        let cancel = CancelToken::new();
        assert_eq!(producers[0].wait(TIMEOUT, &cancel), Err(Error::Disconnected));
        assert_eq!(consumers[0].wait(TIMEOUT, &cancel), Err(Error::Disconnected));
    }

    #[test]
    fn test_sync_after_destroy_fails() {
        let dev = device();
        let mut rx = dev
            .create_stream(RX_ENDPOINT, "ci16", ChannelMask(1), 64, StreamFlags::NONE)
            .unwrap();
        dev.sync(SyncType::Rx, &[&rx]).unwrap();
        rx.destroy().unwrap();
        assert!(matches!(dev.sync(SyncType::Rx, &[&rx]), Err(Error::InvalidState { op: "sync", .. })));
    }
}
