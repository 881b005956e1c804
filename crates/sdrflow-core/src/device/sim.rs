//! Simulated radio
//!
//! A software device with the same contract as hardware: native `ci12`
//! samples, a sample-counter timestamp domain shared by its streams, a
//! property tree and synchronization. RX channels carry tones; TX data can
//! be captured through per-channel taps and optionally looped back to RX.
//!
//! ```text
//!   TX send ──┬──▶ tap (rtrb, read via SimProbe)
//!             └──▶ loopback (rtrb) ──▶ RX recv (falls back to tones)
//! ```
//!
//! Unpaced (the default) the device produces and accepts data as fast as it
//! is asked; paced, blocks are released at the configured sample rate.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::args::{DeviceArgs, DeviceDescriptor};
use super::backend::{
    DeviceBackend, RecvInfo, StreamId, StreamOps, StreamRequest, StreamStats, SyncType,
};
use super::property::PropertyValue;
use crate::error::{Error, Result};
use crate::lock;
use crate::ring::CancelToken;
use crate::signal::ToneGenerator;
use crate::types::{ChannelMask, Direction, SampleFormat, StreamFlags, Timestamp};

/// Wire format of the simulated radio
pub const NATIVE_FORMAT: SampleFormat = SampleFormat::Ci12;

/// Largest packet a simulated stream accepts
pub const MAX_PACKET_SAMPLES: usize = 1 << 20;

// Backend error codes (negative errno values, as reported by drivers)
pub const ERR_PERMISSION: i32 = -1;
pub const ERR_NOT_FOUND: i32 = -2;
pub const ERR_IO: i32 = -5;
pub const ERR_BUSY: i32 = -16;
pub const ERR_INVALID: i32 = -22;
pub const ERR_NOT_SUPPORTED: i32 = -95;
pub const ERR_LATE: i32 = -110;

const RX_PATHS: &[&str] = &["rx_auto", "rxl", "rxw", "rxh", "adc", "rxl_lb", "rxw_lb", "rxh_lb"];
const TX_PATHS: &[&str] = &["tx_auto", "txb1", "txb2", "txw", "txh"];
const REFCLK_PATHS: &[&str] = &["internal", "external"];

/// Simulated device parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Hardware channels per direction
    pub channels: usize,
    /// Sample rate in samples per second
    pub rate: u64,
    /// Feed transmitted samples back into RX
    pub loopback: bool,
    /// Release blocks at the sample rate instead of immediately
    pub paced: bool,
    /// RX tone of channel 0 in cycles per sample; channel `n` uses `(n + 1)` times this
    pub rx_tone: f64,
    pub rx_amplitude: f32,
    /// Capacity of each per-channel TX capture tap in bytes; 0 disables taps
    pub tap_bytes: usize,
    /// Fail every RX call after this many delivered blocks
    pub fail_recv_after: Option<u64>,
    /// Reported die temperature in degrees Celsius
    pub temperature: f64,
    pub serial: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            channels: 4,
            rate: 50_000_000,
            loopback: false,
            paced: false,
            rx_tone: 0.01,
            rx_amplitude: 0.5,
            tap_bytes: 0,
            fail_recv_after: None,
            temperature: 42.5,
            serial: "SIM0001".to_string(),
        }
    }
}

impl SimConfig {
    /// Override fields from device string parameters
    pub fn apply_args(&mut self, args: &DeviceArgs) -> Result<()> {
        for key in args.keys() {
            match key {
                "channels" | "rate" | "loopback" | "paced" | "tone" | "amplitude" | "tap_bytes"
                | "fail_recv_after" | "temp" | "serial" => {}
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "unknown sim device parameter '{}'",
                        other
                    )))
                }
            }
        }

        if let Some(v) = args.parse_value::<usize>("channels")? {
            self.channels = v;
        }
        if let Some(v) = args.parse_value::<f64>("rate")? {
            self.rate = v as u64;
        }
        if let Some(v) = args.parse_flag("loopback")? {
            self.loopback = v;
        }
        if let Some(v) = args.parse_flag("paced")? {
            self.paced = v;
        }
        if let Some(v) = args.parse_value::<f64>("tone")? {
            self.rx_tone = v;
        }
        if let Some(v) = args.parse_value::<f32>("amplitude")? {
            self.rx_amplitude = v;
        }
        if let Some(v) = args.parse_value::<usize>("tap_bytes")? {
            self.tap_bytes = v;
        }
        if let Some(v) = args.parse_value::<u64>("fail_recv_after")? {
            self.fail_recv_after = Some(v);
        }
        if let Some(v) = args.parse_value::<f64>("temp")? {
            self.temperature = v;
        }
        if let Some(v) = args.get("serial") {
            self.serial = v.to_string();
        }
        self.validate()
    }

    /// Check the fields a simulated device cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.channels > 64 {
            return Err(Error::InvalidArgument(format!(
                "sim channel count must be 1..=64, got {}",
                self.channels
            )));
        }
        if self.rate == 0 {
            return Err(Error::InvalidArgument("sim sample rate must be non-zero".into()));
        }
        Ok(())
    }
}

/// Per-stream position in the device timestamp domain
struct StreamClock {
    direction: Direction,
    /// Timestamp of the next sample this stream delivers or expects
    cursor: AtomicU64,
}

struct SimShared {
    config: SimConfig,
    rate: AtomicU64,
    /// Device time: end of the most recent RX block
    now: AtomicU64,
    aligned: AtomicBool,
    clocks: Mutex<HashMap<StreamId, Arc<StreamClock>>>,
    taps: Mutex<Vec<Option<rtrb::Producer<u8>>>>,
    loop_tx: Mutex<Vec<Option<rtrb::Producer<u8>>>>,
    loop_rx: Mutex<Vec<Option<rtrb::Consumer<u8>>>>,
    rx_blocks: AtomicU64,
    tx_blocks: AtomicU64,
    tx_underruns: AtomicU64,
    tap_dropped: AtomicU64,
    resyncs: AtomicU64,
}

impl SimShared {
    fn resync(&self) {
        let now = self.now.load(Ordering::Acquire);
        for clock in lock(&self.clocks).values() {
            clock.cursor.store(now, Ordering::Release);
        }
        self.resyncs.fetch_add(1, Ordering::Relaxed);
        log::info!("sim: resync, all streams realigned to @{}", now);
    }

    /// Sleep until block `block` of a paced stream is due
    fn pace(
        &self,
        started: Instant,
        block: u64,
        packet: usize,
        timeout: Duration,
        cancel: &CancelToken,
        what: &'static str,
    ) -> Result<()> {
        if !self.config.paced {
            return Ok(());
        }
        let rate = self.rate.load(Ordering::Relaxed).max(1) as f64;
        let due = started + Duration::from_secs_f64((block * packet as u64) as f64 / rate);
        let now = Instant::now();
        if due <= now {
            return Ok(());
        }
        let wait = due - now;
        let timed_out = wait > timeout;
        crossbeam::select! {
            recv(cancel.signal()) -> _ => return Err(Error::Cancelled),
            default(wait.min(timeout)) => {}
        }
        if timed_out {
            Err(Error::Timeout(what))
        } else {
            Ok(())
        }
    }
}

/// Test access to a simulated device's internals
pub struct SimProbe {
    shared: Arc<SimShared>,
    taps: Vec<Option<rtrb::Consumer<u8>>>,
}

impl SimProbe {
    /// Consumer of everything transmitted on `channel` (native bytes)
    pub fn take_tx_tap(&mut self, channel: usize) -> Option<rtrb::Consumer<u8>> {
        self.taps.get_mut(channel).and_then(Option::take)
    }

    /// Current device time
    pub fn device_time(&self) -> Timestamp {
        Timestamp(self.shared.now.load(Ordering::Acquire))
    }

    pub fn is_aligned(&self) -> bool {
        self.shared.aligned.load(Ordering::Acquire)
    }

    pub fn tx_underruns(&self) -> u64 {
        self.shared.tx_underruns.load(Ordering::Relaxed)
    }

    pub fn rx_blocks(&self) -> u64 {
        self.shared.rx_blocks.load(Ordering::Relaxed)
    }

    pub fn tx_blocks(&self) -> u64 {
        self.shared.tx_blocks.load(Ordering::Relaxed)
    }

    pub fn resyncs(&self) -> u64 {
        self.shared.resyncs.load(Ordering::Relaxed)
    }

    /// Bytes dropped because a tap was full
    pub fn tap_dropped(&self) -> u64 {
        self.shared.tap_dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy)]
enum Rule {
    Any,
    Range(f64, f64),
    OneOf(&'static [&'static str]),
}

#[derive(Debug, Clone)]
struct Property {
    value: PropertyValue,
    access: Access,
    rule: Rule,
}

impl Property {
    fn new(value: impl Into<PropertyValue>, access: Access, rule: Rule) -> Self {
        Self {
            value: value.into(),
            access,
            rule,
        }
    }
}

/// The simulated device backend
pub struct SimBackend {
    shared: Arc<SimShared>,
    properties: BTreeMap<String, Property>,
    last_sync: Option<SyncType>,
}

impl SimBackend {
    /// Create a simulated device and its probe
    pub fn new(config: SimConfig) -> (Self, SimProbe) {
        let channels = config.channels;

        let mut tap_producers = Vec::with_capacity(channels);
        let mut tap_consumers = Vec::with_capacity(channels);
        for _ in 0..channels {
            if config.tap_bytes > 0 {
                let (p, c) = rtrb::RingBuffer::<u8>::new(config.tap_bytes);
                tap_producers.push(Some(p));
                tap_consumers.push(Some(c));
            } else {
                tap_producers.push(None);
                tap_consumers.push(None);
            }
        }

        let mut loop_tx = Vec::with_capacity(channels);
        let mut loop_rx = Vec::with_capacity(channels);
        for _ in 0..channels {
            if config.loopback {
                // Room for a few default-sized packets in flight
                let (p, c) = rtrb::RingBuffer::<u8>::new(NATIVE_FORMAT.block_bytes(1 << 16));
                loop_tx.push(Some(p));
                loop_rx.push(Some(c));
            } else {
                loop_tx.push(None);
                loop_rx.push(None);
            }
        }

        let properties = Self::property_tree(&config);
        log::info!(
            "sim: device {} with {} channels at {} S/s (loopback {}, paced {})",
            config.serial,
            channels,
            config.rate,
            config.loopback,
            config.paced
        );

        let shared = Arc::new(SimShared {
            rate: AtomicU64::new(config.rate),
            now: AtomicU64::new(0),
            aligned: AtomicBool::new(false),
            clocks: Mutex::new(HashMap::new()),
            taps: Mutex::new(tap_producers),
            loop_tx: Mutex::new(loop_tx),
            loop_rx: Mutex::new(loop_rx),
            rx_blocks: AtomicU64::new(0),
            tx_blocks: AtomicU64::new(0),
            tx_underruns: AtomicU64::new(0),
            tap_dropped: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            config,
        });

        let probe = SimProbe {
            shared: Arc::clone(&shared),
            taps: tap_consumers,
        };
        let backend = Self {
            shared,
            properties,
            last_sync: None,
        };
        (backend, probe)
    }

    /// Descriptor of a device built from `config`
    pub fn descriptor(config: &SimConfig) -> DeviceDescriptor {
        DeviceDescriptor {
            backend: "sim",
            address: format!("sim:serial={}", config.serial),
            serial: config.serial.clone(),
            channels: config.channels,
            native_format: NATIVE_FORMAT,
            description: format!("simulated radio, {} S/s", config.rate),
        }
    }

    fn property_tree(config: &SimConfig) -> BTreeMap<String, Property> {
        use Access::*;

        let gain = Rule::Range(0.0, 70.0);
        let freq = Rule::Range(1e6, 7.5e9);
        let bandwidth = Rule::Range(1e3, 1e9);

        let entries = [
            ("/ll/devices", Property::new(1u64, ReadOnly, Rule::Any)),
            ("/ll/sdr/max_sw_rx_chans", Property::new(config.channels as u64, ReadOnly, Rule::Any)),
            ("/ll/sdr/max_sw_tx_chans", Property::new(config.channels as u64, ReadOnly, Rule::Any)),
            ("/dm/rate", Property::new(config.rate, ReadWrite, Rule::Range(1.0, 200e6))),
            ("/dm/power/en", Property::new(0u64, ReadWrite, Rule::Range(0.0, 1.0))),
            ("/dm/sensor/temp", Property::new((config.temperature * 256.0) as u64, ReadOnly, Rule::Any)),
            ("/dm/debug/all", Property::new(0u64, ReadOnly, Rule::Any)),
            ("/dm/debug/rxtime", Property::new(0u64, ReadOnly, Rule::Any)),
            ("/dm/resync", Property::new(0u64, WriteOnly, Rule::Any)),
            ("/dm/sync/cal/freq", Property::new(0u64, ReadWrite, Rule::Any)),
            ("/dm/sdr/refclk/path", Property::new("internal", ReadWrite, Rule::OneOf(REFCLK_PATHS))),
            ("/dm/sdr/0/rx/freqency", Property::new(900e6, ReadWrite, freq)),
            ("/dm/sdr/0/tx/freqency", Property::new(920e6, ReadWrite, freq)),
            ("/dm/sdr/0/tdd/freqency", Property::new(910e6, ReadWrite, freq)),
            ("/dm/sdr/0/rx/bandwidth", Property::new(1e6, ReadWrite, bandwidth)),
            ("/dm/sdr/0/tx/bandwidth", Property::new(1e6, ReadWrite, bandwidth)),
            ("/dm/sdr/0/rx/gain/lna", Property::new(15u64, ReadWrite, gain)),
            ("/dm/sdr/0/rx/gain/vga", Property::new(15u64, ReadWrite, gain)),
            ("/dm/sdr/0/rx/gain/pga", Property::new(15u64, ReadWrite, gain)),
            ("/dm/sdr/0/tx/gain", Property::new(0u64, ReadWrite, Rule::Range(0.0, 100.0))),
            ("/dm/sdr/0/rx/path", Property::new("rx_auto", ReadWrite, Rule::OneOf(RX_PATHS))),
            ("/dm/sdr/0/tx/path", Property::new("tx_auto", ReadWrite, Rule::OneOf(TX_PATHS))),
            ("/dm/sdr/0/tfe/antcfg", Property::new(0u64, ReadWrite, Rule::Range(0.0, 15.0))),
            ("/debug/hw/lms7002m/0/rxlml", Property::new(0u64, ReadWrite, Rule::Any)),
        ];

        entries
            .into_iter()
            .map(|(path, prop)| (path.to_string(), prop))
            .collect()
    }

    fn validate(path: &str, prop: &Property, value: &PropertyValue) -> Result<()> {
        let invalid = |what: String| Error::backend(ERR_INVALID, format!("{}: {}", path, what));

        let textual = matches!(prop.value, PropertyValue::Str(_));
        if textual != matches!(value, PropertyValue::Str(_)) {
            return Err(invalid(format!(
                "{} value '{}' does not fit a {} property",
                value.kind(),
                value,
                prop.value.kind()
            )));
        }

        match prop.rule {
            Rule::Any => Ok(()),
            Rule::Range(lo, hi) => match value.as_f64() {
                Some(v) if v >= lo && v <= hi => Ok(()),
                _ => Err(invalid(format!("{} outside {}..={}", value, lo, hi))),
            },
            Rule::OneOf(options) => match value.as_str() {
                Some(s) if options.contains(&s) => Ok(()),
                _ => Err(invalid(format!("'{}' is not one of {}", value, options.join("|")))),
            },
        }
    }

    fn debug_dump(&self) -> u64 {
        let s = &self.shared;
        let rx = s.rx_blocks.load(Ordering::Relaxed);
        let tx = s.tx_blocks.load(Ordering::Relaxed);
        log::debug!(
            "sim debug: now=@{} rx_blocks={} tx_blocks={} tx_underruns={} tap_dropped={} resyncs={} aligned={}",
            s.now.load(Ordering::Relaxed),
            rx,
            tx,
            s.tx_underruns.load(Ordering::Relaxed),
            s.tap_dropped.load(Ordering::Relaxed),
            s.resyncs.load(Ordering::Relaxed),
            s.aligned.load(Ordering::Relaxed)
        );
        rx + tx
    }
}

impl DeviceBackend for SimBackend {
    fn name(&self) -> &str {
        "sim"
    }

    fn native_format(&self) -> SampleFormat {
        NATIVE_FORMAT
    }

    fn max_channels(&self) -> usize {
        self.shared.config.channels
    }

    fn describe(&self) -> DeviceDescriptor {
        Self::descriptor(&self.shared.config)
    }

    fn open_stream(&mut self, request: &StreamRequest) -> Result<Box<dyn StreamOps>> {
        let config = &self.shared.config;
        if let Some(highest) = request.channels.highest() {
            if highest >= config.channels {
                return Err(Error::backend(
                    ERR_INVALID,
                    format!("channel {} does not exist (device has {})", highest, config.channels),
                ));
            }
        }
        if request.packet_samples > MAX_PACKET_SAMPLES {
            return Err(Error::backend(
                ERR_INVALID,
                format!(
                    "packet of {} samples exceeds {}",
                    request.packet_samples, MAX_PACKET_SAMPLES
                ),
            ));
        }

        let clock = {
            let mut clocks = lock(&self.shared.clocks);
            if clocks.values().any(|c| c.direction == request.direction) {
                return Err(Error::backend(
                    ERR_BUSY,
                    format!("{} endpoint {} already open", request.direction, request.endpoint),
                ));
            }
            let clock = Arc::new(StreamClock {
                direction: request.direction,
                cursor: AtomicU64::new(self.shared.now.load(Ordering::Acquire)),
            });
            clocks.insert(request.id, Arc::clone(&clock));
            clock
        };

        let channels: Vec<usize> = request.channels.channels().collect();
        log::debug!(
            "sim: open {} stream {} on {} channels {:?}, {} samples/packet",
            request.direction,
            request.id,
            request.endpoint,
            channels,
            request.packet_samples
        );

        let common = StreamCommon {
            shared: Arc::clone(&self.shared),
            id: request.id,
            mask: request.channels,
            packet_samples: request.packet_samples,
            clock,
            running: false,
            started: Instant::now(),
            blocks_since_start: 0,
            stats: StreamStats::default(),
            ready: false,
        };

        match request.direction {
            Direction::Rx => {
                let tones = channels
                    .iter()
                    .map(|&ch| {
                        ToneGenerator::new(config.rx_tone * (ch + 1) as f64, config.rx_amplitude)
                            .with_phase(ch as f64 * 0.125)
                    })
                    .collect();
                let loopback = {
                    let mut pool = lock(&self.shared.loop_rx);
                    channels.iter().map(|&ch| pool[ch].take()).collect()
                };
                Ok(Box::new(SimRxStream {
                    common,
                    flags: request.flags,
                    tones,
                    loopback,
                    channels,
                }))
            }
            Direction::Tx => {
                let taps = {
                    let mut pool = lock(&self.shared.taps);
                    channels.iter().map(|&ch| pool[ch].take()).collect()
                };
                let loopback = {
                    let mut pool = lock(&self.shared.loop_tx);
                    channels.iter().map(|&ch| pool[ch].take()).collect()
                };
                Ok(Box::new(SimTxStream {
                    common,
                    taps,
                    loopback,
                    channels,
                    expected: None,
                }))
            }
        }
    }

    fn close_stream(&mut self, id: StreamId) {
        if lock(&self.shared.clocks).remove(&id).is_some() {
            log::debug!("sim: closed stream {}", id);
        }
    }

    fn get(&self, path: &str) -> Result<PropertyValue> {
        match path {
            "/dm/debug/all" => return Ok(PropertyValue::U64(self.debug_dump())),
            "/dm/debug/rxtime" => return Ok(PropertyValue::U64(self.shared.now.load(Ordering::Acquire))),
            _ => {}
        }

        let prop = self
            .properties
            .get(path)
            .ok_or_else(|| Error::backend(ERR_NOT_FOUND, format!("no property {}", path)))?;
        if prop.access == Access::WriteOnly {
            return Err(Error::backend(ERR_PERMISSION, format!("{} is write-only", path)));
        }
        Ok(prop.value.clone())
    }

    fn set(&mut self, path: &str, value: PropertyValue) -> Result<()> {
        let prop = self
            .properties
            .get_mut(path)
            .ok_or_else(|| Error::backend(ERR_NOT_FOUND, format!("no property {}", path)))?;
        if prop.access == Access::ReadOnly {
            return Err(Error::backend(ERR_PERMISSION, format!("{} is read-only", path)));
        }
        Self::validate(path, prop, &value)?;

        match path {
            "/dm/rate" => {
                let rate = value.as_u64().unwrap_or(self.shared.config.rate);
                self.shared.rate.store(rate, Ordering::Relaxed);
                log::info!("sim: sample rate {} S/s", rate);
            }
            "/dm/resync" => self.shared.resync(),
            _ => log::debug!("sim: {} = {}", path, value),
        }
        prop.value = value;
        Ok(())
    }

    fn timer_op(&mut self, streams: &[(StreamId, Direction)], sync: SyncType) -> Result<()> {
        let clocks = lock(&self.shared.clocks);
        for (id, _) in streams {
            if !clocks.contains_key(id) {
                return Err(Error::backend(ERR_NOT_FOUND, format!("stream {} is not open", id)));
            }
        }

        if !sync.engages_alignment() {
            self.shared.aligned.store(false, Ordering::Release);
            self.last_sync = Some(sync);
            log::info!("sim: sync '{}', timestamp domain free-running", sync);
            return Ok(());
        }

        let now = self.shared.now.load(Ordering::Acquire);
        let epoch = match sync {
            SyncType::OnePps => {
                let rate = self.shared.rate.load(Ordering::Relaxed).max(1);
                now.div_ceil(rate) * rate
            }
            _ => now,
        };

        let mut aligned = 0;
        for (id, direction) in streams {
            if sync.applies_to(*direction) {
                if let Some(clock) = clocks.get(id) {
                    clock.cursor.store(epoch, Ordering::Release);
                    aligned += 1;
                }
            }
        }
        self.shared.now.fetch_max(epoch, Ordering::AcqRel);
        self.shared.aligned.store(true, Ordering::Release);
        self.last_sync = Some(sync);
        log::info!("sim: sync '{}', {} stream(s) aligned to @{}", sync, aligned, epoch);
        Ok(())
    }
}

struct StreamCommon {
    shared: Arc<SimShared>,
    id: StreamId,
    mask: ChannelMask,
    packet_samples: usize,
    clock: Arc<StreamClock>,
    running: bool,
    started: Instant,
    blocks_since_start: u64,
    stats: StreamStats,
    ready: bool,
}

impl StreamCommon {
    fn start(&mut self, at: Option<Timestamp>) -> Result<()> {
        if let Some(at) = at {
            self.clock.cursor.store(at.0, Ordering::Release);
        }
        self.running = true;
        self.started = Instant::now();
        self.blocks_since_start = 0;
        log::debug!(
            "sim: {} stream {} started at @{}",
            self.clock.direction,
            self.id,
            self.clock.cursor.load(Ordering::Acquire)
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.running {
            log::debug!("sim: {} stream {} stopped", self.clock.direction, self.id);
        }
        self.running = false;
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running {
            Ok(())
        } else {
            Err(Error::backend(
                ERR_IO,
                format!("{} stream {} is not started", self.clock.direction, self.id),
            ))
        }
    }

    fn option_get(&self, name: &str) -> Result<i64> {
        match name {
            "fd" => Err(Error::backend(
                ERR_NOT_SUPPORTED,
                "simulated streams have no file descriptor",
            )),
            "packet_samples" => Ok(self.packet_samples as i64),
            "channels" => Ok(self.mask.count() as i64),
            "cursor" => Ok(self.clock.cursor.load(Ordering::Acquire) as i64),
            "blocks" => Ok(self.stats.blocks as i64),
            "ready" => Ok(self.ready as i64),
            other => Err(Error::backend(ERR_NOT_FOUND, format!("no stream option '{}'", other))),
        }
    }

    fn option_set(&mut self, name: &str, value: i64) -> Result<()> {
        match name {
            "ready" => {
                self.ready = value != 0;
                Ok(())
            }
            "cursor" if value >= 0 => {
                self.clock.cursor.store(value as u64, Ordering::Release);
                Ok(())
            }
            "cursor" => Err(Error::backend(ERR_INVALID, "cursor must be non-negative")),
            other => Err(Error::backend(ERR_NOT_FOUND, format!("no stream option '{}'", other))),
        }
    }
}

struct SimRxStream {
    common: StreamCommon,
    flags: StreamFlags,
    channels: Vec<usize>,
    tones: Vec<ToneGenerator>,
    loopback: Vec<Option<rtrb::Consumer<u8>>>,
}

impl StreamOps for SimRxStream {
    fn start(&mut self, at: Option<Timestamp>) -> Result<()> {
        self.common.start(at)
    }

    fn stop(&mut self) -> Result<()> {
        self.common.stop()
    }

    fn recv(
        &mut self,
        buffers: &mut [&mut [u8]],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<RecvInfo> {
        let c = &mut self.common;
        c.ensure_running()?;
        cancel.check()?;

        if let Some(limit) = c.shared.config.fail_recv_after {
            if c.stats.blocks >= limit {
                return Err(Error::backend(
                    ERR_IO,
                    format!("simulated RX failure after {} blocks", limit),
                ));
            }
        }

        let samples = c.packet_samples;
        let bytes = NATIVE_FORMAT.block_bytes(samples);
        if buffers.len() != self.channels.len() || buffers.iter().any(|b| b.len() < bytes) {
            return Err(Error::ContractViolation(format!(
                "RX needs {} buffers of {} bytes",
                self.channels.len(),
                bytes
            )));
        }

        c.shared.pace(c.started, c.blocks_since_start + 1, samples, timeout, cancel, "RX packet")?;

        for ((buf, tone), looped) in buffers.iter_mut().zip(&mut self.tones).zip(&mut self.loopback) {
            let out = &mut buf[..bytes];
            match looped {
                Some(queue) if queue.slots() >= bytes => {
                    if let Ok(chunk) = queue.read_chunk(bytes) {
                        let (a, b) = chunk.as_slices();
                        out[..a.len()].copy_from_slice(a);
                        out[a.len()..].copy_from_slice(b);
                        chunk.commit_all();
                    }
                }
                _ => tone.fill_bytes(NATIVE_FORMAT, out, samples)?,
            }
        }

        let ts = c.clock.cursor.fetch_add(samples as u64, Ordering::AcqRel);
        c.shared.now.fetch_max(ts + samples as u64, Ordering::AcqRel);
        c.shared.rx_blocks.fetch_add(1, Ordering::Relaxed);
        c.blocks_since_start += 1;
        c.stats.blocks += 1;
        c.stats.samples += samples as u64;

        Ok(RecvInfo {
            timestamp: Some(Timestamp(ts)),
            samples,
            overrun: false,
            tx_underruns: self
                .flags
                .contains(StreamFlags::NEED_TX_STAT)
                .then(|| c.shared.tx_underruns.load(Ordering::Relaxed)),
        })
    }

    fn send(
        &mut self,
        _buffers: &[&[u8]],
        _samples: usize,
        _timestamp: Option<Timestamp>,
        _timeout: Duration,
        _cancel: &CancelToken,
    ) -> Result<()> {
        Err(Error::backend(ERR_NOT_SUPPORTED, "send on an RX stream"))
    }

    fn option_get(&self, name: &str) -> Result<i64> {
        self.common.option_get(name)
    }

    fn option_set(&mut self, name: &str, value: i64) -> Result<()> {
        self.common.option_set(name, value)
    }

    fn stat(&self) -> StreamStats {
        self.common.stats
    }
}

impl Drop for SimRxStream {
    fn drop(&mut self) {
        let mut pool = lock(&self.common.shared.loop_rx);
        for (&ch, queue) in self.channels.iter().zip(self.loopback.drain(..)) {
            if queue.is_some() {
                pool[ch] = queue;
            }
        }
    }
}

struct SimTxStream {
    common: StreamCommon,
    channels: Vec<usize>,
    taps: Vec<Option<rtrb::Producer<u8>>>,
    loopback: Vec<Option<rtrb::Producer<u8>>>,
    /// Timestamp the next block would have if sent back to back
    expected: Option<u64>,
}

impl SimTxStream {
    fn push(queue: &mut rtrb::Producer<u8>, data: &[u8]) -> bool {
        if queue.slots() < data.len() {
            return false;
        }
        match queue.write_chunk_uninit(data.len()) {
            Ok(chunk) => {
                chunk.fill_from_iter(data.iter().copied());
                true
            }
            Err(_) => false,
        }
    }
}

impl StreamOps for SimTxStream {
    fn start(&mut self, at: Option<Timestamp>) -> Result<()> {
        self.expected = None;
        self.common.start(at)
    }

    fn stop(&mut self) -> Result<()> {
        self.common.stop()
    }

    fn recv(
        &mut self,
        _buffers: &mut [&mut [u8]],
        _timeout: Duration,
        _cancel: &CancelToken,
    ) -> Result<RecvInfo> {
        Err(Error::backend(ERR_NOT_SUPPORTED, "recv on a TX stream"))
    }

    fn send(
        &mut self,
        buffers: &[&[u8]],
        samples: usize,
        timestamp: Option<Timestamp>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<()> {
        let c = &mut self.common;
        c.ensure_running()?;
        cancel.check()?;

        if samples > c.packet_samples {
            return Err(Error::backend(
                ERR_INVALID,
                format!("{} samples exceed the {} sample packet", samples, c.packet_samples),
            ));
        }
        let bytes = NATIVE_FORMAT.block_bytes(samples);
        if buffers.len() != self.channels.len() || buffers.iter().any(|b| b.len() < bytes) {
            return Err(Error::ContractViolation(format!(
                "TX needs {} buffers of {} bytes",
                self.channels.len(),
                bytes
            )));
        }

        let ts = match timestamp {
            Some(Timestamp(ts)) => {
                let now = c.shared.now.load(Ordering::Acquire);
                if ts < now {
                    c.stats.late += 1;
                    return Err(Error::backend(
                        ERR_LATE,
                        format!("TX timestamp @{} is late, device time @{}", ts, now),
                    ));
                }
                if let Some(expected) = self.expected {
                    if ts > expected {
                        c.stats.underruns += 1;
                        c.shared.tx_underruns.fetch_add(1, Ordering::Relaxed);
                        log::debug!("sim: TX gap of {} samples before @{}", ts - expected, ts);
                    }
                }
                c.clock.cursor.store(ts, Ordering::Release);
                ts
            }
            None => c.clock.cursor.load(Ordering::Acquire),
        };

        c.shared.pace(c.started, c.blocks_since_start + 1, samples, timeout, cancel, "TX packet")?;

        for ((data, tap), looped) in buffers.iter().zip(&mut self.taps).zip(&mut self.loopback) {
            let data = &data[..bytes];
            if let Some(tap) = tap {
                if !Self::push(tap, data) {
                    c.shared.tap_dropped.fetch_add(bytes as u64, Ordering::Relaxed);
                }
            }
            if let Some(queue) = looped {
                Self::push(queue, data);
            }
        }

        let end = ts + samples as u64;
        c.clock.cursor.store(end, Ordering::Release);
        self.expected = Some(end);
        c.shared.tx_blocks.fetch_add(1, Ordering::Relaxed);
        c.blocks_since_start += 1;
        c.stats.blocks += 1;
        c.stats.samples += samples as u64;
        Ok(())
    }

    fn option_get(&self, name: &str) -> Result<i64> {
        self.common.option_get(name)
    }

    fn option_set(&mut self, name: &str, value: i64) -> Result<()> {
        self.common.option_set(name, value)
    }

    fn stat(&self) -> StreamStats {
        self.common.stats
    }
}

impl Drop for SimTxStream {
    fn drop(&mut self) {
        let shared = &self.common.shared;
        let mut taps = lock(&shared.taps);
        let mut loop_tx = lock(&shared.loop_tx);
        for ((&ch, tap), looped) in self
            .channels
            .iter()
            .zip(self.taps.drain(..))
            .zip(self.loopback.drain(..))
        {
            if tap.is_some() {
                taps[ch] = tap;
            }
            if looped.is_some() {
                loop_tx[ch] = looped;
            }
        }
    }
}
