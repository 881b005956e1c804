//! dm-create - stream samples to and from an sdrflow device
//!
//! Opens a device, configures the frontend, then runs one of three loops
//! for `count` blocks:
//!
//! - RX only (default): per-channel disk writers store received blocks
//! - TX only (`-t`): per-channel tone generators or a file reader feed the TX stream
//! - TX+RX (`-T`): both, one send then one receive per iteration
//!
//! Settings come from `dm-create.yaml` in the sdrflow config directory and
//! can be overridden on the command line. Ctrl-C stops the loop and tears
//! everything down in order; a second Ctrl-C exits immediately.

mod config;
mod workers;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use sdrflow_core::config::{default_config_path, load_config, CoreConfig, CORE_CONFIG_FILE};
use sdrflow_core::device::{discover, render_device_list};
use sdrflow_core::ring::{CancelToken, SlotConsumer, SlotProducer};
use sdrflow_core::{
    ChannelMask, Device, Error, SampleFormat, StreamFlags, StreamHandle, Timestamp, RX_ENDPOINT,
    TX_ENDPOINT,
};

use config::{
    ToolConfig, FRONTEND_PREFIX, RX_BANDWIDTH, RX_FREQ, RX_GAIN_LNA, RX_GAIN_PGA, RX_GAIN_VGA, RX_PATH,
    TDD_FREQ, TOOL_CONFIG_FILE, TX_BANDWIDTH, TX_FREQ, TX_GAIN, TX_PATH,
};
use workers::{
    rx_file_name, spawn_disk_writer, spawn_tx_source, TxSource, Worker, WorkerControl, WorkerReport,
};

const DEFAULT_COUNT: usize = 128;
const DEFAULT_PACKET_SAMPLES: usize = 4096;

/// Wait for a ring slot before warning and retrying
const SLOT_WAIT: Duration = Duration::from_secs(1);
const RX_TIMEOUT: Duration = Duration::from_millis(2250);
const TX_ONLY_TIMEOUT: Duration = Duration::from_millis(32250);
const TX_RX_TIMEOUT: Duration = Duration::from_millis(15250);

#[derive(Parser, Debug)]
#[command(name = "dm-create")]
#[command(version, about = "Stream samples to and from an sdrflow device", long_about = None)]
struct Cli {
    /// Device string, e.g. "sim:channels=2,loopback=1"
    #[arg(short = 'D', long)]
    device: Option<String>,

    /// RX data file; channel n > 0 writes to <file>.<n> [out.data]
    #[arg(short = 'f', long = "rx-file")]
    rx_file: Option<PathBuf>,

    /// TX data file (a sine is generated if omitted)
    #[arg(short = 'I', long = "tx-file")]
    tx_file: Option<PathBuf>,

    /// Cycle the TX file when it holds fewer than `count` blocks
    #[arg(short = 'o', long)]
    cycle: bool,

    /// Number of blocks to transfer [128]
    #[arg(short = 'c', long)]
    count: Option<usize>,

    /// Sample rate [50e6]
    #[arg(short = 'r', long)]
    rate: Option<f64>,

    /// Host sample format (ci16 | cf32) [ci16]
    #[arg(short = 'F', long)]
    format: Option<String>,

    /// Channel mask, decimal or 0x-prefixed hex [all channels]
    #[arg(short = 'C', long = "channels", value_parser = parse_mask)]
    mask: Option<u64>,

    /// RX samples per block
    #[arg(short = 'S', long = "rx-samples", default_value_t = DEFAULT_PACKET_SAMPLES)]
    rx_samples: usize,

    /// TX samples per block
    #[arg(short = 'O', long = "tx-samples", default_value_t = DEFAULT_PACKET_SAMPLES)]
    tx_samples: usize,

    /// TX only
    #[arg(short = 't', long = "tx-only", conflicts_with = "tx_rx")]
    tx_only: bool,

    /// TX and RX
    #[arg(short = 'T', long = "tx-rx")]
    tx_rx: bool,

    /// Send TX blocks without timestamps
    #[arg(short = 'N', long = "no-timestamps")]
    no_timestamps: bool,

    /// TDD frequency [910e6]
    #[arg(short = 'q', long = "tdd-freq")]
    tdd_freq: Option<f64>,

    /// RX frequency [900e6]
    #[arg(short = 'e', long = "rx-freq")]
    rx_freq: Option<f64>,

    /// TX frequency [920e6]
    #[arg(short = 'E', long = "tx-freq")]
    tx_freq: Option<f64>,

    /// RX bandwidth [sample rate]
    #[arg(short = 'w', long = "rx-bandwidth")]
    rx_bandwidth: Option<f64>,

    /// TX bandwidth [sample rate]
    #[arg(short = 'W', long = "tx-bandwidth")]
    tx_bandwidth: Option<f64>,

    /// RX LNA gain [15]
    #[arg(short = 'y', long = "rx-gain-lna")]
    rx_gain_lna: Option<u64>,

    /// TX gain [0]
    #[arg(short = 'Y', long = "tx-gain")]
    tx_gain: Option<u64>,

    /// RX path ([rx_auto] | rxl | rxw | rxh | adc | rxl_lb | rxw_lb | rxh_lb)
    #[arg(short = 'p', long = "rx-path")]
    rx_path: Option<String>,

    /// TX path ([tx_auto] | txb1 | txb2 | txw | txh)
    #[arg(short = 'P', long = "tx-path")]
    tx_path: Option<String>,

    /// RX PGA gain [15]
    #[arg(short = 'u', long = "rx-gain-pga")]
    rx_gain_pga: Option<u64>,

    /// RX VGA gain [15]
    #[arg(short = 'U', long = "rx-gain-vga")]
    rx_gain_vga: Option<u64>,

    /// Reference clock path (internal | external)
    #[arg(short = 'a', long)]
    refclk: Option<String>,

    /// Calibration frequency, applied above 1 MHz
    #[arg(short = 'B', long = "cal-freq", default_value_t = 0.0)]
    cal_freq: f64,

    /// Sync type (all | 1pps | rx | tx | any | none | off) [all]
    #[arg(short = 's', long)]
    sync: Option<String>,

    /// List devices and exit
    #[arg(short = 'Q', long)]
    discover: bool,

    /// RX-only iteration that triggers a device resync
    #[arg(short = 'i', long, default_value_t = 1)]
    resync: usize,

    /// RX LML mode
    #[arg(short = 'R', long, default_value_t = 0)]
    lml: u64,

    /// Antenna configuration
    #[arg(short = 'A', long, default_value_t = 0)]
    antenna: u64,

    /// Skip device initialization
    #[arg(short = 'X', long = "no-init")]
    no_init: bool,

    /// Continue on setup errors
    #[arg(short = 'z', long = "continue-on-error")]
    continue_on_error: bool,

    /// Log level, 0 (errors) to 6+ (trace); RUST_LOG applies when omitted
    #[arg(short = 'l', long = "log-level")]
    log_level: Option<u8>,

    /// Tool config file [<config dir>/sdrflow/dm-create.yaml]
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Rx,
    Tx,
    TxRx,
}

impl Mode {
    fn rx(self) -> bool {
        self != Mode::Tx
    }

    fn tx(self) -> bool {
        self != Mode::Rx
    }
}

impl Cli {
    fn mode(&self) -> Mode {
        if self.tx_rx {
            Mode::TxRx
        } else if self.tx_only {
            Mode::Tx
        } else {
            Mode::Rx
        }
    }

    /// Override config file values with command-line flags
    fn apply(&self, config: &mut ToolConfig) {
        if let Some(device) = &self.device {
            config.device = Some(device.clone());
        }
        if let Some(rate) = self.rate {
            config.rate = rate;
        }
        if let Some(format) = &self.format {
            config.format = format.clone();
        }
        if let Some(sync) = &self.sync {
            config.sync = sync.clone();
        }
        if let Some(file) = &self.rx_file {
            config.rx_file = file.clone();
        }

        let floats = [
            (RX_FREQ, self.rx_freq),
            (TX_FREQ, self.tx_freq),
            (TDD_FREQ, self.tdd_freq),
            (RX_BANDWIDTH, self.rx_bandwidth),
            (TX_BANDWIDTH, self.tx_bandwidth),
        ];
        for (path, value) in floats {
            if let Some(value) = value {
                config.enable(path, value);
            }
        }
        let gains = [
            (RX_GAIN_LNA, self.rx_gain_lna),
            (RX_GAIN_PGA, self.rx_gain_pga),
            (RX_GAIN_VGA, self.rx_gain_vga),
            (TX_GAIN, self.tx_gain),
        ];
        for (path, value) in gains {
            if let Some(value) = value {
                config.enable(path, value);
            }
        }
        if let Some(path) = &self.rx_path {
            config.enable(RX_PATH, path.as_str());
        }
        if let Some(path) = &self.tx_path {
            config.enable(TX_PATH, path.as_str());
        }
    }
}

fn parse_mask(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    match parsed {
        Ok(0) => Err("channel mask selects no channels".to_string()),
        Ok(mask) => Ok(mask),
        Err(e) => Err(format!("invalid channel mask '{}': {}", s, e)),
    }
}

fn level_filter(level: u8) -> log::LevelFilter {
    match level {
        0 | 1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 | 5 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn init_logging(level: Option<u8>) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    if let Some(level) = level {
        builder.filter_level(level_filter(level));
    }
    builder.init();
}

/// Blocks needed to send a whole TX file, the last one zero-padded
fn file_blocks(file_len: u64, block_bytes: usize) -> usize {
    if block_bytes == 0 {
        return 0;
    }
    file_len.div_ceil(block_bytes as u64) as usize
}

/// Host part of a `host[@native]` format string
fn host_format(format: &str) -> Result<SampleFormat> {
    let host = format.split('@').next().unwrap_or(format);
    host.parse::<SampleFormat>()
        .with_context(|| format!("Unsupported sample format '{}'", format))
}

/// Log a failed setup step, or fail when errors are fatal
fn check<T>(result: sdrflow_core::Result<T>, what: &str, stop_on_error: bool) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if stop_on_error => Err(e).context(what.to_string()),
        Err(e) => {
            log::error!("{}: {}", what, e);
            Ok(None)
        }
    }
}

fn log_temperature(device: &Device) {
    match device.get_u64("/dm/sensor/temp") {
        Ok(raw) => log::info!("Temp = {:.1} C", raw as f64 / 256.0),
        Err(e) => log::warn!("Unable to read temperature: {}", e),
    }
}

fn log_debug(device: &Device, path: &str) {
    match device.get(path) {
        Ok(value) => log::debug!("{} = {}", path, value),
        Err(e) => log::warn!("Unable to get {}: {}", path, e),
    }
}

/// Wait for a ring slot, retrying timeouts with a warning
///
/// Returns `None` once cancelled or when the worker on the other side is gone.
fn wait_slot(
    label: &str,
    channel: usize,
    mut wait: impl FnMut() -> sdrflow_core::Result<usize>,
) -> Result<Option<usize>> {
    loop {
        match wait() {
            Ok(index) => return Ok(Some(index)),
            Err(e) if e.is_transient() => log::warn!("{}[{}] timed out!", label, channel),
            Err(Error::Cancelled | Error::Disconnected) => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("{}[{}]", label, channel)),
        }
    }
}

/// RX stream plus the producer side of its channel rings
struct RxSide {
    stream: StreamHandle,
    slots: Vec<SlotProducer>,
    underruns: u64,
}

impl RxSide {
    /// Receive one block per channel into the rings; `false` stops the loop
    fn step(&mut self, cancel: &CancelToken, iteration: usize) -> Result<bool> {
        let mut indices = Vec::with_capacity(self.slots.len());
        for (ch, slot) in self.slots.iter_mut().enumerate() {
            match wait_slot("RX Pbuffer", ch, || slot.wait(SLOT_WAIT, cancel))? {
                Some(index) => indices.push(index),
                None => return Ok(false),
            }
        }

        let received = {
            let mut buffers = self
                .slots
                .iter_mut()
                .zip(&indices)
                .map(|(slot, &index)| slot.slot_mut(index))
                .collect::<sdrflow_core::Result<Vec<_>>>()?;
            self.stream.recv(&mut buffers, RX_TIMEOUT, cancel)
        };
        let info = match received {
            Ok(info) => info,
            Err(Error::Cancelled) => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("RX error, unable to recv data, i = {}", iteration))
            }
        };
        if info.overrun {
            log::warn!("RX overrun before block {}", iteration);
        }
        if let Some(underruns) = info.tx_underruns.filter(|&n| n > self.underruns) {
            log::warn!("TX underruns: {}", underruns);
            self.underruns = underruns;
        }

        for (slot, &index) in self.slots.iter_mut().zip(&indices) {
            slot.commit(index)?;
        }
        Ok(true)
    }
}

/// TX stream plus the consumer side of its channel rings
struct TxSide {
    stream: StreamHandle,
    slots: Vec<SlotConsumer>,
    samples: usize,
    timestamps: bool,
    next: u64,
    timeout: Duration,
}

impl TxSide {
    /// Send one block per channel from the rings; `false` stops the loop
    fn step(&mut self, cancel: &CancelToken, iteration: usize) -> Result<bool> {
        let mut indices = Vec::with_capacity(self.slots.len());
        for (ch, slot) in self.slots.iter_mut().enumerate() {
            match wait_slot("TX Cbuffer", ch, || slot.wait(SLOT_WAIT, cancel))? {
                Some(index) => indices.push(index),
                None => return Ok(false),
            }
        }

        let timestamp = self.timestamps.then_some(Timestamp(self.next));
        let sent = {
            let buffers = self
                .slots
                .iter()
                .zip(&indices)
                .map(|(slot, &index)| slot.slot(index))
                .collect::<sdrflow_core::Result<Vec<_>>>()?;
            for (ch, buf) in buffers.iter().enumerate() {
                log::trace!("TX[{}] {:02x?}", ch, &buf[..buf.len().min(32)]);
            }
            self.stream.send(&buffers, self.samples, timestamp, self.timeout, cancel)
        };
        match sent {
            Ok(()) => {}
            Err(Error::Cancelled) => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("TX error, unable to send data, i = {}", iteration))
            }
        }

        for (slot, &index) in self.slots.iter_mut().zip(&indices) {
            slot.release(index)?;
        }
        self.next += self.samples as u64;
        Ok(true)
    }
}

/// Run the streaming loop, returning the number of completed iterations
fn pump(
    device: &Device,
    rx: &mut Option<RxSide>,
    tx: &mut Option<TxSide>,
    count: usize,
    resync: usize,
    cancel: &CancelToken,
) -> Result<usize> {
    let rx_only = tx.is_none();
    for i in 0..count {
        if cancel.is_cancelled() {
            return Ok(i);
        }
        if let Some(tx) = tx.as_mut() {
            if !tx.step(cancel, i)? {
                return Ok(i);
            }
        }
        if let Some(rx) = rx.as_mut() {
            if !rx.step(cancel, i)? {
                return Ok(i);
            }
            if rx_only && i == resync {
                if let Err(e) = device.set_u64("/dm/resync", 0) {
                    log::warn!("Resync failed: {}", e);
                }
            }
        }
    }
    Ok(count)
}

fn handles<'a>(rx: &'a Option<RxSide>, tx: &'a Option<TxSide>) -> Vec<&'a StreamHandle> {
    rx.iter()
        .map(|side| &side.stream)
        .chain(tx.iter().map(|side| &side.stream))
        .collect()
}

/// Join every worker, logging failures; returns the reports of the ones that finished
fn join_workers(workers: Vec<Worker>) -> Vec<WorkerReport> {
    let mut reports = Vec::with_capacity(workers.len());
    for worker in workers {
        match worker.join() {
            Ok(Ok(report)) => {
                log::info!("Channel {} worker done: {} blocks", report.channel, report.blocks);
                reports.push(report);
            }
            Ok(Err(e)) => log::error!("{:#}", e),
            Err(_) => log::error!("Worker thread panicked"),
        }
    }
    reports
}

/// Stop both streams, let the workers drain and exit, then destroy the streams
fn teardown(
    device: &Device,
    rx: &mut Option<RxSide>,
    tx: &mut Option<TxSide>,
    control: &WorkerControl,
    workers: Vec<Worker>,
) -> Result<Vec<WorkerReport>> {
    log_debug(device, "/dm/debug/rxtime");
    if let Some(side) = rx.as_mut() {
        if let Err(e) = side.stream.stop() {
            log::error!("Unable to stop RX data stream: {}", e);
        }
    }
    if let Some(side) = tx.as_mut() {
        if let Err(e) = side.stream.stop() {
            log::error!("Unable to stop TX data stream: {}", e);
        }
    }
    control.stop.store(true, Ordering::Release);

    log_debug(device, "/dm/debug/all");
    log_temperature(device);

    // Workers see their peer role go away once the rings drain
    if let Some(side) = rx.as_mut() {
        side.slots.clear();
    }
    if let Some(side) = tx.as_mut() {
        side.slots.clear();
    }
    let reports = join_workers(workers);

    if let Some(mut side) = tx.take() {
        side.stream.destroy()?;
    }
    if let Some(mut side) = rx.take() {
        side.stream.destroy()?;
    }
    Ok(reports)
}

fn run(cli: Cli) -> Result<ExitCode> {
    let core_config: CoreConfig = load_config(&default_config_path(CORE_CONFIG_FILE));
    let tool_path = cli
        .config
        .clone()
        .unwrap_or_else(|| default_config_path(TOOL_CONFIG_FILE));
    let mut tool: ToolConfig = load_config(&tool_path);
    cli.apply(&mut tool);

    if cli.discover {
        let devices = discover(tool.device.as_deref(), &core_config.sim).context("Discovery failed")?;
        log::info!("Enumerated devices {}:\n{}", devices.len(), render_device_list(&devices));
        return Ok(ExitCode::SUCCESS);
    }

    let mode = cli.mode();
    let stop_on_error = !cli.continue_on_error;
    let mut count = cli.count.unwrap_or(DEFAULT_COUNT);

    if mode.tx() {
        if let (Some(path), None, false) = (&cli.tx_file, cli.count, cli.cycle) {
            let len = std::fs::metadata(path)
                .with_context(|| format!("Unable to open TX data file {:?}", path))?
                .len();
            count = file_blocks(len, host_format(&tool.format)?.block_bytes(cli.tx_samples));
            log::info!("Sending {} block(s) from {:?}", count, path);
        }
        tool.enable_default(TX_BANDWIDTH, tool.rate);
    }
    if mode.rx() {
        tool.enable_default(RX_BANDWIDTH, tool.rate);
    }

    let device = Device::open_with_config(tool.device.as_deref(), core_config)
        .context("Unable to create device")?;

    let devices = match device.get_u64("/ll/devices") {
        Ok(n) => {
            log::info!("Devices in the array: {}", n);
            n
        }
        Err(_) => {
            log::info!("Defaulting devices to 1");
            1
        }
    };
    let mask = match cli.mask {
        Some(mask) => ChannelMask(mask),
        None => {
            if devices > 1 {
                tool.format = "ci16".to_string();
            }
            device
                .get_u64("/ll/sdr/max_sw_rx_chans")
                .map(|chans| ChannelMask::first((devices * chans) as usize))
                .unwrap_or(ChannelMask(1))
        }
    };

    if let Some(path) = &cli.refclk {
        if let Err(e) = device.set_str("/dm/sdr/refclk/path", path) {
            log::error!("Unable to set reference clock path '{}': {}", path, e);
        }
    }

    if !cli.no_init {
        if let Err(e) = device.set_u64("/dm/power/en", 1) {
            log::error!("Unable to set power: {}", e);
        }
        check(device.set_f64("/dm/rate", tool.rate), "Unable to set device rate", stop_on_error)?;
        if cli.lml != 0 {
            log::info!("Setting LML mode to {}", cli.lml);
        }
        if let Err(e) = device.set_u64("/debug/hw/lms7002m/0/rxlml", cli.lml) {
            log::warn!("Unable to set LML mode: {}", e);
        }
        log_temperature(&device);
    }

    let cancel = CancelToken::new();
    let control = WorkerControl::new(cancel.clone());
    let mut workers: Vec<Worker> = Vec::new();

    let mut rx = None;
    if mode.rx() {
        let mut stream = device
            .create_stream(RX_ENDPOINT, &tool.format, mask, cli.rx_samples, StreamFlags::NEED_TX_STAT)
            .context("Unable to initialize RX data stream")?;
        let slots = stream.take_producers()?;
        for (ch, consumer) in stream.take_consumers()?.into_iter().enumerate() {
            let path = rx_file_name(&tool.rx_file, ch);
            workers.push(spawn_disk_writer(ch, consumer, path, control.clone())?);
        }
        rx = Some(RxSide {
            stream,
            slots,
            underruns: 0,
        });
    }

    let mut tx = None;
    if mode.tx() {
        let mut stream = device
            .create_stream(TX_ENDPOINT, &tool.format, mask, cli.tx_samples, StreamFlags::NONE)
            .context("Unable to initialize TX data stream")?;
        let source = match &cli.tx_file {
            Some(path) => TxSource::File {
                path: path.clone(),
                cycle: cli.cycle,
            },
            None => TxSource::Tone {
                format: stream.host_format(),
                samples: cli.tx_samples,
            },
        };
        let slots = stream.take_consumers()?;
        for (ch, producer) in stream.take_producers()?.into_iter().enumerate() {
            workers.push(spawn_tx_source(ch, producer, source.clone(), control.clone())?);
        }
        tx = Some(TxSide {
            stream,
            slots,
            samples: cli.tx_samples,
            timestamps: !cli.no_timestamps,
            next: cli.tx_samples as u64,
            timeout: if mode == Mode::TxRx { TX_RX_TIMEOUT } else { TX_ONLY_TIMEOUT },
        });
    }

    let rx_info = rx.as_ref().map(|side| side.stream.info()).transpose()?;
    let tx_info = tx.as_ref().map(|side| side.stream.info()).transpose()?;
    log::info!(
        "Configured RX {} ({} bytes) x {} buffs  TX {} x {} buffs  ===  CH_MASK {} FMT {}",
        rx_info.map_or(0, |i| i.packet_samples),
        rx_info.map_or(0, |i| i.packet_bytes),
        rx_info.map_or(0, |i| i.channels),
        tx_info.map_or(0, |i| i.packet_bytes),
        tx_info.map_or(0, |i| i.channels),
        mask,
        tool.format
    );

    let interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        if interrupt.is_cancelled() {
            log::warn!("Interrupted again, exiting");
            std::process::exit(1);
        }
        log::info!("Interrupted, stopping");
        interrupt.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    log_debug(&device, "/dm/debug/all");

    if cli.cal_freq > 1e6 {
        if let Err(e) = device.set_u64("/dm/sync/cal/freq", cli.cal_freq as u64) {
            log::error!("Unable to set calibration frequency: {}", e);
        }
    }

    check(
        device.sync_named("off", &handles(&rx, &tx)),
        "Unable to sync data streams",
        stop_on_error,
    )?;
    if let Some(side) = rx.as_mut() {
        check(side.stream.start(None), "Unable to start RX data stream", stop_on_error)?;
    }
    if let Some(side) = tx.as_mut() {
        check(side.stream.start(None), "Unable to start TX data stream", stop_on_error)?;
    }
    check(
        device.sync_named(&tool.sync, &handles(&rx, &tx)),
        "Unable to sync data streams",
        stop_on_error,
    )?;

    if let Err(e) = device.set_u64("/dm/sdr/0/tfe/antcfg", cli.antenna) {
        log::error!("Unable to set antenna configuration parameter [{}]: {}", cli.antenna, e);
    }
    if !cli.no_init {
        if let Some(applied) = check(
            device.set_many(FRONTEND_PREFIX, &tool.params),
            "Unable to set device parameters",
            stop_on_error,
        )? {
            log::info!("Applied {} frontend parameter(s)", applied);
        }
    }

    let outcome = pump(&device, &mut rx, &mut tx, count, cli.resync, &cancel);
    if let Ok(done) = &outcome {
        log::info!("Transferred {} of {} block(s)", done, count);
    }

    teardown(&device, &mut rx, &mut tx, &control, workers)?;
    device.close()?;

    outcome?;
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdrflow_core::PropertyValue;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("dm-create").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&[]);
        assert_eq!(cli.mode(), Mode::Rx);
        assert_eq!(cli.rx_samples, 4096);
        assert_eq!(cli.tx_samples, 4096);
        assert_eq!(cli.resync, 1);
        assert!(cli.mask.is_none());
        assert!(!cli.no_timestamps);
    }

    #[test]
    fn test_modes() {
        assert_eq!(parse(&["-t"]).mode(), Mode::Tx);
        assert_eq!(parse(&["-T"]).mode(), Mode::TxRx);
        assert!(Mode::TxRx.rx() && Mode::TxRx.tx());
        assert!(!Mode::Tx.rx());
        assert!(Cli::try_parse_from(["dm-create", "-t", "-T"]).is_err());
    }

    #[test]
    fn test_short_flags() {
        let cli = parse(&[
            "-D", "sim:channels=2", "-c", "16", "-r", "1e6", "-F", "cf32", "-C", "0x3", "-S", "1024", "-O",
            "512", "-N", "-s", "1pps", "-i", "4", "-z", "-X", "-l", "5",
        ]);
        assert_eq!(cli.device.as_deref(), Some("sim:channels=2"));
        assert_eq!(cli.count, Some(16));
        assert_eq!(cli.rate, Some(1e6));
        assert_eq!(cli.mask, Some(3));
        assert_eq!((cli.rx_samples, cli.tx_samples), (1024, 512));
        assert!(cli.no_timestamps && cli.continue_on_error && cli.no_init);
        assert_eq!(cli.resync, 4);
        assert_eq!(cli.log_level, Some(5));
    }

    #[test]
    fn test_parse_mask() {
        assert_eq!(parse_mask("0x0f"), Ok(15));
        assert_eq!(parse_mask("0XF0"), Ok(0xf0));
        assert_eq!(parse_mask("5"), Ok(5));
        assert!(parse_mask("0").is_err());
        assert!(parse_mask("0xzz").is_err());
        assert!(parse_mask("three").is_err());
    }

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter(0), log::LevelFilter::Error);
        assert_eq!(level_filter(2), log::LevelFilter::Warn);
        assert_eq!(level_filter(3), log::LevelFilter::Info);
        assert_eq!(level_filter(5), log::LevelFilter::Debug);
        assert_eq!(level_filter(9), log::LevelFilter::Trace);
    }

    #[test]
    fn test_file_blocks() {
        let block = SampleFormat::Ci16.block_bytes(4096);
        assert_eq!(file_blocks(0, block), 0);
        assert_eq!(file_blocks(block as u64, block), 1);
        assert_eq!(file_blocks(block as u64 + 1, block), 2);
        assert_eq!(file_blocks(10, 0), 0);
    }

    #[test]
    fn test_host_format() {
        assert_eq!(host_format("cf32").unwrap(), SampleFormat::Cf32);
        assert_eq!(host_format("ci16@ci12").unwrap(), SampleFormat::Ci16);
        assert!(host_format("cs8").is_err());
    }

    #[test]
    fn test_apply_overrides() {
        let cli = parse(&["-e", "2.4e9", "-y", "20", "-p", "rxw", "-F", "cf32", "-f", "capture.bin"]);
        let mut config = ToolConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.format, "cf32");
        assert_eq!(config.rx_file, PathBuf::from("capture.bin"));
        let freq = config.param(RX_FREQ).unwrap();
        assert!(!freq.ignore);
        assert_eq!(freq.value, PropertyValue::F64(2.4e9));
        assert_eq!(config.param(RX_GAIN_LNA).unwrap().value, PropertyValue::U64(20));
        assert_eq!(config.param(RX_PATH).unwrap().value, PropertyValue::from("rxw"));
        // Untouched entries keep the device default
        assert!(config.param(TX_FREQ).unwrap().ignore);
    }

    #[test]
    fn test_check_continue_on_error() {
        let failed: sdrflow_core::Result<()> = Err(Error::InvalidArgument("bad".into()));
        assert!(check(failed.clone(), "step", true).is_err());
        assert_eq!(check(failed, "step", false).unwrap(), None);
        assert_eq!(check(Ok(7), "step", true).unwrap(), Some(7));
    }

    #[test]
    fn test_wait_slot_retries_timeouts() {
        let mut calls = 0;
        let index = wait_slot("RX Pbuffer", 0, || {
            calls += 1;
            if calls < 3 {
                Err(Error::Timeout("free slot"))
            } else {
                Ok(5)
            }
        })
        .unwrap();
        assert_eq!((index, calls), (Some(5), 3));
        assert_eq!(wait_slot("TX Cbuffer", 1, || Err(Error::Disconnected)).unwrap(), None);
        assert_eq!(wait_slot("TX Cbuffer", 1, || Err(Error::Cancelled)).unwrap(), None);
        assert!(wait_slot("TX Cbuffer", 1, || Err(Error::ContractViolation("bad".into()))).is_err());
    }

    fn small_rings() -> CoreConfig {
        let mut config = CoreConfig::default();
        config.ring_slots = 4;
        config
    }

    #[test]
    fn test_rx_capture_through_teardown() {
        const SAMPLES: usize = 128;
        const BLOCKS: usize = 10;
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("out.data");

        let device = Device::open_with_config(Some("sim:channels=2"), small_rings()).unwrap();
        let mut stream = device
            .create_stream(RX_ENDPOINT, "ci16", ChannelMask(0b11), SAMPLES, StreamFlags::NEED_TX_STAT)
            .unwrap();
        let cancel = CancelToken::new();
        let control = WorkerControl::new(cancel.clone());
        let slots = stream.take_producers().unwrap();
        let workers: Vec<Worker> = stream
            .take_consumers()
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(ch, consumer)| spawn_disk_writer(ch, consumer, rx_file_name(&base, ch), control.clone()).unwrap())
            .collect();
        stream.start(None).unwrap();

        let mut rx = Some(RxSide {
            stream,
            slots,
            underruns: 0,
        });
        let mut tx = None;
        assert_eq!(pump(&device, &mut rx, &mut tx, BLOCKS, 1, &cancel).unwrap(), BLOCKS);

        let reports = teardown(&device, &mut rx, &mut tx, &control, workers).unwrap();
        assert!(rx.is_none());
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.blocks == BLOCKS as u64));
        for ch in 0..2 {
            let len = std::fs::metadata(rx_file_name(&base, ch)).unwrap().len();
            assert_eq!(len, (BLOCKS * SampleFormat::Ci16.block_bytes(SAMPLES)) as u64);
        }
        device.close().unwrap();
    }

    #[test]
    fn test_tx_file_runs_to_eof() {
        const SAMPLES: usize = 64;
        let block = SampleFormat::Ci16.block_bytes(SAMPLES);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.data");
        // Two and a half blocks: the last one goes out zero-padded
        std::fs::write(&path, vec![0x11u8; block * 2 + block / 2]).unwrap();

        let mut config = small_rings();
        config.sim.tap_bytes = SampleFormat::Ci12.block_bytes(SAMPLES * 8);
        let (device, mut sim) = Device::open_sim(config).unwrap();
        let tap = sim.take_tx_tap(0).unwrap();

        let mut stream = device
            .create_stream(TX_ENDPOINT, "ci16", ChannelMask(1), SAMPLES, StreamFlags::NONE)
            .unwrap();
        let cancel = CancelToken::new();
        let control = WorkerControl::new(cancel.clone());
        let slots = stream.take_consumers().unwrap();
        let producer = stream.take_producers().unwrap().remove(0);
        let source = TxSource::File { path, cycle: false };
        let workers = vec![spawn_tx_source(0, producer, source, control.clone()).unwrap()];
        stream.start(None).unwrap();

        let mut rx = None;
        let mut tx = Some(TxSide {
            stream,
            slots,
            samples: SAMPLES,
            timestamps: true,
            next: SAMPLES as u64,
            timeout: TX_ONLY_TIMEOUT,
        });
        // More iterations than the file holds: the loop ends cleanly at EOF
        assert_eq!(pump(&device, &mut rx, &mut tx, 10, 1, &cancel).unwrap(), 3);
        assert_eq!(sim.tx_blocks(), 3);
        assert_eq!(sim.tx_underruns(), 0);
        assert_eq!(tap.slots(), SampleFormat::Ci12.block_bytes(SAMPLES * 3));

        let reports = teardown(&device, &mut rx, &mut tx, &control, workers).unwrap();
        assert_eq!(reports, vec![WorkerReport { channel: 0, blocks: 3 }]);
        device.close().unwrap();
    }
}
