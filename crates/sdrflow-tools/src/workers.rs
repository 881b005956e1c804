//! Per-channel worker threads
//!
//! RX channels get a disk writer draining the channel ring into a file. TX
//! channels get either a disk reader or a tone generator filling the ring.
//! Workers poll their ring with a short timeout so they notice the shared
//! stop flag, and exit on their own once the peer role is dropped.

use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};

use sdrflow_core::ring::{CancelToken, SlotConsumer, SlotProducer};
use sdrflow_core::signal::ToneGenerator;
use sdrflow_core::{Error, SampleFormat, FULL_SCALE};

/// Poll interval of worker ring waits
const WORKER_POLL: Duration = Duration::from_millis(100);

/// Start phase and step (cycles per sample) of the first generator channels
const TONES: [(f64, f64); 4] = [(0.0, 1.0 / 3.0), (0.5, 0.02), (0.25, 0.03), (0.125, 0.04)];

/// Shared control for all worker threads
#[derive(Clone)]
pub struct WorkerControl {
    pub stop: Arc<AtomicBool>,
    pub cancel: CancelToken,
}

impl WorkerControl {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            cancel,
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }
}

/// What a worker did before it exited
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub channel: usize,
    pub blocks: u64,
}

pub type Worker = JoinHandle<Result<WorkerReport>>;

/// Where TX samples come from
#[derive(Debug, Clone)]
pub enum TxSource {
    File { path: PathBuf, cycle: bool },
    Tone { format: SampleFormat, samples: usize },
}

/// Capture file of RX channel `channel`: `<base>` for channel 0, `<base>.<n>` otherwise
pub fn rx_file_name(base: &Path, channel: usize) -> PathBuf {
    if channel == 0 {
        base.to_path_buf()
    } else {
        let mut name = base.as_os_str().to_owned();
        name.push(format!(".{}", channel));
        PathBuf::from(name)
    }
}

/// Tone of generator channel `channel`
pub fn channel_tone(channel: usize, format: SampleFormat) -> ToneGenerator {
    let amplitude = match format {
        SampleFormat::Cf32 => 1.0,
        _ => 30000.0 / FULL_SCALE,
    };
    let (phase, step) = TONES
        .get(channel)
        .copied()
        .unwrap_or((0.0, 0.01 * (channel + 1) as f64));
    ToneGenerator::new(step, amplitude).with_phase(phase)
}

/// Spawn a disk writer for RX channel `channel`
pub fn spawn_disk_writer(
    channel: usize,
    mut consumer: SlotConsumer,
    path: PathBuf,
    control: WorkerControl,
) -> Result<Worker> {
    let file = File::create(&path).with_context(|| format!("Unable to create RX data file {:?}", path))?;
    let mut out = BufWriter::new(file);

    thread::Builder::new()
        .name(format!("rx-writer-{}", channel))
        .spawn(move || {
            let mut report = WorkerReport { channel, blocks: 0 };
            // Not tied to Ctrl-C: committed blocks are still written out
            let never = CancelToken::new();
            loop {
                let index = match consumer.wait(WORKER_POLL, &never) {
                    Ok(index) => index,
                    Err(e) if e.is_transient() && control.stopped() => break,
                    Err(e) if e.is_transient() => continue,
                    Err(Error::Disconnected) => break,
                    Err(e) => return Err(e).context(format!("RX writer {}", channel)),
                };
                let data = consumer.slot(index)?;
                out.write_all(data)
                    .with_context(|| format!("Can't write {} bytes to {:?}", data.len(), path))?;
                consumer.release(index)?;
                report.blocks += 1;
            }
            out.flush().with_context(|| format!("Failed to flush {:?}", path))?;
            log::debug!("RX writer {} done after {} blocks", channel, report.blocks);
            Ok(report)
        })
        .context("Unable to start RX writer thread")
}

/// Spawn a TX source for channel `channel`
pub fn spawn_tx_source(
    channel: usize,
    producer: SlotProducer,
    source: TxSource,
    control: WorkerControl,
) -> Result<Worker> {
    let builder = thread::Builder::new().name(format!("tx-source-{}", channel));
    match source {
        TxSource::File { path, cycle } => {
            let file = File::open(&path).with_context(|| format!("Unable to open TX data file {:?}", path))?;
            builder
                .spawn(move || disk_read(channel, producer, file, path, cycle, control))
                .context("Unable to start TX reader thread")
        }
        TxSource::Tone { format, samples } => builder
            .spawn(move || tone(channel, producer, format, samples, control))
            .context("Unable to start TX generator thread"),
    }
}

fn next_free(producer: &mut SlotProducer, control: &WorkerControl) -> Result<Option<usize>> {
    loop {
        match producer.wait(WORKER_POLL, &control.cancel) {
            Ok(index) => return Ok(Some(index)),
            Err(e) if e.is_transient() && control.stopped() => return Ok(None),
            Err(e) if e.is_transient() => continue,
            Err(Error::Disconnected | Error::Cancelled) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}

fn tone(
    channel: usize,
    mut producer: SlotProducer,
    format: SampleFormat,
    samples: usize,
    control: WorkerControl,
) -> Result<WorkerReport> {
    let mut generator = channel_tone(channel, format);
    let mut report = WorkerReport { channel, blocks: 0 };
    log::debug!(
        "TX generator {}: {} cycles/sample, phase {}",
        channel,
        generator.step(),
        generator.phase()
    );

    while let Some(index) = next_free(&mut producer, &control)? {
        generator.fill_bytes(format, producer.slot_mut(index)?, samples)?;
        producer.commit(index)?;
        report.blocks += 1;
    }
    Ok(report)
}

/// Fill `buf` from `file`, returning the bytes read (short only at end of file)
fn read_block(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn disk_read(
    channel: usize,
    mut producer: SlotProducer,
    mut file: File,
    path: PathBuf,
    cycle: bool,
    control: WorkerControl,
) -> Result<WorkerReport> {
    let mut report = WorkerReport { channel, blocks: 0 };

    while let Some(index) = next_free(&mut producer, &control)? {
        let slot = producer.slot_mut(index)?;
        let mut read = read_block(&mut file, slot).with_context(|| format!("Can't read {:?}", path))?;
        if read == 0 && cycle && report.blocks > 0 {
            file.seek(SeekFrom::Start(0))
                .with_context(|| format!("Can't rewind {:?}", path))?;
            read = read_block(&mut file, slot).with_context(|| format!("Can't read {:?}", path))?;
        }
        if read == 0 {
            log::info!("TX from file finished, EOF was reached");
            break;
        }
        // Pad the last partial block with silence
        slot[read..].fill(0);
        log::debug!("Read {} bytes to TX", read);

        producer.commit(index)?;
        report.blocks += 1;
    }
    Ok(report)
}
