//! End-to-end streaming scenarios against the simulated radio

mod common;

use std::time::Duration;

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use sdrflow_core::ring::CancelToken;
use sdrflow_core::signal::ToneGenerator;
use sdrflow_core::{
    ChannelMask, Device, SampleFormat, StreamFlags, StreamState, SyncType, Timestamp, RX_ENDPOINT,
    TX_ENDPOINT,
};

const PACKET: usize = 4096;

#[test]
fn test_rx_two_channels_ci16() {
    common::init_logging();
    let device = Device::open(Some("sim:channels=2")).unwrap();
    let mut rx = device
        .create_stream(RX_ENDPOINT, "ci16", ChannelMask(0b11), PACKET, StreamFlags::NONE)
        .unwrap();

    let info = rx.info().unwrap();
    assert_eq!(info.channels, 2);
    assert_eq!(info.packet_bytes, 16384);

    rx.start(None).unwrap();
    let cancel = CancelToken::new();
    let mut a = vec![0u8; info.packet_bytes];
    let mut b = vec![0u8; info.packet_bytes];
    let mut last: Option<Timestamp> = None;
    let mut total = [0usize; 2];

    for _ in 0..128 {
        let recv = rx
            .recv(
                &mut [a.as_mut_slice(), b.as_mut_slice()],
                Duration::from_millis(2250),
                &cancel,
            )
            .unwrap();
        assert_eq!(recv.samples, PACKET);
        let ts = recv.timestamp.unwrap();
        if let Some(prev) = last {
            assert!(ts >= prev);
            assert_eq!(ts.samples() - prev.samples(), PACKET as u64);
        }
        last = Some(ts);
        total[0] += SampleFormat::Ci16.block_bytes(recv.samples);
        total[1] += SampleFormat::Ci16.block_bytes(recv.samples);
    }

    assert_eq!(total, [128 * 16384, 128 * 16384]);
    // Tone data, not silence
    assert!(a.iter().any(|&x| x != 0));
    assert!(b.iter().any(|&x| x != 0));
    assert_ne!(a, b);

    rx.stop().unwrap();
    assert_eq!(rx.stats().unwrap().blocks, 128);
    rx.destroy().unwrap();
    device.close().unwrap();
}

#[test]
fn test_tx_tone_spectrum() {
    common::init_logging();
    const BLOCKS: usize = 100;
    const TONE: f64 = 0.02;

    let tap_bytes = SampleFormat::Ci12.block_bytes(PACKET * BLOCKS);
    let (device, mut probe) = Device::open_sim(common::sim_config(tap_bytes)).unwrap();
    let mut tap = probe.take_tx_tap(0).unwrap();

    let mut tx = device
        .create_stream(TX_ENDPOINT, "cf32", ChannelMask(1), PACKET, StreamFlags::NONE)
        .unwrap();
    device.sync(SyncType::All, &[&tx]).unwrap();
    tx.start(None).unwrap();

    let cancel = CancelToken::new();
    let mut tone = ToneGenerator::new(TONE, 0.7);
    let mut block = vec![0u8; SampleFormat::Cf32.block_bytes(PACKET)];
    for n in 0..BLOCKS {
        tone.fill_bytes(SampleFormat::Cf32, &mut block, PACKET).unwrap();
        let ts = Timestamp((n * PACKET) as u64);
        tx.send(&[block.as_slice()], PACKET, Some(ts), Duration::from_millis(32250), &cancel)
            .unwrap();
    }
    assert_eq!(probe.tx_underruns(), 0);
    assert_eq!(probe.tx_blocks(), BLOCKS as u64);

    let captured = common::decode_ci12(&common::drain_tap(&mut tap));
    assert_eq!(captured.len(), PACKET * BLOCKS);

    let mut spectrum: Vec<Complex<f32>> = captured.iter().map(|s| Complex::new(s.i, s.q)).collect();
    let len = spectrum.len();
    FftPlanner::<f32>::new().plan_fft_forward(len).process(&mut spectrum);

    let peak = spectrum
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.norm_sqr().total_cmp(&b.1.norm_sqr()))
        .map(|(bin, _)| bin)
        .unwrap();
    let expected = TONE * len as f64;
    assert!(
        (peak as f64 - expected).abs() <= 1.0,
        "peak at bin {}, expected {}",
        peak,
        expected
    );

    tx.destroy().unwrap();
}

#[test]
fn test_sync_off_then_1pps() {
    common::init_logging();
    let device = Device::open(Some("sim:rate=1e6")).unwrap();
    let mut rx = device
        .create_stream(RX_ENDPOINT, "ci16", ChannelMask(1), PACKET, StreamFlags::NEED_TX_STAT)
        .unwrap();
    let mut tx = device
        .create_stream(TX_ENDPOINT, "ci16", ChannelMask(1), PACKET, StreamFlags::NONE)
        .unwrap();

    device.sync_named("off", &[&rx, &tx]).unwrap();
    device.sync_named("1pps", &[&rx, &tx]).unwrap();
    rx.start(None).unwrap();
    tx.start(None).unwrap();
    assert_eq!(rx.state(), StreamState::Running);
    assert_eq!(tx.state(), StreamState::Running);

    let cancel = CancelToken::new();
    let timeout = Duration::from_millis(15250);
    let mut rx_buf = vec![0u8; SampleFormat::Ci16.block_bytes(PACKET)];
    let tx_buf = vec![0u8; SampleFormat::Ci16.block_bytes(PACKET)];

    let first = rx.recv(&mut [rx_buf.as_mut_slice()], timeout, &cancel).unwrap();
    let ts = first.timestamp.unwrap();
    assert_eq!(ts.samples() % 1_000_000, 0);
    assert_eq!(first.tx_underruns, Some(0));

    // Schedule TX a few packets ahead of RX, as a TX+RX loop does
    let lead = 4 * PACKET as u64;
    for n in 0..8u64 {
        let at = ts.offset(lead + n * PACKET as u64);
        tx.send(&[tx_buf.as_slice()], PACKET, Some(at), timeout, &cancel).unwrap();
        rx.recv(&mut [rx_buf.as_mut_slice()], timeout, &cancel).unwrap();
    }
    assert_eq!(tx.stats().unwrap().late, 0);

    // A timestamp behind device time is rejected verbatim
    let late = tx.send(&[tx_buf.as_slice()], PACKET, Some(ts), timeout, &cancel);
    assert!(matches!(late, Err(sdrflow_core::Error::Backend { .. })));

    tx.destroy().unwrap();
    rx.destroy().unwrap();
    device.close().unwrap();
}
