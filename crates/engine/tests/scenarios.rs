//! End-to-end acquisition scenarios against the simulated tuner backend:
//! the full producer / barrier / alignment path, with the emitted stream
//! parsed back through the header layout.

use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cmrx_engine::acquisition::{AcquisitionEngine, Shared};
use cmrx_engine::config::Config;
use cmrx_engine::control::{apply, Command};
use cmrx_frame::{
    IqHeader, FRAME_TYPE_CAL, FRAME_TYPE_DATA, FRAME_TYPE_DUMMY, HEADER_VERSION, SYNC_WORD,
};
use cmrx_sdr::sim::SimDriver;
use cmrx_sdr::{Tuner, TunerDriver};

const NUM_CH: usize = 4;
const DAQ_BUFFER_SIZE: usize = 1024;
const BUFFER_SIZE: usize = DAQ_BUFFER_SIZE * 2;
const TIMEOUT: Duration = Duration::from_secs(10);

fn test_config() -> Config {
    Config {
        num_ch: NUM_CH,
        hw_name: "simulated".to_string(),
        unit_id: 1,
        ioo_type: 0,
        daq_buffer_size: DAQ_BUFFER_SIZE,
        sample_rate: 2_400_000,
        center_freq: 433_000_000,
        gain: 496,
        en_noise_source_ctr: true,
        ctr_channel_serial_no: 1000,
        aux_ctr_channel: 7,
        log_level: 2,
    }
}

/// `Write` sink the test can snapshot while the engine is running.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn snapshot(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Frame {
    header: IqHeader,
    payloads: Vec<Vec<u8>>,
}

/// Split a stream snapshot into complete frames; a trailing partial frame
/// is dropped.
fn parse_stream(bytes: &[u8]) -> Vec<Frame> {
    let mut cursor = Cursor::new(bytes);
    let mut frames = Vec::new();
    loop {
        let header = match IqHeader::read_from(&mut cursor) {
            Ok(h) => h,
            Err(_) => break,
        };
        let mut payloads = Vec::new();
        if header.frame_type != FRAME_TYPE_DUMMY {
            let mut complete = true;
            for _ in 0..NUM_CH {
                let mut payload = vec![0u8; BUFFER_SIZE];
                if std::io::Read::read_exact(&mut cursor, &mut payload).is_err() {
                    complete = false;
                    break;
                }
                payloads.push(payload);
            }
            if !complete {
                break;
            }
        }
        frames.push(Frame { header, payloads });
    }
    frames
}

struct Rig {
    driver: SimDriver,
    shared: Arc<Shared>,
    buf: SharedBuf,
    engine_thread: JoinHandle<Result<(), String>>,
}

impl Rig {
    fn start(cfg: Config, driver: SimDriver) -> Rig {
        let tuners: Vec<Arc<dyn Tuner>> = (0..cfg.num_ch)
            .map(|i| driver.open_by_serial(&format!("{}", 1000 + i)).unwrap())
            .collect();
        let mut engine = AcquisitionEngine::new(cfg, tuners, 0);
        let shared = engine.shared();
        let buf = SharedBuf::default();
        let mut out = buf.clone();
        engine.start().unwrap();
        let engine_thread = thread::spawn(move || engine.run(&mut out));
        Rig {
            driver,
            shared,
            buf,
            engine_thread,
        }
    }

    /// Block until the stream holds at least `n` complete frames.
    fn wait_frames(&self, n: usize) -> Vec<Frame> {
        self.wait_until(|frames| frames.len() >= n)
    }

    /// Block until the parsed stream satisfies `pred`.
    fn wait_until(&self, pred: impl Fn(&[Frame]) -> bool) -> Vec<Frame> {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let frames = parse_stream(&self.buf.snapshot());
            if pred(&frames) {
                return frames;
            }
            assert!(Instant::now() < deadline, "timed out waiting on the stream");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Block until a quiesce interval has started and at least `after`
    /// frames follow its first DUMMY frame.
    fn wait_past_quiesce(&self, after: usize) -> Vec<Frame> {
        self.wait_until(|frames| {
            frames
                .iter()
                .position(|f| f.header.frame_type == FRAME_TYPE_DUMMY)
                .map_or(false, |d| frames.len() >= d + after)
        })
    }

    /// Halt through the control path and return the final stream.
    fn halt(self) -> (SimDriver, Vec<Frame>) {
        apply(&self.shared, Command::Halt);
        self.engine_thread
            .join()
            .expect("engine thread panicked")
            .expect("engine returned an error");
        let frames = parse_stream(&self.buf.snapshot());
        (self.driver, frames)
    }
}

/// Frame-stream invariants that hold for every run.
fn assert_stream_invariants(frames: &[Frame]) {
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.header.sync_word, SYNC_WORD);
        assert_eq!(frame.header.header_version, HEADER_VERSION);
        assert_eq!(frame.header.daq_block_index, i as u32, "gap in block indices");
        if frame.header.frame_type == FRAME_TYPE_DUMMY {
            assert_eq!(frame.header.cpi_length, 0);
            assert_eq!(frame.header.data_type, 0);
            assert!(frame.payloads.is_empty());
        } else {
            assert_eq!(frame.header.cpi_length, DAQ_BUFFER_SIZE as u32);
            assert_eq!(frame.header.data_type, 1);
            assert_eq!(frame.payloads.len(), NUM_CH);
            for payload in &frame.payloads {
                assert_eq!(payload.len(), BUFFER_SIZE);
            }
        }
    }
}

#[test]
fn test_constant_pattern_stream() {
    let rig = Rig::start(test_config(), SimDriver::new(NUM_CH));
    rig.wait_frames(3);
    let (_driver, frames) = rig.halt();

    assert_stream_invariants(&frames);
    assert!(frames.len() >= 3);

    let first = &frames[0];
    assert_eq!(first.header.daq_block_index, 0);
    assert_eq!(first.header.frame_type, FRAME_TYPE_DATA);
    assert_eq!(first.header.adc_overdrive_flags, 0);
    assert_eq!(first.header.active_ant_chs, NUM_CH as u32);
    assert_eq!(first.header.rf_center_freq, 433_000_000);
    for payload in &first.payloads {
        assert!(payload.iter().all(|&b| b == 0x10));
    }
    for ch in 0..NUM_CH {
        assert_eq!(first.header.if_gains[ch], 496);
    }
}

#[test]
fn test_overdrive_flags_saturated_channel() {
    let driver = SimDriver::new(NUM_CH);
    // Channel 2 saturates: one 0xff byte per block.
    driver.inject(2, 17, 0xff);
    let rig = Rig::start(test_config(), driver);
    rig.wait_frames(3);
    let (_driver, frames) = rig.halt();

    assert_stream_invariants(&frames);
    for frame in &frames {
        assert_eq!(frame.header.adc_overdrive_flags, 0b0100);
    }
}

#[test]
fn test_noise_source_quiesce_then_cal() {
    let rig = Rig::start(test_config(), SimDriver::new(NUM_CH));
    rig.wait_frames(3);

    apply(&rig.shared, Command::NoiseOn);
    rig.wait_past_quiesce(10);
    let (driver, frames) = rig.halt();

    assert_stream_invariants(&frames);
    let first_dummy = frames
        .iter()
        .position(|f| f.header.frame_type == FRAME_TYPE_DUMMY)
        .expect("no quiesce interval after noise-on");
    for frame in &frames[first_dummy..first_dummy + 8] {
        assert_eq!(frame.header.frame_type, FRAME_TYPE_DUMMY);
        assert!(frame.payloads.is_empty());
    }
    assert_eq!(frames[first_dummy + 8].header.frame_type, FRAME_TYPE_CAL);
    for frame in &frames[first_dummy..] {
        assert_eq!(frame.header.noise_source_state, 1);
    }
    for frame in &frames[..first_dummy] {
        assert_eq!(frame.header.noise_source_state, 0);
    }
    // The control channel GPIO was driven.
    assert!(driver.tuner(0).unwrap().gpio_state(0));
}

#[test]
fn test_retune_applies_after_quiesce() {
    let rig = Rig::start(test_config(), SimDriver::new(NUM_CH));
    rig.wait_frames(3);

    apply(
        &rig.shared,
        Command::Retune {
            center_freq: 868_000_000,
        },
    );
    rig.wait_past_quiesce(10);
    let (driver, frames) = rig.halt();

    assert_stream_invariants(&frames);
    let first_dummy = frames
        .iter()
        .position(|f| f.header.frame_type == FRAME_TYPE_DUMMY)
        .expect("no quiesce interval after retune");
    for frame in &frames[first_dummy..first_dummy + 8] {
        assert_eq!(frame.header.frame_type, FRAME_TYPE_DUMMY);
    }
    // From the first post-quiesce frame on, the header carries the
    // driver-reported readback of the new frequency.
    for frame in &frames[first_dummy + 8..] {
        assert_eq!(frame.header.rf_center_freq, 868_000_000);
    }
    for ch in 0..NUM_CH {
        assert_eq!(driver.tuner(ch).unwrap().center_freq(), 868_000_000);
    }
}

#[test]
fn test_regain_applies_per_channel() {
    let rig = Rig::start(test_config(), SimDriver::new(NUM_CH));
    rig.wait_frames(3);

    let gains = vec![0, 87, 496, 207];
    apply(
        &rig.shared,
        Command::Regain {
            gains: gains.clone(),
        },
    );
    rig.wait_past_quiesce(10);
    let (driver, frames) = rig.halt();

    assert_stream_invariants(&frames);
    let first_dummy = frames
        .iter()
        .position(|f| f.header.frame_type == FRAME_TYPE_DUMMY)
        .expect("no quiesce interval after regain");
    for frame in &frames[first_dummy + 8..] {
        for (ch, &gain) in gains.iter().enumerate() {
            assert_eq!(frame.header.if_gains[ch], gain as u32);
        }
    }
    for (ch, &gain) in gains.iter().enumerate() {
        assert_eq!(driver.tuner(ch).unwrap().gain(), gain);
    }
}

#[test]
fn test_halt_cancels_and_joins_every_producer() {
    let rig = Rig::start(test_config(), SimDriver::new(NUM_CH));
    rig.wait_frames(2);
    let (driver, frames) = rig.halt();

    assert_stream_invariants(&frames);
    assert!(frames.len() >= 2);
    for ch in 0..NUM_CH {
        assert!(driver.tuner(ch).unwrap().cancel_count() >= 1);
    }
}

#[test]
fn test_reconfigure_all_reinitializes_producers() {
    let rig = Rig::start(test_config(), SimDriver::new(NUM_CH));
    let steady = rig.wait_frames(3).len();

    apply(
        &rig.shared,
        Command::Reconfigure {
            center_freq: 100_000_000,
            sample_rate: 1_200_000,
            gain: 297,
        },
    );
    // Producers cancel, re-initialize and re-enter the barrier; the
    // stream continues with the new tuning.
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let frames = parse_stream(&rig.buf.snapshot());
        let retuned = frames
            .iter()
            .any(|f| f.header.rf_center_freq == 100_000_000 && f.header.if_gains[0] == 297);
        if retuned && frames.len() > steady + 9 {
            break;
        }
        assert!(Instant::now() < deadline, "stream never picked up the new tuning");
        thread::sleep(Duration::from_millis(1));
    }
    let (driver, frames) = rig.halt();

    assert_stream_invariants(&frames);
    for ch in 0..NUM_CH {
        let tuner = driver.tuner(ch).unwrap();
        // Once for the reconfigure, once at shutdown.
        assert!(tuner.cancel_count() >= 2);
        assert_eq!(tuner.center_freq(), 100_000_000);
        assert_eq!(tuner.sample_rate(), 1_200_000);
        assert_eq!(tuner.gain(), 297);
    }
}
