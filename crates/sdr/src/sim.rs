// Copyright 2025-2026 CEMAXECUTER LLC

//! Simulated tuner backend: deterministic byte patterns instead of
//! hardware, for offline runs and the test suite.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::{Tuner, TunerDriver};

/// Simulated driver. Channels map to the same `1000 + index` serial
/// convention as the hardware chassis.
pub struct SimDriver {
    num_ch: usize,
    fill: u8,
    pace: Duration,
    injects: Mutex<Vec<Option<(usize, u8)>>>,
    opened: Mutex<Vec<Option<Arc<SimTuner>>>>,
}

impl SimDriver {
    pub fn new(num_ch: usize) -> Self {
        Self {
            num_ch,
            fill: 0x10,
            pace: Duration::from_micros(500),
            injects: Mutex::new(vec![None; num_ch]),
            opened: Mutex::new(vec![None; num_ch]),
        }
    }

    /// Byte every simulated sample is filled with.
    pub fn with_fill(mut self, fill: u8) -> Self {
        self.fill = fill;
        self
    }

    /// Delay between delivered blocks.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    /// Overwrite one byte of every block channel `ch` produces. Takes
    /// effect for tuners opened afterwards.
    pub fn inject(&self, ch: usize, offset: usize, value: u8) {
        self.injects.lock().unwrap()[ch] = Some((offset, value));
    }

    /// The tuner opened for channel `ch`, if any.
    pub fn tuner(&self, ch: usize) -> Option<Arc<SimTuner>> {
        self.opened.lock().unwrap()[ch].clone()
    }
}

impl TunerDriver for SimDriver {
    fn open_by_serial(&self, serial: &str) -> Result<Arc<dyn Tuner>, String> {
        let ch = serial
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1000))
            .filter(|&ch| ch < self.num_ch)
            .ok_or_else(|| format!("no simulated device with serial {}", serial))?;

        let (script_tx, script_rx) = unbounded();
        let tuner = Arc::new(SimTuner {
            fill: self.fill,
            pace: self.pace,
            inject: self.injects.lock().unwrap()[ch],
            center_freq: AtomicU32::new(0),
            sample_rate: AtomicU32::new(0),
            gain: AtomicI32::new(0),
            gpio: Mutex::new([false; 8]),
            cancelled: AtomicBool::new(false),
            cancel_count: AtomicU32::new(0),
            script_tx,
            script_rx,
        });
        self.opened.lock().unwrap()[ch] = Some(tuner.clone());
        log::info!("simulated tuner opened (serial={})", serial);
        Ok(tuner)
    }
}

/// One simulated tuner. Control calls record their arguments so tests can
/// inspect the state the engine left the device in.
pub struct SimTuner {
    fill: u8,
    pace: Duration,
    inject: Option<(usize, u8)>,
    center_freq: AtomicU32,
    sample_rate: AtomicU32,
    gain: AtomicI32,
    gpio: Mutex<[bool; 8]>,
    cancelled: AtomicBool,
    cancel_count: AtomicU32,
    script_tx: Sender<Vec<u8>>,
    script_rx: Receiver<Vec<u8>>,
}

impl SimTuner {
    /// Queue one block to be delivered in place of the fill pattern.
    pub fn queue_block(&self, block: Vec<u8>) {
        let _ = self.script_tx.send(block);
    }

    pub fn gain(&self) -> i32 {
        self.gain.load(Ordering::SeqCst)
    }

    pub fn gpio_state(&self, gpio: u8) -> bool {
        self.gpio.lock().unwrap()[gpio as usize]
    }

    /// Times the engine cancelled the asynchronous read.
    pub fn cancel_count(&self) -> u32 {
        self.cancel_count.load(Ordering::SeqCst)
    }
}

impl Tuner for SimTuner {
    fn set_dithering(&self, _enable: bool) -> Result<(), String> {
        Ok(())
    }

    fn set_agc(&self, _enable: bool) -> Result<(), String> {
        Ok(())
    }

    fn set_center_freq(&self, freq_hz: u32) -> Result<(), String> {
        self.center_freq.store(freq_hz, Ordering::SeqCst);
        Ok(())
    }

    fn center_freq(&self) -> u32 {
        self.center_freq.load(Ordering::SeqCst)
    }

    fn set_tuner_gain(&self, gain: i32) -> Result<(), String> {
        self.gain.store(gain, Ordering::SeqCst);
        Ok(())
    }

    fn set_sample_rate(&self, rate_hz: u32) -> Result<(), String> {
        self.sample_rate.store(rate_hz, Ordering::SeqCst);
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::SeqCst)
    }

    fn set_gpio(&self, gpio: u8, on: bool) -> Result<(), String> {
        self.gpio.lock().unwrap()[gpio as usize] = on;
        Ok(())
    }

    fn reset_buffer(&self) -> Result<(), String> {
        Ok(())
    }

    fn read_async(
        &self,
        _num_buffers: u32,
        buf_len: usize,
        on_buf: &mut dyn FnMut(&[u8]),
    ) -> Result<(), String> {
        let mut template = vec![self.fill; buf_len];
        if let Some((offset, value)) = self.inject {
            if offset < buf_len {
                template[offset] = value;
            }
        }
        // swap-consume so a cancel posted just before entry is not lost
        while !self.cancelled.swap(false, Ordering::SeqCst) {
            match self.script_rx.try_recv() {
                Ok(mut block) => {
                    block.resize(buf_len, self.fill);
                    on_buf(&block);
                }
                Err(_) => on_buf(&template),
            }
            thread::sleep(self.pace);
        }
        Ok(())
    }

    fn cancel_async(&self) -> Result<(), String> {
        self.cancel_count.fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }
}
