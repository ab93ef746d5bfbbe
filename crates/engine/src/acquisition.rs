//! The acquisition engine: one producer thread per tuner feeding a ring
//! bank, and the alignment loop that releases a frame only when every
//! channel has produced a matching block.

use std::io::Write;
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use cmrx_frame::{IqHeader, FRAME_TYPE_CAL, FRAME_TYPE_DATA, FRAME_TYPE_DUMMY};
use cmrx_sdr::Tuner;

use crate::config::Config;
use crate::ring::Ring;

/// Transfer buffers handed to the driver's asynchronous read.
pub const ASYNC_BUF_COUNT: u32 = 12;

/// Frames emitted as DUMMY after any control command, while the RF path
/// settles.
pub const QUIESCE_FRAMES: u32 = 8;

/// Per-channel tuning parameters. The control plane mutates them; the
/// producer reads them during (re)initialization and writes back the
/// driver-reported center frequency.
#[derive(Debug, Clone, Copy)]
pub struct TuningState {
    pub center_freq: u32,
    pub sample_rate: u32,
    pub gain: i32,
}

/// Control-plane state guarded by the alignment mutex.
#[derive(Debug)]
pub struct ControlState {
    pub tuning: Vec<TuningState>,
    pub exit: bool,
    /// Deprecated reconfigure-all path: forces every producer through a
    /// cancel / re-init / re-barrier cycle.
    pub retune_all: bool,
    pub new_center_freq: Option<u32>,
    pub new_gains: Option<Vec<i32>>,
    pub noise_source_on: bool,
    pub dummy_frames: bool,
    pub dummy_frame_cntr: u32,
}

impl ControlState {
    /// Idle state: nothing pending, noise source off, no quiesce.
    pub fn new(tuning: Vec<TuningState>) -> Self {
        Self {
            tuning,
            exit: false,
            retune_all: false,
            new_center_freq: None,
            new_gains: None,
            noise_source_on: false,
            dummy_frames: false,
            dummy_frame_cntr: 0,
        }
    }
}

/// The alignment mutex/condvar pair shared by the producers, the control
/// reader and the alignment loop.
pub struct Shared {
    pub state: Mutex<ControlState>,
    pub cond: Condvar,
}

impl Shared {
    /// Request a cooperative shutdown and wake the alignment loop.
    pub fn request_exit(&self) {
        self.state.lock().unwrap().exit = true;
        self.cond.notify_all();
    }
}

/// One receiver channel: its tuner handle and its slice of the ring bank.
pub struct Channel {
    pub index: usize,
    pub tuner: Arc<dyn Tuner>,
    pub ring: Ring,
}

/// Producer body: bring the device to a known state, rendezvous with the
/// other channels, then stream until cancelled. A cancel with the exit
/// flag clear (the deprecated reconfigure path) loops back through
/// initialization and the barrier.
fn producer_loop(
    chan: Arc<Channel>,
    shared: Arc<Shared>,
    barrier: Arc<Barrier>,
    buffer_size: usize,
) {
    log::info!("initializing tuner, channel {}", chan.index);
    if let Err(e) = chan.tuner.set_dithering(false) {
        log::error!("channel {}: failed to disable dithering: {}", chan.index, e);
    }
    if let Err(e) = chan.tuner.set_agc(false) {
        log::error!("channel {}: failed to disable AGC: {}", chan.index, e);
    }

    loop {
        let tuning = {
            let st = shared.state.lock().unwrap();
            if st.exit {
                break;
            }
            st.tuning[chan.index]
        };

        if let Err(e) = chan.tuner.set_center_freq(tuning.center_freq) {
            log::error!("channel {}: failed to set center frequency: {}", chan.index, e);
        }
        {
            let mut st = shared.state.lock().unwrap();
            st.tuning[chan.index].center_freq = chan.tuner.center_freq();
        }
        if let Err(e) = chan.tuner.set_tuner_gain(tuning.gain) {
            log::error!("channel {}: failed to set gain: {}", chan.index, e);
        }
        if let Err(e) = chan.tuner.set_sample_rate(tuning.sample_rate) {
            log::error!("channel {}: failed to set sample rate: {}", chan.index, e);
        }
        if let Err(e) = chan.tuner.set_gpio(0, false) {
            log::error!("channel {}: failed to clear noise source GPIO: {}", chan.index, e);
        }
        if let Err(e) = chan.tuner.reset_buffer() {
            log::error!("channel {}: failed to reset receiver buffer: {}", chan.index, e);
        }
        log::info!("channel {} initialized", chan.index);
        if chan.index == 0 {
            log::info!("exact sample rate: {} Hz", chan.tuner.sample_rate());
            log::info!("exact center frequency: {} Hz", chan.tuner.center_freq());
        }

        // Asynchronous reads across all channels must begin in the same
        // tight window; this is the precondition for phase coherence.
        barrier.wait();

        let result = chan.tuner.read_async(ASYNC_BUF_COUNT, buffer_size, &mut |buf| {
            chan.ring.push(buf);
            shared.cond.notify_one();
        });
        if let Err(e) = result {
            log::error!("channel {}: async read terminated: {}", chan.index, e);
        }
    }
}

/// Owns the channels, the alignment mutex/condvar and the reusable frame
/// header; drives the whole acquisition from `run`.
pub struct AcquisitionEngine {
    cfg: Config,
    ctr_channel: usize,
    shared: Arc<Shared>,
    channels: Vec<Arc<Channel>>,
    header: IqHeader,
    scratch: Vec<Vec<u8>>,
    emit_index: u64,
    last_noise_state: bool,
    producers: Vec<JoinHandle<()>>,
}

impl AcquisitionEngine {
    /// Build the engine around opened tuners. `ctr_channel` is the
    /// logical channel whose GPIO drives the shared noise source.
    pub fn new(cfg: Config, tuners: Vec<Arc<dyn Tuner>>, ctr_channel: usize) -> AcquisitionEngine {
        let buffer_size = cfg.buffer_size();
        let tuning = vec![
            TuningState {
                center_freq: cfg.center_freq,
                sample_rate: cfg.sample_rate,
                gain: cfg.gain,
            };
            tuners.len()
        ];
        let channels: Vec<Arc<Channel>> = tuners
            .into_iter()
            .enumerate()
            .map(|(index, tuner)| {
                Arc::new(Channel {
                    index,
                    tuner,
                    ring: Ring::new(buffer_size),
                })
            })
            .collect();
        let shared = Arc::new(Shared {
            state: Mutex::new(ControlState::new(tuning)),
            cond: Condvar::new(),
        });
        let header = Self::static_header(&cfg, channels.len());
        let scratch = (0..channels.len()).map(|_| vec![0u8; buffer_size]).collect();

        AcquisitionEngine {
            cfg,
            ctr_channel,
            shared,
            channels,
            header,
            scratch,
            emit_index: 0,
            last_noise_state: false,
            producers: Vec::new(),
        }
    }

    /// Fill the header fields that never change after startup. The rest
    /// stays zero for the downstream stages.
    fn static_header(cfg: &Config, num_ch: usize) -> IqHeader {
        let mut h = IqHeader::new();
        h.sync_word = cmrx_frame::SYNC_WORD;
        h.header_version = cmrx_frame::HEADER_VERSION;
        h.set_hardware_id(&cfg.hw_name);
        h.unit_id = cfg.unit_id;
        h.active_ant_chs = num_ch as u32;
        h.ioo_type = cfg.ioo_type;
        h.rf_center_freq = cfg.center_freq as u64;
        h.adc_sampling_freq = cfg.sample_rate as u64;
        h.sampling_freq = cfg.sample_rate as u64; // overwritten by the decimator
        h.cpi_length = cfg.daq_buffer_size as u32; // overwritten by the decimator
        h.frame_type = FRAME_TYPE_DATA;
        h.data_type = 2; // IQ
        h.sample_bit_depth = 8;
        for gain in h.if_gains.iter_mut().take(num_ch) {
            *gain = cfg.gain as u32;
        }
        h
    }

    /// Handle for the control reader and shutdown paths.
    pub fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Spawn one producer thread per channel behind a common start
    /// barrier.
    pub fn start(&mut self) -> Result<(), String> {
        let barrier = Arc::new(Barrier::new(self.channels.len()));
        for chan in &self.channels {
            let chan = chan.clone();
            let shared = self.shared.clone();
            let barrier = barrier.clone();
            let buffer_size = self.cfg.buffer_size();
            let handle = thread::Builder::new()
                .name(format!("tuner-{}", chan.index))
                .spawn(move || producer_loop(chan, shared, barrier, buffer_size))
                .map_err(|e| format!("failed to spawn producer thread: {}", e))?;
            self.producers.push(handle);
        }
        Ok(())
    }

    /// Alignment loop: wait on the condvar, release one frame per emit
    /// index once every channel has produced past it, apply pending
    /// reconfiguration at the frame boundary. Returns after the exit flag
    /// is set, with every async read cancelled and every producer joined.
    pub fn run<W: Write>(&mut self, out: &mut W) -> Result<(), String> {
        let shared = self.shared.clone();
        let mut result = Ok(());

        let mut st = shared.state.lock().unwrap();
        while !st.exit {
            st = shared.cond.wait(st).unwrap();
            let ready = self
                .channels
                .iter()
                .all(|chan| chan.ring.produced() > self.emit_index);
            if !ready {
                continue;
            }
            if let Err(e) = self.emit_frame(&mut st, out) {
                st.exit = true;
                result = Err(e);
                break;
            }
            self.apply_pending(&mut st);
        }
        drop(st);

        self.shutdown()?;
        result
    }

    fn emit_frame<W: Write>(&mut self, st: &mut ControlState, out: &mut W) -> Result<(), String> {
        self.header.time_stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.header.daq_block_index = self.emit_index as u32;

        let mut overdrive: u32 = 0;
        for chan in &self.channels {
            let tuning = &st.tuning[chan.index];
            self.header.rf_center_freq = tuning.center_freq as u64;
            self.header.if_gains[chan.index] = tuning.gain as u32;

            let scratch = &mut self.scratch[chan.index];
            chan.ring.read_into(self.emit_index, scratch);
            if scratch.iter().any(|&b| b == 0xff) {
                overdrive |= 1 << chan.index;
            }
        }
        self.header.adc_overdrive_flags = overdrive;
        self.header.noise_source_state = st.noise_source_on as u32;

        if st.dummy_frames {
            self.header.frame_type = FRAME_TYPE_DUMMY;
            self.header.data_type = 0;
            self.header.cpi_length = 0;
        } else {
            self.header.cpi_length = self.cfg.daq_buffer_size as u32;
            self.header.data_type = 1;
            self.header.frame_type = if st.noise_source_on {
                FRAME_TYPE_CAL
            } else {
                FRAME_TYPE_DATA
            };
        }

        self.header
            .write_to(out)
            .map_err(|e| format!("failed to write frame header: {}", e))?;
        if !st.dummy_frames {
            for chan in &self.channels {
                out.write_all(&self.scratch[chan.index])
                    .map_err(|e| format!("failed to write channel {} payload: {}", chan.index, e))?;
            }
        }
        out.flush().map_err(|e| format!("failed to flush output: {}", e))?;

        if overdrive != 0 {
            log::warn!("overdrive detected, flags: 0x{:02x}", overdrive);
        }
        log::debug!(
            "frame written, block index: {}, type: {}",
            self.emit_index,
            self.header.frame_type
        );

        self.emit_index += 1;
        if st.dummy_frames {
            st.dummy_frame_cntr += 1;
            if st.dummy_frame_cntr == QUIESCE_FRAMES {
                st.dummy_frames = false;
            }
        }
        Ok(())
    }

    /// Apply control-plane requests at the frame boundary just crossed.
    fn apply_pending(&mut self, st: &mut ControlState) {
        if st.retune_all {
            // Producers re-initialize with the tuning the control reader
            // already stored and re-enter the barrier.
            for chan in &self.channels {
                if let Err(e) = chan.tuner.cancel_async() {
                    log::error!("channel {}: async read stop failed: {}", chan.index, e);
                }
            }
            st.retune_all = false;
        }

        if let Some(freq) = st.new_center_freq.take() {
            for chan in &self.channels {
                match chan.tuner.set_center_freq(freq) {
                    Ok(()) => {
                        st.tuning[chan.index].center_freq = chan.tuner.center_freq();
                        log::info!(
                            "center frequency changed at channel {}: {} Hz",
                            chan.index,
                            st.tuning[chan.index].center_freq
                        );
                    }
                    Err(e) => {
                        log::error!("channel {}: failed to set center frequency: {}", chan.index, e)
                    }
                }
            }
        }

        if let Some(gains) = st.new_gains.take() {
            for chan in &self.channels {
                match chan.tuner.set_tuner_gain(gains[chan.index]) {
                    Ok(()) => {
                        st.tuning[chan.index].gain = gains[chan.index];
                        log::info!(
                            "gain changed at channel {}: {}",
                            chan.index,
                            gains[chan.index]
                        );
                    }
                    Err(e) => log::error!("channel {}: failed to set gain: {}", chan.index, e),
                }
            }
        }

        if st.noise_source_on != self.last_noise_state && self.cfg.en_noise_source_ctr {
            let on = st.noise_source_on;
            self.drive_noise_source(self.ctr_channel, on);
            if self.cfg.num_ch > 4 {
                // A second chassis gates its noise source separately.
                log::warn!(
                    "noise source also driven on channel {}",
                    self.cfg.aux_ctr_channel
                );
                self.drive_noise_source(self.cfg.aux_ctr_channel, on);
            }
            log::info!("noise source turned {}", if on { "on" } else { "off" });
        }
        self.last_noise_state = st.noise_source_on;
    }

    fn drive_noise_source(&self, channel: usize, on: bool) {
        match self.channels.get(channel) {
            Some(chan) => {
                if let Err(e) = chan.tuner.set_gpio(0, on) {
                    log::error!("channel {}: failed to drive noise source GPIO: {}", channel, e);
                }
            }
            None => log::error!("noise source control channel {} out of range", channel),
        }
    }

    /// Cancel every async read and join the producers. A failed cancel is
    /// fatal: the producer behind it can never be joined.
    fn shutdown(&mut self) -> Result<(), String> {
        log::info!("exiting..");
        for chan in &self.channels {
            chan.tuner
                .cancel_async()
                .map_err(|e| format!("channel {}: async read stop failed: {}", chan.index, e))?;
        }
        for handle in self.producers.drain(..) {
            let _ = handle.join();
        }
        log::info!("all producer threads joined");
        Ok(())
    }
}
