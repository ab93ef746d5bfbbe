// Copyright 2025-2026 CEMAXECUTER LLC

//! Out-of-band control plane: single-byte opcodes with fixed-width binary
//! arguments, read from a named pipe shared with the DSP side.

use byteorder::{NativeEndian, ReadBytesExt};
use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;

use crate::acquisition::Shared;

/// Receiver control FIFO, relative to the chain's working directory.
pub const CONTROL_FIFO: &str = "_data_control/rec_control_fifo";

/// Requests arriving on the control pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Deprecated full reconfiguration: retunes every channel and forces
    /// the producers through a cancel / re-init cycle.
    Reconfigure {
        center_freq: u32,
        sample_rate: u32,
        gain: i32,
    },
    Retune { center_freq: u32 },
    Regain { gains: Vec<i32> },
    NoiseOn,
    NoiseOff,
    Halt,
}

/// Decode one command from the pipe. The wire format is one opcode byte
/// followed by fixed-width host-endian arguments; this is the only place
/// it is interpreted. Returns `None` for an unknown opcode (logged and
/// discarded).
pub fn read_command(r: &mut impl Read, num_ch: usize) -> io::Result<Option<Command>> {
    let mut opcode = [0u8; 1];
    r.read_exact(&mut opcode)?;

    let cmd = match opcode[0] {
        b'r' => {
            let center_freq = r.read_u32::<NativeEndian>()?;
            let sample_rate = r.read_u32::<NativeEndian>()?;
            let gain = r.read_i32::<NativeEndian>()?;
            Some(Command::Reconfigure {
                center_freq,
                sample_rate,
                gain,
            })
        }
        b'c' => Some(Command::Retune {
            center_freq: r.read_u32::<NativeEndian>()?,
        }),
        b'g' => {
            let mut gains = vec![0i32; num_ch];
            r.read_i32_into::<NativeEndian>(&mut gains)?;
            Some(Command::Regain { gains })
        }
        b'n' => Some(Command::NoiseOn),
        b'f' => Some(Command::NoiseOff),
        0x02 => Some(Command::Halt),
        other => {
            log::warn!("unknown control opcode 0x{:02x}, discarding", other);
            None
        }
    };
    Ok(cmd)
}

/// Post a decoded command to the engine: mutate the pending state, start
/// the dummy-frame quiesce interval and wake the alignment loop.
pub fn apply(shared: &Shared, cmd: Command) {
    let mut st = shared.state.lock().unwrap();
    match cmd {
        Command::Reconfigure {
            center_freq,
            sample_rate,
            gain,
        } => {
            log::info!("signal 'r': reconfiguring the tuner");
            log::info!("center freq: {} MHz", center_freq / 1_000_000);
            log::info!("sample rate: {} MSps", sample_rate / 1_000_000);
            log::info!("gain: {} dB", gain / 10);
            for tuning in st.tuning.iter_mut() {
                tuning.center_freq = center_freq;
                tuning.sample_rate = sample_rate;
                tuning.gain = gain;
            }
            st.retune_all = true;
        }
        Command::Retune { center_freq } => {
            log::info!(
                "signal 'c': center frequency tuning request, {} MHz",
                center_freq / 1_000_000
            );
            st.new_center_freq = Some(center_freq);
        }
        Command::Regain { gains } => {
            log::info!("signal 'g': gain tuning request");
            st.new_gains = Some(gains);
        }
        Command::NoiseOn => {
            log::info!("signal 'n': turn on noise source");
            st.noise_source_on = true;
        }
        Command::NoiseOff => {
            log::info!("signal 'f': turn off noise source");
            st.noise_source_on = false;
        }
        Command::Halt => {
            log::info!("signal 2: system halt request");
            st.exit = true;
        }
    }
    // The downstream consumers see a quiesce window while the change
    // settles.
    st.dummy_frames = true;
    st.dummy_frame_cntr = 0;
    shared.cond.notify_one();
}

/// Control pipe reader loop; runs on its own thread. Failure to open the
/// pipe cascades into a full shutdown. EOF (the last writer closed the
/// pipe) reopens it and keeps serving.
pub fn run_control_reader(shared: Arc<Shared>, fifo_path: &str, num_ch: usize) {
    loop {
        let mut pipe = match File::open(fifo_path) {
            Ok(f) => f,
            Err(e) => {
                log::error!("failed to open control FIFO {}: {}", fifo_path, e);
                shared.request_exit();
                return;
            }
        };

        loop {
            if shared.state.lock().unwrap().exit {
                return;
            }
            match read_command(&mut pipe, num_ch) {
                Ok(Some(cmd)) => {
                    let halt = cmd == Command::Halt;
                    apply(&shared, cmd);
                    if halt {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    log::debug!("control FIFO writer closed, reopening");
                    break;
                }
                Err(e) => {
                    log::error!("control FIFO read failed: {}", e);
                    shared.request_exit();
                    return;
                }
            }
        }
    }
}
