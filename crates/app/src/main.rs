use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use cmrx_engine::acquisition::AcquisitionEngine;
use cmrx_engine::config::{Config, CONFIG_FNAME};
use cmrx_engine::control;
use cmrx_sdr::{Tuner, TunerDriver};

#[derive(Parser, Debug)]
#[command(name = "cmrx-daq")]
#[command(about = "Coherent multichannel SDR acquisition front end")]
struct Cli {
    /// Chain configuration file
    #[arg(short = 'c', long, default_value = CONFIG_FNAME)]
    config: PathBuf,

    /// Use simulated tuners instead of hardware
    #[arg(long)]
    sim: bool,

    /// List detected RTL-SDR devices
    #[arg(long)]
    list: bool,
}

fn main() {
    let cli = Cli::parse();

    if cli.list {
        list_devices();
        return;
    }

    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration could not be loaded: {}", e);
            process::exit(-1);
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level(cfg.log_level))
        .init();

    log::info!("config loaded from {}", cli.config.display());
    log::info!("channel count: {}", cfg.num_ch);
    log::info!("IQ samples per channel: {}", cfg.daq_buffer_size);
    if cfg.en_noise_source_ctr {
        log::info!("noise source control: enabled");
    } else {
        log::info!("noise source control: disabled");
    }
    log::info!("starting multichannel coherent receiver");

    match run(&cli, cfg) {
        Ok(()) => process::exit(0),
        Err(e) => {
            log::error!("{}", e);
            process::exit(-1);
        }
    }
}

fn list_devices() {
    #[cfg(feature = "rtlsdr")]
    {
        match cmrx_sdr::rtl::list_devices() {
            Ok(devices) => {
                for dev in &devices {
                    eprintln!(
                        "  rtlsdr-{} (serial={}, product={})",
                        dev.index, dev.serial, dev.product
                    );
                }
                if devices.is_empty() {
                    eprintln!("  (no RTL-SDR devices found)");
                }
            }
            Err(e) => eprintln!("error listing RTL-SDR devices: {}", e),
        }
    }
    #[cfg(not(feature = "rtlsdr"))]
    eprintln!("built without RTL-SDR support");
}

fn run(cli: &Cli, cfg: Config) -> Result<(), String> {
    let driver: Box<dyn TunerDriver> = if cli.sim {
        Box::new(cmrx_sdr::sim::SimDriver::new(cfg.num_ch))
    } else {
        #[cfg(feature = "rtlsdr")]
        {
            Box::new(cmrx_sdr::rtl::RtlDriver)
        }
        #[cfg(not(feature = "rtlsdr"))]
        {
            return Err("built without RTL-SDR support; run with --sim".to_string());
        }
    };

    // Channels map to the fixed serial numbers programmed into the
    // chassis: 1000, 1001, ...
    let mut tuners: Vec<Arc<dyn Tuner>> = Vec::with_capacity(cfg.num_ch);
    for i in 0..cfg.num_ch {
        let serial = format!("{}", 1000 + i);
        let tuner = driver
            .open_by_serial(&serial)
            .map_err(|e| format!("failed to open device with serial {}: {}", serial, e))?;
        log::info!("device serial {} mapped to channel {}", serial, i);
        tuners.push(tuner);
    }

    let ctr_channel = match ctr_channel_index(cfg.ctr_channel_serial_no, cfg.num_ch) {
        Some(ch) => ch,
        None => {
            log::warn!(
                "failed to identify control channel for serial {}",
                cfg.ctr_channel_serial_no
            );
            log::warn!("set to default channel 0");
            0
        }
    };

    let num_ch = cfg.num_ch;
    let mut engine = AcquisitionEngine::new(cfg, tuners, ctr_channel);
    let shared = engine.shared();

    let ctrlc_shared = shared.clone();
    ctrlc::set_handler(move || {
        eprintln!("\ninterrupted, stopping...");
        ctrlc_shared.request_exit();
    })
    .map_err(|e| format!("failed to set Ctrl-C handler: {}", e))?;

    let control_thread = std::thread::Builder::new()
        .name("control".to_string())
        .spawn(move || control::run_control_reader(shared, control::CONTROL_FIFO, num_ch))
        .map_err(|e| format!("failed to spawn control thread: {}", e))?;

    engine.start()?;

    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    engine.run(&mut out)?;

    if control_thread.is_finished() {
        let _ = control_thread.join();
    } else {
        // Still blocked on the pipe (shutdown came from Ctrl-C); it dies
        // with the process.
        log::debug!("control thread still blocked on the FIFO");
    }
    log::info!("all resources released");
    Ok(())
}

/// Control channel serials follow the same 1000 + index convention as the
/// data channels.
fn ctr_channel_index(serial: u32, num_ch: usize) -> Option<usize> {
    (serial as usize)
        .checked_sub(1000)
        .filter(|&ch| ch < num_ch)
}

fn log_level(level: u32) -> log::LevelFilter {
    match level {
        0 => log::LevelFilter::Trace,
        1 => log::LevelFilter::Debug,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Warn,
        _ => log::LevelFilter::Error,
    }
}
