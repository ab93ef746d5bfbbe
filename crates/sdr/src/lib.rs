// Copyright 2025-2026 CEMAXECUTER LLC

pub mod sim;

#[cfg(feature = "rtlsdr")]
pub mod rtl;

use std::sync::Arc;

/// Operations the acquisition engine needs from a tuner, one method per
/// vendor-library call. All methods take `&self`: the driver serializes
/// control calls per device, and the asynchronous read is cancelled from
/// another thread while the owning producer is blocked inside it.
pub trait Tuner: Send + Sync {
    /// Enable or disable the PLL dither. Dither wanders the oscillator
    /// phase and must be off for coherent multi-channel operation.
    fn set_dithering(&self, enable: bool) -> Result<(), String>;

    /// Switch between automatic and manual tuner gain. Manual gain is
    /// mandatory for amplitude and phase calibration.
    fn set_agc(&self, enable: bool) -> Result<(), String>;

    fn set_center_freq(&self, freq_hz: u32) -> Result<(), String>;

    /// Driver-reported center frequency after tuning.
    fn center_freq(&self) -> u32;

    /// Gain in tenths of a dB, per the driver convention.
    fn set_tuner_gain(&self, gain: i32) -> Result<(), String>;

    fn set_sample_rate(&self, rate_hz: u32) -> Result<(), String>;

    /// Driver-reported sample rate after configuration.
    fn sample_rate(&self) -> u32;

    /// Drive a GPIO line. The chassis noise source sits on GPIO 0 of the
    /// control channel device.
    fn set_gpio(&self, gpio: u8, on: bool) -> Result<(), String>;

    /// Flush the driver's internal sample FIFO.
    fn reset_buffer(&self) -> Result<(), String>;

    /// Blocking asynchronous read: the driver cycles `num_buffers`
    /// transfer buffers of `buf_len` bytes and hands each completed
    /// transfer to `on_buf`. Returns once `cancel_async` is called from
    /// another thread.
    fn read_async(
        &self,
        num_buffers: u32,
        buf_len: usize,
        on_buf: &mut dyn FnMut(&[u8]),
    ) -> Result<(), String>;

    /// Stop a blocking `read_async` from another thread.
    fn cancel_async(&self) -> Result<(), String>;
}

/// Backend-independent device lookup by serial number.
pub trait TunerDriver {
    fn open_by_serial(&self, serial: &str) -> Result<Arc<dyn Tuner>, String>;
}
