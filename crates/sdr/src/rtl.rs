// Copyright 2025-2026 CEMAXECUTER LLC

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::Arc;

use crate::{Tuner, TunerDriver};

type RtlsdrDev = c_void;

extern "C" {
    fn rtlsdr_get_device_count() -> u32;
    fn rtlsdr_get_device_usb_strings(
        index: u32,
        manufact: *mut c_char,
        product: *mut c_char,
        serial: *mut c_char,
    ) -> c_int;
    fn rtlsdr_get_index_by_serial(serial: *const c_char) -> c_int;
    fn rtlsdr_open(dev: *mut *mut RtlsdrDev, index: u32) -> c_int;
    fn rtlsdr_close(dev: *mut RtlsdrDev) -> c_int;
    // Only present in the coherent-receiver fork of librtlsdr.
    fn rtlsdr_set_dithering(dev: *mut RtlsdrDev, dither: c_int) -> c_int;
    fn rtlsdr_set_tuner_gain_mode(dev: *mut RtlsdrDev, manual: c_int) -> c_int;
    fn rtlsdr_set_center_freq(dev: *mut RtlsdrDev, freq: u32) -> c_int;
    fn rtlsdr_get_center_freq(dev: *mut RtlsdrDev) -> u32;
    fn rtlsdr_set_tuner_gain(dev: *mut RtlsdrDev, gain: c_int) -> c_int;
    fn rtlsdr_set_sample_rate(dev: *mut RtlsdrDev, rate: u32) -> c_int;
    fn rtlsdr_get_sample_rate(dev: *mut RtlsdrDev) -> u32;
    fn rtlsdr_set_gpio(dev: *mut RtlsdrDev, value: c_int, gpio: c_int) -> c_int;
    fn rtlsdr_reset_buffer(dev: *mut RtlsdrDev) -> c_int;
    fn rtlsdr_read_async(
        dev: *mut RtlsdrDev,
        callback: unsafe extern "C" fn(*mut u8, u32, *mut c_void),
        ctx: *mut c_void,
        buf_num: u32,
        buf_len: u32,
    ) -> c_int;
    fn rtlsdr_cancel_async(dev: *mut RtlsdrDev) -> c_int;
}

/// Information about a detected RTL-SDR device
#[derive(Debug, Clone)]
pub struct RtlsdrInfo {
    pub index: u32,
    pub product: String,
    pub serial: String,
}

/// List all available RTL-SDR devices
pub fn list_devices() -> Result<Vec<RtlsdrInfo>, String> {
    let count = unsafe { rtlsdr_get_device_count() };
    let mut devices = Vec::with_capacity(count as usize);

    for i in 0..count {
        let mut manufact = [0 as c_char; 256];
        let mut product = [0 as c_char; 256];
        let mut serial = [0 as c_char; 256];
        let r = unsafe {
            rtlsdr_get_device_usb_strings(
                i,
                manufact.as_mut_ptr(),
                product.as_mut_ptr(),
                serial.as_mut_ptr(),
            )
        };
        if r != 0 {
            continue;
        }
        devices.push(RtlsdrInfo {
            index: i,
            product: unsafe { CStr::from_ptr(product.as_ptr()) }
                .to_string_lossy()
                .to_string(),
            serial: unsafe { CStr::from_ptr(serial.as_ptr()) }
                .to_string_lossy()
                .to_string(),
        });
    }

    Ok(devices)
}

unsafe extern "C" fn read_trampoline(buf: *mut u8, len: u32, ctx: *mut c_void) {
    let on_buf = &mut *(ctx as *mut &mut dyn FnMut(&[u8]));
    on_buf(std::slice::from_raw_parts(buf, len as usize));
}

/// One opened RTL-SDR device.
pub struct RtlTuner {
    dev: *mut RtlsdrDev,
    serial: String,
}

// The device pointer has a single owner; librtlsdr serializes control
// calls internally and cancel_async is explicitly cross-thread.
unsafe impl Send for RtlTuner {}
unsafe impl Sync for RtlTuner {}

impl Tuner for RtlTuner {
    fn set_dithering(&self, enable: bool) -> Result<(), String> {
        let r = unsafe { rtlsdr_set_dithering(self.dev, enable as c_int) };
        if r != 0 {
            return Err(format!("rtlsdr_set_dithering failed: {}", r));
        }
        Ok(())
    }

    fn set_agc(&self, enable: bool) -> Result<(), String> {
        // gain mode 1 = manual
        let manual = if enable { 0 } else { 1 };
        let r = unsafe { rtlsdr_set_tuner_gain_mode(self.dev, manual) };
        if r != 0 {
            return Err(format!("rtlsdr_set_tuner_gain_mode failed: {}", r));
        }
        Ok(())
    }

    fn set_center_freq(&self, freq_hz: u32) -> Result<(), String> {
        let r = unsafe { rtlsdr_set_center_freq(self.dev, freq_hz) };
        if r != 0 {
            return Err(format!("rtlsdr_set_center_freq failed: {}", r));
        }
        Ok(())
    }

    fn center_freq(&self) -> u32 {
        unsafe { rtlsdr_get_center_freq(self.dev) }
    }

    fn set_tuner_gain(&self, gain: i32) -> Result<(), String> {
        let r = unsafe { rtlsdr_set_tuner_gain(self.dev, gain as c_int) };
        if r != 0 {
            return Err(format!("rtlsdr_set_tuner_gain failed: {}", r));
        }
        Ok(())
    }

    fn set_sample_rate(&self, rate_hz: u32) -> Result<(), String> {
        let r = unsafe { rtlsdr_set_sample_rate(self.dev, rate_hz) };
        if r != 0 {
            return Err(format!("rtlsdr_set_sample_rate failed: {}", r));
        }
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        unsafe { rtlsdr_get_sample_rate(self.dev) }
    }

    fn set_gpio(&self, gpio: u8, on: bool) -> Result<(), String> {
        let r = unsafe { rtlsdr_set_gpio(self.dev, on as c_int, gpio as c_int) };
        if r != 0 {
            return Err(format!("rtlsdr_set_gpio failed: {}", r));
        }
        Ok(())
    }

    fn reset_buffer(&self) -> Result<(), String> {
        let r = unsafe { rtlsdr_reset_buffer(self.dev) };
        if r != 0 {
            return Err(format!("rtlsdr_reset_buffer failed: {}", r));
        }
        Ok(())
    }

    fn read_async(
        &self,
        num_buffers: u32,
        buf_len: usize,
        on_buf: &mut dyn FnMut(&[u8]),
    ) -> Result<(), String> {
        // The trampoline needs a thin pointer, hence the double
        // indirection. `read_async` blocks for the lifetime of the
        // stream, so the stack slot outlives every callback.
        let mut cb: &mut dyn FnMut(&[u8]) = on_buf;
        let ctx = &mut cb as *mut &mut dyn FnMut(&[u8]) as *mut c_void;
        let r = unsafe {
            rtlsdr_read_async(self.dev, read_trampoline, ctx, num_buffers, buf_len as u32)
        };
        if r != 0 {
            return Err(format!("rtlsdr_read_async failed: {}", r));
        }
        Ok(())
    }

    fn cancel_async(&self) -> Result<(), String> {
        let r = unsafe { rtlsdr_cancel_async(self.dev) };
        if r != 0 {
            return Err(format!("rtlsdr_cancel_async failed: {}", r));
        }
        Ok(())
    }
}

impl Drop for RtlTuner {
    fn drop(&mut self) {
        unsafe {
            rtlsdr_close(self.dev);
        }
        log::debug!("RTL-SDR closed (serial={})", self.serial);
    }
}

/// RTL-SDR backend: opens devices by the serial numbers programmed into
/// the chassis.
pub struct RtlDriver;

impl TunerDriver for RtlDriver {
    fn open_by_serial(&self, serial: &str) -> Result<Arc<dyn Tuner>, String> {
        let cs = CString::new(serial).map_err(|e| format!("CString error: {}", e))?;
        let index = unsafe { rtlsdr_get_index_by_serial(cs.as_ptr()) };
        if index < 0 {
            return Err(format!(
                "no RTL-SDR device with serial {} (code {})",
                serial, index
            ));
        }

        let mut dev: *mut RtlsdrDev = ptr::null_mut();
        let r = unsafe { rtlsdr_open(&mut dev, index as u32) };
        if r != 0 {
            return Err(format!("rtlsdr_open failed for serial {}: {}", serial, r));
        }

        log::info!("RTL-SDR opened (serial={}, index={})", serial, index);
        Ok(Arc::new(RtlTuner {
            dev,
            serial: serial.to_string(),
        }))
    }
}
