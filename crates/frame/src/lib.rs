//! Fixed-layout IQ frame header.
//!
//! Every frame on the output stream starts with this 1024-byte record,
//! followed by one interleaved 8-bit IQ payload per channel (none for
//! dummy frames). Fields are serialized in declaration order, host
//! endianness, with no padding; the reserved block is zero and the header
//! version sits in the last four bytes. Downstream stages overwrite the
//! fields marked as theirs and leave the rest untouched.

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// First four bytes of every frame.
pub const SYNC_WORD: u32 = 0x2bf7_b95a;

pub const HEADER_VERSION: u32 = 7;

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 1024;

/// Gain slots in the header; the chassis populates the first
/// `active_ant_chs` of them.
pub const MAX_CHANNELS: usize = 32;

pub const FRAME_TYPE_DATA: u32 = 0;
pub const FRAME_TYPE_DUMMY: u32 = 1;
/// Reserved by the wire format for test-ramp frames; never emitted here.
pub const FRAME_TYPE_RAMP: u32 = 2;
pub const FRAME_TYPE_CAL: u32 = 3;

const RESERVED_WORDS: usize = 194;

/// The reusable frame header record. Zero-initialized; the static fields
/// are filled once at startup and the dynamic ones re-stamped per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct IqHeader {
    pub sync_word: u32,
    pub frame_type: u32,
    pub hardware_id: [u8; 16],
    pub unit_id: u32,
    pub active_ant_chs: u32,
    pub ioo_type: u32,
    pub rf_center_freq: u64,
    pub adc_sampling_freq: u64,
    /// Overwritten by the decimator.
    pub sampling_freq: u64,
    /// Overwritten by the decimator.
    pub cpi_length: u32,
    /// Unix seconds.
    pub time_stamp: u64,
    pub daq_block_index: u32,
    /// Filled by the decimator.
    pub cpi_index: u32,
    pub ext_integration_cntr: u64,
    pub data_type: u32,
    pub sample_bit_depth: u32,
    pub adc_overdrive_flags: u32,
    /// Tenths of a dB per channel.
    pub if_gains: [u32; MAX_CHANNELS],
    pub delay_sync_flag: u32,
    pub iq_sync_flag: u32,
    pub sync_state: u32,
    pub noise_source_state: u32,
    pub header_version: u32,
}

impl Default for IqHeader {
    fn default() -> Self {
        Self {
            sync_word: 0,
            frame_type: 0,
            hardware_id: [0; 16],
            unit_id: 0,
            active_ant_chs: 0,
            ioo_type: 0,
            rf_center_freq: 0,
            adc_sampling_freq: 0,
            sampling_freq: 0,
            cpi_length: 0,
            time_stamp: 0,
            daq_block_index: 0,
            cpi_index: 0,
            ext_integration_cntr: 0,
            data_type: 0,
            sample_bit_depth: 0,
            adc_overdrive_flags: 0,
            if_gains: [0; MAX_CHANNELS],
            delay_sync_flag: 0,
            iq_sync_flag: 0,
            sync_state: 0,
            noise_source_state: 0,
            header_version: 0,
        }
    }
}

impl IqHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a hardware identity string, truncated and NUL-padded.
    pub fn set_hardware_id(&mut self, name: &str) {
        self.hardware_id = [0; 16];
        let n = name.len().min(self.hardware_id.len() - 1);
        self.hardware_id[..n].copy_from_slice(&name.as_bytes()[..n]);
    }

    /// Serialize the header as one contiguous `HEADER_SIZE`-byte record.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<NativeEndian>(self.sync_word)?;
        w.write_u32::<NativeEndian>(self.frame_type)?;
        w.write_all(&self.hardware_id)?;
        w.write_u32::<NativeEndian>(self.unit_id)?;
        w.write_u32::<NativeEndian>(self.active_ant_chs)?;
        w.write_u32::<NativeEndian>(self.ioo_type)?;
        w.write_u64::<NativeEndian>(self.rf_center_freq)?;
        w.write_u64::<NativeEndian>(self.adc_sampling_freq)?;
        w.write_u64::<NativeEndian>(self.sampling_freq)?;
        w.write_u32::<NativeEndian>(self.cpi_length)?;
        w.write_u64::<NativeEndian>(self.time_stamp)?;
        w.write_u32::<NativeEndian>(self.daq_block_index)?;
        w.write_u32::<NativeEndian>(self.cpi_index)?;
        w.write_u64::<NativeEndian>(self.ext_integration_cntr)?;
        w.write_u32::<NativeEndian>(self.data_type)?;
        w.write_u32::<NativeEndian>(self.sample_bit_depth)?;
        w.write_u32::<NativeEndian>(self.adc_overdrive_flags)?;
        for gain in &self.if_gains {
            w.write_u32::<NativeEndian>(*gain)?;
        }
        w.write_u32::<NativeEndian>(self.delay_sync_flag)?;
        w.write_u32::<NativeEndian>(self.iq_sync_flag)?;
        w.write_u32::<NativeEndian>(self.sync_state)?;
        w.write_u32::<NativeEndian>(self.noise_source_state)?;
        w.write_all(&[0u8; RESERVED_WORDS * 4])?;
        w.write_u32::<NativeEndian>(self.header_version)?;
        Ok(())
    }

    /// Read one header record back; inverse of `write_to`.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<IqHeader> {
        let mut h = IqHeader::new();
        h.sync_word = r.read_u32::<NativeEndian>()?;
        h.frame_type = r.read_u32::<NativeEndian>()?;
        r.read_exact(&mut h.hardware_id)?;
        h.unit_id = r.read_u32::<NativeEndian>()?;
        h.active_ant_chs = r.read_u32::<NativeEndian>()?;
        h.ioo_type = r.read_u32::<NativeEndian>()?;
        h.rf_center_freq = r.read_u64::<NativeEndian>()?;
        h.adc_sampling_freq = r.read_u64::<NativeEndian>()?;
        h.sampling_freq = r.read_u64::<NativeEndian>()?;
        h.cpi_length = r.read_u32::<NativeEndian>()?;
        h.time_stamp = r.read_u64::<NativeEndian>()?;
        h.daq_block_index = r.read_u32::<NativeEndian>()?;
        h.cpi_index = r.read_u32::<NativeEndian>()?;
        h.ext_integration_cntr = r.read_u64::<NativeEndian>()?;
        h.data_type = r.read_u32::<NativeEndian>()?;
        h.sample_bit_depth = r.read_u32::<NativeEndian>()?;
        h.adc_overdrive_flags = r.read_u32::<NativeEndian>()?;
        for gain in h.if_gains.iter_mut() {
            *gain = r.read_u32::<NativeEndian>()?;
        }
        h.delay_sync_flag = r.read_u32::<NativeEndian>()?;
        h.iq_sync_flag = r.read_u32::<NativeEndian>()?;
        h.sync_state = r.read_u32::<NativeEndian>()?;
        h.noise_source_state = r.read_u32::<NativeEndian>()?;
        let mut reserved = [0u8; RESERVED_WORDS * 4];
        r.read_exact(&mut reserved)?;
        h.header_version = r.read_u32::<NativeEndian>()?;
        Ok(h)
    }
}
