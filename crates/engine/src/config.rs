use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Default configuration file, shared with the rest of the DAQ chain.
pub const CONFIG_FNAME: &str = "daq_chain_config.ini";

/// Parameters loaded from the chain configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub num_ch: usize,
    pub hw_name: String,
    pub unit_id: u32,
    pub ioo_type: u32,
    /// Complex samples per block per channel; a ring slot holds twice as
    /// many bytes.
    pub daq_buffer_size: usize,
    pub sample_rate: u32,
    pub center_freq: u32,
    /// Tenths of a dB, per the driver convention.
    pub gain: i32,
    pub en_noise_source_ctr: bool,
    /// Serial number of the device whose GPIO drives the noise source.
    pub ctr_channel_serial_no: u32,
    /// Channel that gates the noise source of a second chassis; consulted
    /// only when more than four channels are configured.
    pub aux_ctr_channel: usize,
    pub log_level: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_ch: 0,
            hw_name: String::new(),
            unit_id: 0,
            ioo_type: 0,
            daq_buffer_size: 0,
            sample_rate: 0,
            center_freq: 0,
            gain: 0,
            en_noise_source_ctr: false,
            ctr_channel_serial_no: 1000,
            aux_ctr_channel: 7,
            log_level: 2,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, String> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::parse(&text)
    }

    /// Parse the sectioned key=value format. Unknown keys are a hard
    /// error: a typo in the chain configuration must not silently fall
    /// back to defaults.
    pub fn parse(text: &str) -> Result<Config, String> {
        let mut cfg = Config::default();
        let mut section = String::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            let lineno = idx + 1;
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].trim().to_string();
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("line {}: expected key=value, got '{}'", lineno, line))?;
            let key = key.trim();
            let value = value.trim();

            match (section.as_str(), key) {
                ("hw", "num_ch") => cfg.num_ch = parse_num(value, lineno)?,
                ("hw", "name") => cfg.hw_name = value.to_string(),
                ("hw", "unit_id") => cfg.unit_id = parse_num(value, lineno)?,
                ("hw", "ioo_type") => cfg.ioo_type = parse_num(value, lineno)?,
                ("daq", "daq_buffer_size") => cfg.daq_buffer_size = parse_num(value, lineno)?,
                ("daq", "sample_rate") => cfg.sample_rate = parse_num(value, lineno)?,
                ("daq", "center_freq") => cfg.center_freq = parse_num(value, lineno)?,
                ("daq", "gain") => cfg.gain = parse_num(value, lineno)?,
                ("daq", "en_noise_source_ctr") => {
                    cfg.en_noise_source_ctr = parse_num::<u32>(value, lineno)? == 1
                }
                ("daq", "ctr_channel_serial_no") => {
                    cfg.ctr_channel_serial_no = parse_num(value, lineno)?
                }
                ("daq", "aux_ctr_channel") => cfg.aux_ctr_channel = parse_num(value, lineno)?,
                ("daq", "log_level") => cfg.log_level = parse_num(value, lineno)?,
                _ => {
                    return Err(format!(
                        "line {}: unknown configuration key [{}] {}",
                        lineno, section, key
                    ))
                }
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), String> {
        if self.num_ch == 0 || self.num_ch > 8 {
            return Err(format!(
                "hw.num_ch must be between 1 and 8, got {}",
                self.num_ch
            ));
        }
        if self.daq_buffer_size == 0 {
            return Err("daq.daq_buffer_size must be set".to_string());
        }
        if self.sample_rate == 0 {
            return Err("daq.sample_rate must be set".to_string());
        }
        Ok(())
    }

    /// Ring slot size in bytes: one complex sample is an I byte followed
    /// by a Q byte.
    pub fn buffer_size(&self) -> usize {
        self.daq_buffer_size * 2
    }
}

fn parse_num<T: FromStr>(value: &str, lineno: usize) -> Result<T, String>
where
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| format!("line {}: invalid number '{}': {}", lineno, value, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# receiver chain configuration
[hw]
num_ch = 4
name = kerberos
unit_id = 3
ioo_type = 0

[daq]
daq_buffer_size = 1024
sample_rate = 2400000
center_freq = 433000000
gain = 496
en_noise_source_ctr = 1
ctr_channel_serial_no = 1000
log_level = 2
";

    #[test]
    fn test_parse_sample() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.num_ch, 4);
        assert_eq!(cfg.hw_name, "kerberos");
        assert_eq!(cfg.unit_id, 3);
        assert_eq!(cfg.daq_buffer_size, 1024);
        assert_eq!(cfg.buffer_size(), 2048);
        assert_eq!(cfg.sample_rate, 2_400_000);
        assert_eq!(cfg.center_freq, 433_000_000);
        assert_eq!(cfg.gain, 496);
        assert!(cfg.en_noise_source_ctr);
        assert_eq!(cfg.ctr_channel_serial_no, 1000);
        // defaulted, not in the file
        assert_eq!(cfg.aux_ctr_channel, 7);
        assert_eq!(cfg.log_level, 2);
    }

    #[test]
    fn test_unknown_key_is_fatal() {
        let text = format!("{}\nsquelch = -45\n", SAMPLE);
        let err = Config::parse(&text).unwrap_err();
        assert!(err.contains("unknown configuration key"), "{}", err);
    }

    #[test]
    fn test_key_in_wrong_section_is_fatal() {
        let text = "[hw]\nnum_ch = 4\nsample_rate = 2400000\n";
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn test_channel_count_bounds() {
        let text = SAMPLE.replace("num_ch = 4", "num_ch = 9");
        let err = Config::parse(&text).unwrap_err();
        assert!(err.contains("num_ch"), "{}", err);
    }

    #[test]
    fn test_missing_buffer_size_is_fatal() {
        let text = SAMPLE.replace("daq_buffer_size = 1024", "");
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let text = format!("; leading comment\n\n{}", SAMPLE);
        assert!(Config::parse(&text).is_ok());
    }
}
