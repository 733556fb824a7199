// Part of antctl. Copyright 2022-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Drive parameter file: a flat list of `REG=VALUE` lines that is replayed
//! as SDO downloads to both amplifiers after bus activation.
//!
//! ```text
//! 60F7=35     // velocity loop gain
//! 6083=20000  # profile acceleration
//!
//! 6084=20000
//! ```
//!
//! The register index is 16-bit hex, the value signed decimal.  `#` and `//`
//! start comments, blank lines and whitespace around `=` are ignored, and
//! any malformed or unknown line aborts the parse with its line number.

use std::fs;
use std::path::Path;

use derive_new::new;
use thiserror::Error;

use crate::bus::SdoValue;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: malformed entry {text:?} (expected HHHH=NNN)")]
    Malformed {
        path: String,
        line: usize,
        text: String,
    },
    #[error("{path}:{line}: unknown register 0x{index:04X}")]
    UnknownRegister {
        path: String,
        line: usize,
        index: u16,
    },
    #[error("{path}:{line}: value {value} out of range for register 0x{index:04X} ({name})")]
    ValueRange {
        path: String,
        line: usize,
        index: u16,
        value: i64,
        name: &'static str,
    },
}

/// One validated `REG=VALUE` entry.
#[derive(Debug, Clone, Copy, new)]
pub struct DriveParam {
    pub index: u16,
    pub value: i64,
}

impl DriveParam {
    /// The typed SDO payload for this register, width per the register
    /// table.  Parsing has already range-checked the value.
    pub fn sdo_value(&self) -> SdoValue {
        let def = register_def(self.index).expect("validated at parse time");
        def.encode(self.value)
    }
}

/// The parsed drive parameter file.
#[derive(Debug, Clone, Default)]
pub struct DriveConfig {
    pub params: Vec<DriveParam>,
}

impl DriveConfig {
    /// Read and validate a parameter file.
    pub fn read_file<P: AsRef<Path>>(path: P) -> Result<DriveConfig, ConfigError> {
        let label = path.as_ref().display().to_string();
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: label.clone(),
            source,
        })?;
        Self::parse(&label, &text)
    }

    /// Parse parameter-file text; `path` only labels errors.
    pub fn parse(path: &str, text: &str) -> Result<DriveConfig, ConfigError> {
        let mut params = Vec::new();
        for (n, raw) in text.lines().enumerate() {
            let line = n + 1;
            let code = strip_comment(raw).trim();
            if code.is_empty() {
                continue;
            }
            let malformed = || ConfigError::Malformed {
                path: path.into(),
                line,
                text: raw.trim().into(),
            };
            let (idx, val) = code.split_once('=').ok_or_else(malformed)?;
            let (idx, val) = (idx.trim(), val.trim());
            if idx.is_empty() || idx.len() > 4 {
                return Err(malformed());
            }
            let index = u16::from_str_radix(idx, 16).map_err(|_| malformed())?;
            let value: i64 = val.parse().map_err(|_| malformed())?;

            let def = register_def(index).ok_or(ConfigError::UnknownRegister {
                path: path.into(),
                line,
                index,
            })?;
            if !def.in_range(value) {
                return Err(ConfigError::ValueRange {
                    path: path.into(),
                    line,
                    index,
                    value,
                    name: def.name,
                });
            }
            params.push(DriveParam::new(index, value));
        }
        Ok(DriveConfig { params })
    }
}

fn strip_comment(line: &str) -> &str {
    let end = line
        .find('#')
        .into_iter()
        .chain(line.find("//"))
        .min()
        .unwrap_or(line.len());
    &line[..end]
}

/// Wire width of a configurable register.
#[derive(Debug, Clone, Copy)]
enum Width {
    U16,
    I16,
    U32,
    I32,
}

struct RegisterDef {
    index: u16,
    width: Width,
    name: &'static str,
}

impl RegisterDef {
    fn in_range(&self, v: i64) -> bool {
        match self.width {
            Width::U16 => v >= 0 && v <= u16::MAX as i64,
            Width::I16 => v >= i16::MIN as i64 && v <= i16::MAX as i64,
            Width::U32 => v >= 0 && v <= u32::MAX as i64,
            Width::I32 => v >= i32::MIN as i64 && v <= i32::MAX as i64,
        }
    }

    fn encode(&self, v: i64) -> SdoValue {
        match self.width {
            Width::U16 => SdoValue::U16(v as u16),
            Width::I16 => SdoValue::I16(v as i16),
            Width::U32 => SdoValue::U32(v as u32),
            Width::I32 => SdoValue::I32(v as i32),
        }
    }
}

/// Registers the parameter file may touch.  Anything else is a config error
/// rather than a surprise SDO download to live amplifiers.
const KNOWN_REGISTERS: &[RegisterDef] = &[
    RegisterDef { index: 0x6065, width: Width::U32, name: "following error window" },
    RegisterDef { index: 0x6067, width: Width::U32, name: "position window" },
    RegisterDef { index: 0x606D, width: Width::U16, name: "velocity window" },
    RegisterDef { index: 0x6071, width: Width::I16, name: "target torque" },
    RegisterDef { index: 0x6072, width: Width::U16, name: "max torque" },
    RegisterDef { index: 0x607F, width: Width::U32, name: "max profile velocity" },
    RegisterDef { index: 0x6081, width: Width::U32, name: "profile velocity" },
    RegisterDef { index: 0x6083, width: Width::U32, name: "profile acceleration" },
    RegisterDef { index: 0x6084, width: Width::U32, name: "profile deceleration" },
    RegisterDef { index: 0x6085, width: Width::U32, name: "quick stop deceleration" },
    RegisterDef { index: 0x6086, width: Width::I16, name: "motion profile type" },
    RegisterDef { index: 0x60E0, width: Width::U16, name: "positive torque limit" },
    RegisterDef { index: 0x60E1, width: Width::U16, name: "negative torque limit" },
    RegisterDef { index: 0x60F7, width: Width::U16, name: "velocity loop gain" },
    RegisterDef { index: 0x60FF, width: Width::I32, name: "target velocity" },
];

fn register_def(index: u16) -> Option<&'static RegisterDef> {
    KNOWN_REGISTERS.iter().find(|d| d.index == index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_entries() {
        let cfg = DriveConfig::parse("t", "6083=20000\n6084=20000\n60FF=0\n").unwrap();
        assert_eq!(cfg.params.len(), 3);
        assert_eq!(cfg.params[0].index, 0x6083);
        assert_eq!(cfg.params[0].value, 20000);
        assert!(matches!(cfg.params[2].sdo_value(), SdoValue::I32(0)));
    }

    #[test]
    fn tolerates_comments_and_whitespace() {
        let text = "\n# full-line comment\n  6083 = 20000  // trailing\n60F7=35 # gain\n\n";
        let cfg = DriveConfig::parse("t", text).unwrap();
        assert_eq!(cfg.params.len(), 2);
        assert_eq!(cfg.params[1].index, 0x60F7);
        assert_eq!(cfg.params[1].value, 35);
    }

    #[test]
    fn negative_values() {
        let cfg = DriveConfig::parse("t", "60FF=-150000\n").unwrap();
        assert!(matches!(cfg.params[0].sdo_value(), SdoValue::I32(-150_000)));
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let err = DriveConfig::parse("servo.conf", "6083=20000\nnot a line\n").unwrap_err();
        match err {
            ConfigError::Malformed { path, line, text } => {
                assert_eq!(path, "servo.conf");
                assert_eq!(line, 2);
                assert_eq!(text, "not a line");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_hex_index() {
        assert!(DriveConfig::parse("t", "60X3=1\n").is_err());
        assert!(DriveConfig::parse("t", "123456=1\n").is_err());
    }

    #[test]
    fn rejects_unknown_register() {
        let err = DriveConfig::parse("t", "1234=5\n").unwrap_err();
        match err {
            ConfigError::UnknownRegister { line, index, .. } => {
                assert_eq!(line, 1);
                assert_eq!(index, 0x1234);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_out_of_range_value() {
        let err = DriveConfig::parse("t", "6083=-5\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValueRange { value: -5, .. }));
        let err = DriveConfig::parse("t", "60E0=70000\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValueRange { value: 70000, .. }));
    }
}
