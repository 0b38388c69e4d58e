//! Programmer registry and initialization
//!
//! Opens programmers by a `name` or `name:key=value,...` specification and
//! hides the concrete driver types behind `Box<dyn Programmer>`.

use std::collections::HashMap;

use avrprog_core::part::Part;
use avrprog_core::programmer::Programmer;
use thiserror::Error;

#[cfg(feature = "dummy")]
use avrprog_dummy::{DummyAvr, DummyConfig};

/// Errors opening a programmer
#[derive(Debug, Error)]
pub enum OpenError {
    /// The name doesn't match any compiled-in programmer
    #[error("unknown programmer \"{0}\" (see list-programmers)")]
    Unknown(String),
    /// A `key=value` parameter was malformed or not understood
    #[error("invalid programmer parameter: {0}")]
    InvalidParameter(String),
}

/// Information about a programmer
pub struct ProgrammerInfo {
    /// Name of the programmer
    pub name: &'static str,
    /// Description
    pub description: &'static str,
}

/// All compiled-in programmers
pub const PROGRAMMERS: &[ProgrammerInfo] = &[
    #[cfg(feature = "dummy")]
    ProgrammerInfo {
        name: "dummy",
        description: "In-memory part emulator (params: nor, paged, page_erase, bootloader, erase_eeprom)",
    },
];

/// Comma-separated programmer names for help text
pub fn programmer_names_short() -> String {
    PROGRAMMERS
        .iter()
        .map(|p| p.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parsed programmer specification
pub struct ProgrammerParams {
    /// Programmer name
    pub name: String,
    /// Key-value parameters
    pub params: HashMap<String, String>,
}

/// Parse a programmer string into name and parameters
///
/// Format: `name` or `name:key1=value1,key2=value2`.
pub fn parse_programmer_params(s: &str) -> Result<ProgrammerParams, OpenError> {
    let (name, opts_str) = s.split_once(':').unwrap_or((s, ""));

    let mut params = HashMap::new();
    if !opts_str.is_empty() {
        for opt in opts_str.split(',') {
            if let Some((key, value)) = opt.split_once('=') {
                params.insert(key.to_string(), value.to_string());
            } else {
                return Err(OpenError::InvalidParameter(format!(
                    "'{opt}' (expected key=value)"
                )));
            }
        }
    }

    Ok(ProgrammerParams {
        name: name.to_string(),
        params,
    })
}

/// Open a programmer by specification
pub fn open_programmer(spec: &str, part: &Part) -> Result<Box<dyn Programmer>, OpenError> {
    let parsed = parse_programmer_params(spec)?;

    match parsed.name.as_str() {
        #[cfg(feature = "dummy")]
        "dummy" => {
            let cfg = dummy_config(&parsed.params)?;
            Ok(Box::new(DummyAvr::with_config(part, cfg)))
        }
        _ => {
            let _ = part;
            Err(OpenError::Unknown(parsed.name))
        }
    }
}

#[cfg(feature = "dummy")]
fn parse_bool(key: &str, value: &str) -> Result<bool, OpenError> {
    match value {
        "yes" | "true" | "1" | "on" => Ok(true),
        "no" | "false" | "0" | "off" => Ok(false),
        _ => Err(OpenError::InvalidParameter(format!(
            "{key}={value} (expected yes/no)"
        ))),
    }
}

#[cfg(feature = "dummy")]
fn dummy_config(params: &HashMap<String, String>) -> Result<DummyConfig, OpenError> {
    let mut cfg = DummyConfig::default();
    for (key, value) in params {
        match key.as_str() {
            "nor" => cfg.nor_like = parse_bool(key, value)?,
            "paged" => cfg.paged = parse_bool(key, value)?,
            "page_erase" => cfg.page_erase = parse_bool(key, value)?,
            "bootloader" => cfg.bootloader = parse_bool(key, value)?,
            "erase_eeprom" => cfg.erase_clears_eeprom = parse_bool(key, value)?,
            _ => {
                return Err(OpenError::InvalidParameter(format!(
                    "unknown key \"{key}\" for dummy"
                )))
            }
        }
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_spec_with_params() {
        let p = parse_programmer_params("dummy:nor=no,page_erase=yes").unwrap();
        assert_eq!(p.name, "dummy");
        assert_eq!(p.params.get("nor").map(String::as_str), Some("no"));
        assert_eq!(p.params.get("page_erase").map(String::as_str), Some("yes"));
    }

    #[test]
    fn parse_spec_rejects_bare_key() {
        assert!(parse_programmer_params("dummy:nor").is_err());
    }
}
