//! Symbolic configuration bitfield access
//!
//! Fuse and lock bytes pack several named bitfields ("BODLEVEL",
//! "SUT_CKSEL", ...). This module resolves a name to its [`ConfigItem`] and
//! reads or rewrites just that field. Access is deliberately uncached and
//! goes byte-by-byte through the direct programmer primitives: fuses are
//! single-shot and mis-setting them can brick a device, so writes are never
//! deferred or batched.

use crate::error::{Error, Result};
use crate::part::{ConfigItem, Part};
use crate::programmer::Programmer;

/// Case-insensitive prefix matcher, the default for command-line lookups
pub fn prefix_match(pattern: &str, name: &str) -> bool {
    name.to_lowercase().starts_with(&pattern.to_lowercase())
}

/// Case-insensitive exact matcher
pub fn exact_match(pattern: &str, name: &str) -> bool {
    pattern.eq_ignore_ascii_case(name)
}

/// Locate exactly one configuration item by name
///
/// An exact full-name match wins immediately regardless of the matcher;
/// otherwise the matcher-satisfying entries are collected and the lookup
/// only succeeds if there is exactly one. Zero and several matches are
/// distinguished for user-facing diagnostics.
pub fn locate<'a, M>(items: &'a [ConfigItem], name: &str, matcher: M) -> Result<&'a ConfigItem>
where
    M: Fn(&str, &str) -> bool,
{
    if let Some(item) = items.iter().find(|it| it.name.eq_ignore_ascii_case(name)) {
        return Ok(item);
    }

    let hits: Vec<&ConfigItem> = items.iter().filter(|it| matcher(name, &it.name)).collect();
    match hits.as_slice() {
        [] => Err(Error::UnknownConfig(name.to_string())),
        [item] => Ok(item),
        _ => Err(Error::AmbiguousConfig {
            name: name.to_string(),
            candidates: hits.iter().map(|it| it.name.clone()).collect(),
        }),
    }
}

/// All configuration items satisfying the matcher, without the uniqueness
/// requirement
pub fn matches<'a, M>(items: &'a [ConfigItem], name: &str, matcher: M) -> Vec<&'a ConfigItem>
where
    M: Fn(&str, &str) -> bool,
{
    items.iter().filter(|it| matcher(name, &it.name)).collect()
}

/// Read the raw memory value underlying a configuration item (1-4 bytes,
/// composed little-endian)
fn read_raw<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    item: &ConfigItem,
) -> Result<(u32, u32)> {
    let mem = part
        .memory(&item.memory)
        .ok_or_else(|| Error::NoSuchMemory(item.memory.clone()))?;
    let n = mem.size.min(4);

    let mut raw = 0u32;
    for i in 0..n {
        raw |= u32::from(pgm.read_byte(part, mem, i)?) << (8 * i);
    }
    Ok((raw, n))
}

/// Get the current value of a configuration bitfield
pub fn get_value<P: Programmer + ?Sized>(pgm: &mut P, part: &Part, name: &str) -> Result<u32> {
    let item = locate(&part.config, name, prefix_match)?;
    let (raw, _) = read_raw(pgm, part, item)?;
    Ok((raw & item.mask) >> item.shift)
}

/// Set a configuration bitfield
///
/// Bits of `value` that do not fit the field's mask are dropped with a
/// warning. Only bytes that actually change are written, so re-applying the
/// current value is a no-op on the device.
pub fn set_value<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    name: &str,
    value: u32,
) -> Result<()> {
    let item = locate(&part.config, name, prefix_match)?;
    let (raw, n) = read_raw(pgm, part, item)?;

    if (value << item.shift) & !item.mask != 0 {
        log::warn!(
            "value 0x{:x} exceeds the {} field (mask 0x{:02x}), excess bits dropped",
            value,
            item.name,
            item.mask
        );
    }

    let new = (raw & !item.mask) | ((value << item.shift) & item.mask);
    if new == raw {
        log::debug!("{} already set to 0x{:x}", item.name, value);
        return Ok(());
    }

    let mem = part
        .memory(&item.memory)
        .ok_or_else(|| Error::NoSuchMemory(item.memory.clone()))?;
    for i in 0..n {
        let old_byte = (raw >> (8 * i)) as u8;
        let new_byte = (new >> (8 * i)) as u8;
        if old_byte != new_byte {
            pgm.write_byte(part, mem, i, new_byte)?;
        }
    }
    Ok(())
}

/// Resolve a value given on the command line: a number, or one of the
/// item's symbolic value names
pub fn resolve_value(item: &ConfigItem, text: &str) -> Result<u32> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        if let Ok(v) = u32::from_str_radix(hex, 16) {
            return Ok(v);
        }
    } else if let Ok(v) = text.parse::<u32>() {
        return Ok(v);
    }

    if let Some(v) = item.values.iter().find(|v| v.name.eq_ignore_ascii_case(text)) {
        return Ok(v.value);
    }

    let hits: Vec<_> = item
        .values
        .iter()
        .filter(|v| prefix_match(text, &v.name))
        .collect();
    match hits.as_slice() {
        [v] => Ok(v.value),
        _ => Err(Error::UnknownConfigValue {
            item: item.name.clone(),
            value: text.to_string(),
        }),
    }
}

/// The symbolic name of a field value, when the item defines one
pub fn value_name(item: &ConfigItem, value: u32) -> Option<&str> {
    item.values
        .iter()
        .find(|v| v.value == value)
        .map(|v| v.name.as_str())
}
