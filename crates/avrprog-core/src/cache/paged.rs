//! Paged access policy
//!
//! Decides whether a (programmer, memory) pair can be accessed page-wise and
//! provides page read/write built on whatever primitives the programmer has.
//! A degenerate page size of 1 is allowed and handled with the byte
//! primitives, so callers never special-case it.

use crate::error::Result;
use crate::part::{Memory, Part};
use crate::programmer::{Capabilities, Programmer};

/// Whether a memory can be accessed page-wise through this programmer
///
/// Requires both paged primitives, a power-of-two page size, a total size
/// that is an exact multiple of it, and a cacheable (flash- or EEPROM-like)
/// memory kind.
pub fn has_paged_access<P: Programmer + ?Sized>(pgm: &P, mem: &Memory) -> bool {
    pgm.capabilities()
        .contains(Capabilities::PAGED_LOAD | Capabilities::PAGED_WRITE)
        && mem.page_size > 0
        && mem.page_size.is_power_of_two()
        && mem.size > 0
        && mem.size % mem.page_size == 0
        && mem.kind.is_cacheable()
}

/// Read the page containing `addr`
///
/// If the paged primitive fails, falls back transparently to reading every
/// byte of the page individually; only if that also fails is an error
/// propagated.
pub fn read_page<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    mem: &Memory,
    addr: u32,
) -> Result<Vec<u8>> {
    let base = addr - addr % mem.page_size;

    if mem.page_size == 1 {
        return Ok(vec![pgm.read_byte(part, mem, base)?]);
    }

    let mut buf = vec![0u8; mem.page_size as usize];
    match pgm.paged_load(part, mem, mem.page_size, base, &mut buf) {
        Ok(()) => Ok(buf),
        Err(e) => {
            log::debug!(
                "paged load of {} page at 0x{:04x} failed ({}), falling back to byte reads",
                mem.name,
                base,
                e
            );
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = pgm.read_byte(part, mem, base + i as u32)?;
            }
            Ok(buf)
        }
    }
}

/// Write the page containing `addr`
///
/// `data` must be exactly one page. Unlike reads, there is no byte-wise
/// fallback: a failing paged write propagates.
pub fn write_page<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    mem: &Memory,
    addr: u32,
    data: &[u8],
) -> Result<()> {
    let base = addr - addr % mem.page_size;

    if mem.page_size == 1 {
        return pgm.write_byte(part, mem, base, data[0]);
    }

    pgm.paged_write(part, mem, mem.page_size, base, data)
}
