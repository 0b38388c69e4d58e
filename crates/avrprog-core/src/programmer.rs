//! Programmer trait definitions
//!
//! A programmer driver talks to one piece of in-circuit programming hardware
//! (a serial bootloader, a JTAG ICE, a USB dongle) and exposes byte- and
//! page-level primitives over it. All calls are synchronous blocking
//! round-trips; timeouts are the transport's concern.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::part::{Memory, Part};

bitflags! {
    /// Optional capabilities a programmer may support
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// Can read a whole page in one transaction
        const PAGED_LOAD  = 1 << 0;
        /// Can write a whole page in one transaction
        const PAGED_WRITE = 1 << 1;
        /// Can erase a single page
        const PAGE_ERASE  = 1 << 2;
        /// Serves a self-programming bootloader
        ///
        /// Such a programmer runs from the device's own flash and cannot
        /// erase the region it occupies; chip-erase handling must not assume
        /// the whole flash reads back blank afterwards.
        const BOOTLOADER  = 1 << 3;
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::empty()
    }
}

/// Programmer driver contract
///
/// `read_byte`, `write_byte` and `chip_erase` are mandatory; the paged
/// primitives and `page_erase` are optional and advertised through
/// [`Capabilities`]. Page primitives operate on caller-owned slices; a
/// driver must not retain or publish them.
pub trait Programmer {
    /// The optional capabilities this programmer supports
    fn capabilities(&self) -> Capabilities;

    /// Read one byte from a memory
    fn read_byte(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<u8>;

    /// Write one byte to a memory
    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: u32, value: u8) -> Result<()>;

    /// Read `buf.len()` bytes starting at the page base `base`
    ///
    /// Only called when `PAGED_LOAD` is advertised; `base` is page-aligned
    /// and `buf` is exactly `page_size` long.
    fn paged_load(
        &mut self,
        _part: &Part,
        _mem: &Memory,
        _page_size: u32,
        _base: u32,
        _buf: &mut [u8],
    ) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Write one page starting at the page base `base`
    fn paged_write(
        &mut self,
        _part: &Part,
        _mem: &Memory,
        _page_size: u32,
        _base: u32,
        _data: &[u8],
    ) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Erase the page containing `addr`
    fn page_erase(&mut self, _part: &Part, _mem: &Memory, _addr: u32) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Erase every erasable memory of the device at once
    fn chip_erase(&mut self, part: &Part) -> Result<()>;
}

impl Programmer for Box<dyn Programmer> {
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn read_byte(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<u8> {
        (**self).read_byte(part, mem, addr)
    }

    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: u32, value: u8) -> Result<()> {
        (**self).write_byte(part, mem, addr, value)
    }

    fn paged_load(
        &mut self,
        part: &Part,
        mem: &Memory,
        page_size: u32,
        base: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        (**self).paged_load(part, mem, page_size, base, buf)
    }

    fn paged_write(
        &mut self,
        part: &Part,
        mem: &Memory,
        page_size: u32,
        base: u32,
        data: &[u8],
    ) -> Result<()> {
        (**self).paged_write(part, mem, page_size, base, data)
    }

    fn page_erase(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<()> {
        (**self).page_erase(part, mem, addr)
    }

    fn chip_erase(&mut self, part: &Part) -> Result<()> {
        (**self).chip_erase(part)
    }
}

/// Read the device signature and compare it against the part definition
pub fn verify_signature<P: Programmer + ?Sized>(pgm: &mut P, part: &Part) -> Result<()> {
    let mem = part
        .signature_memory()
        .ok_or_else(|| Error::NoSuchMemory("signature".to_string()))?;

    let mut found = [0u8; 3];
    for (i, byte) in found.iter_mut().enumerate() {
        *byte = pgm.read_byte(part, mem, i as u32)?;
    }

    if found != part.signature {
        return Err(Error::SignatureMismatch {
            part: part.name.clone(),
            expected: part.signature,
            found,
        });
    }
    log::debug!("device signature matches {}", part.name);
    Ok(())
}
