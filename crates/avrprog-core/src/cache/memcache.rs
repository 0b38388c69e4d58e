//! Page-granularity memory cache
//!
//! One [`MemoryCache`] shadows one cacheable device memory (flash or
//! EEPROM): the current, possibly modified view in `content`, the last
//! content known to be on the device in `device_copy`, and a per-page map of
//! which pages have actually been read. Byte writes only ever touch the
//! cache; nothing reaches the device until [`CacheSession::flush`] runs the
//! reconciliation in [`super::flush`].

use crate::cache::flush::{self, FlushProgress, NoProgress};
use crate::cache::paged;
use crate::error::{Error, Result};
use crate::part::{Memory, MemoryKind, Part};
use crate::programmer::{Capabilities, Programmer};

/// Value all erasable memories read back after an erase
pub(crate) const ERASED: u8 = 0xff;

/// Shadow copy of one device memory plus page bookkeeping
#[derive(Debug)]
pub struct MemoryCache {
    pub(crate) size: u32,
    pub(crate) page_size: u32,
    /// Device-address of cache index 0 (the canonical memory's offset)
    pub(crate) offset: u32,
    /// Current, possibly modified view
    pub(crate) content: Vec<u8>,
    /// Last content known to be on the device
    ///
    /// Only updated from an actual device read or a confirmed write.
    pub(crate) device_copy: Vec<u8>,
    /// Whether `content`/`device_copy` of a page reflect a device read
    pub(crate) page_loaded: Vec<bool>,
}

impl MemoryCache {
    fn new(base: &Memory) -> Self {
        let size = base.size as usize;
        Self {
            size: base.size,
            page_size: base.page_size,
            offset: base.offset,
            content: vec![0; size],
            device_copy: vec![0; size],
            page_loaded: vec![false; (base.size / base.page_size) as usize],
        }
    }

    pub(crate) fn page_count(&self) -> usize {
        self.page_loaded.len()
    }

    pub(crate) fn page_range(&self, page: usize) -> std::ops::Range<usize> {
        let ps = self.page_size as usize;
        page * ps..(page + 1) * ps
    }

    /// A page is dirty when it has been loaded and modified since
    pub(crate) fn page_dirty(&self, page: usize) -> bool {
        let r = self.page_range(page);
        self.page_loaded[page] && self.content[r.clone()] != self.device_copy[r]
    }

    pub(crate) fn dirty_pages(&self) -> Vec<usize> {
        (0..self.page_count()).filter(|&p| self.page_dirty(p)).collect()
    }

    /// Whether committing this page would set any bit from 0 to 1
    ///
    /// On a NOR-like memory such a page cannot be committed by a plain
    /// write; it is the litmus test for needing an erase strategy.
    pub(crate) fn page_needs_set_bit(&self, page: usize) -> bool {
        let r = self.page_range(page);
        self.content[r.clone()]
            .iter()
            .zip(&self.device_copy[r])
            .any(|(&c, &d)| c & !d != 0)
    }

    /// Fetch a page from the device unless it is already loaded
    pub(crate) fn load_page<P: Programmer + ?Sized>(
        &mut self,
        pgm: &mut P,
        part: &Part,
        base: &Memory,
        page: usize,
    ) -> Result<()> {
        if self.page_loaded[page] {
            return Ok(());
        }
        let addr = page as u32 * self.page_size;
        let data = paged::read_page(pgm, part, base, addr)?;
        let r = self.page_range(page);
        self.content[r.clone()].copy_from_slice(&data);
        self.device_copy[r].copy_from_slice(&data);
        self.page_loaded[page] = true;
        Ok(())
    }

    /// Mark a page as known-erased without a device round-trip
    pub(crate) fn preset_erased(&mut self, page: usize) {
        let r = self.page_range(page);
        self.content[r.clone()].fill(ERASED);
        self.device_copy[r].fill(ERASED);
        self.page_loaded[page] = true;
    }
}

/// The caches of one programming session
///
/// Owned by whatever represents the active session; caches are allocated
/// lazily on the first cached access to their memory and dropped by
/// [`reset`](Self::reset). There is exactly one cache per cacheable memory
/// kind.
#[derive(Debug, Default)]
pub struct CacheSession {
    pub(crate) flash: Option<MemoryCache>,
    pub(crate) eeprom: Option<MemoryCache>,
}

/// The canonical memory whose geometry defines the cache for a kind
pub(crate) fn base_memory(part: &Part, kind: MemoryKind) -> Result<&Memory> {
    let base = match kind {
        MemoryKind::Flash => part.flash(),
        MemoryKind::Eeprom => part.eeprom(),
        _ => None,
    };
    base.ok_or_else(|| Error::NoSuchMemory(format!("{kind:?}").to_lowercase()))
}

impl CacheSession {
    /// Create a session with no caches allocated
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn slot_mut(&mut self, kind: MemoryKind) -> &mut Option<MemoryCache> {
        match kind {
            MemoryKind::Eeprom => &mut self.eeprom,
            _ => &mut self.flash,
        }
    }

    /// Allocate the cache for `mem` if needed and translate `addr` into it
    ///
    /// Alias memories translate through their offset relative to the
    /// canonical memory. Geometry disagreements are part-definition defects
    /// and come back as hard errors.
    fn prepare<'s, 'p>(
        &'s mut self,
        part: &'p Part,
        mem: &Memory,
        addr: u32,
    ) -> Result<(&'s mut MemoryCache, &'p Memory, usize)> {
        if !mem.kind.is_cacheable() {
            return Err(Error::IncompatibleGeometry {
                memory: mem.name.clone(),
                detail: "memory kind is not cacheable".to_string(),
            });
        }
        let base = base_memory(part, mem.kind)?;
        let cache = self
            .slot_mut(mem.kind)
            .get_or_insert_with(|| MemoryCache::new(base));

        if mem.page_size != cache.page_size {
            return Err(Error::IncompatibleGeometry {
                memory: mem.name.clone(),
                detail: format!(
                    "page size {} disagrees with cache page size {}",
                    mem.page_size, cache.page_size
                ),
            });
        }

        let idx = i64::from(addr) + i64::from(mem.offset) - i64::from(cache.offset);
        if idx < 0 || idx >= i64::from(cache.size) {
            return Err(Error::IncompatibleGeometry {
                memory: mem.name.clone(),
                detail: format!("translated address 0x{idx:x} outside cache"),
            });
        }

        Ok((cache, base, idx as usize))
    }

    /// Read one byte through the cache
    ///
    /// Memories without paged access go straight to the byte primitive. An
    /// address past the end of the memory is the historical "synchronize
    /// now" sentinel: all caches are flushed and the read reports 0.
    pub fn read_byte<P: Programmer + ?Sized>(
        &mut self,
        pgm: &mut P,
        part: &Part,
        mem: &Memory,
        addr: u32,
    ) -> Result<u8> {
        if !paged::has_paged_access(pgm, mem) {
            return pgm.read_byte(part, mem, addr);
        }
        if addr >= mem.size {
            log::debug!("read past end of {} (0x{:04x}), flushing caches", mem.name, addr);
            self.flush(pgm, part, &mut NoProgress)?;
            return Ok(0);
        }

        let (cache, base, idx) = self.prepare(part, mem, addr)?;
        let page = idx / cache.page_size as usize;
        cache.load_page(pgm, part, base, page)?;
        Ok(cache.content[idx])
    }

    /// Write one byte through the cache
    ///
    /// Purely in-memory apart from the page load that seeds the containing
    /// page; the device is only touched by [`flush`](Self::flush). The
    /// out-of-range sentinel commits instead of writing, like the read path.
    pub fn write_byte<P: Programmer + ?Sized>(
        &mut self,
        pgm: &mut P,
        part: &Part,
        mem: &Memory,
        addr: u32,
        value: u8,
    ) -> Result<()> {
        if !paged::has_paged_access(pgm, mem) {
            return pgm.write_byte(part, mem, addr, value);
        }
        if addr >= mem.size {
            log::debug!("write past end of {} (0x{:04x}), flushing caches", mem.name, addr);
            return self.flush(pgm, part, &mut NoProgress);
        }

        let (cache, base, idx) = self.prepare(part, mem, addr)?;
        let page = idx / cache.page_size as usize;
        cache.load_page(pgm, part, base, page)?;
        cache.content[idx] = value;
        Ok(())
    }

    /// Commit every pending write to the device
    ///
    /// See [`super::flush`] for the reconciliation algorithm. On success all
    /// caches are clean; on failure dirty bookkeeping is kept so the whole
    /// flush can simply be retried.
    pub fn flush<P: Programmer + ?Sized, R: FlushProgress + ?Sized>(
        &mut self,
        pgm: &mut P,
        part: &Part,
        progress: &mut R,
    ) -> Result<()> {
        flush::run(self, pgm, part, progress)
    }

    /// Erase the chip and reconcile the caches with the new device state
    pub fn chip_erase<P: Programmer + ?Sized>(&mut self, pgm: &mut P, part: &Part) -> Result<()> {
        pgm.chip_erase(part)?;

        if let Some(cache) = self.flash.as_mut() {
            if pgm.capabilities().contains(Capabilities::BOOTLOADER) {
                // A bootloader cannot erase the flash it runs from. Pages at
                // or above the estimated boot section are unloaded so the
                // next access reads what is really there.
                let boot = boot_region_start(part, cache.size, cache.page_size);
                let boot_page = (boot / cache.page_size) as usize;
                for p in 0..cache.page_count() {
                    if p < boot_page {
                        cache.preset_erased(p);
                    } else {
                        cache.page_loaded[p] = false;
                    }
                }
            } else {
                for p in 0..cache.page_count() {
                    cache.preset_erased(p);
                }
            }
        }

        if let Some(cache) = self.eeprom.as_mut() {
            // Whether chip erase touches the EEPROM depends on the device
            // and its EESAVE fuse; probe one page that used to hold data.
            let probe = (0..cache.page_count()).find(|&p| {
                cache.page_loaded[p]
                    && cache.device_copy[cache.page_range(p)].iter().any(|&b| b != ERASED)
            });
            match probe {
                Some(p) => {
                    let base = part
                        .eeprom()
                        .ok_or_else(|| Error::NoSuchMemory("eeprom".to_string()))?;
                    let addr = p as u32 * cache.page_size;
                    let data = paged::read_page(pgm, part, base, addr)?;
                    if data.iter().all(|&b| b == ERASED) {
                        for p in 0..cache.page_count() {
                            cache.preset_erased(p);
                        }
                    } else {
                        // EEPROM survived; keep device contents, drop
                        // pending writes
                        let r = cache.page_range(p);
                        cache.device_copy[r].copy_from_slice(&data);
                        let (content, device_copy) = (&mut cache.content, &cache.device_copy);
                        content.copy_from_slice(device_copy);
                    }
                }
                None => {
                    // nothing on the device to probe with; just drop
                    // pending writes
                    let (content, device_copy) = (&mut cache.content, &cache.device_copy);
                    content.copy_from_slice(device_copy);
                }
            }
        }

        Ok(())
    }

    /// Erase a single page and verify it reads back blank
    pub fn page_erase<P: Programmer + ?Sized>(
        &mut self,
        pgm: &mut P,
        part: &Part,
        mem: &Memory,
        addr: u32,
    ) -> Result<()> {
        if !paged::has_paged_access(pgm, mem) {
            return Err(Error::NotSupported);
        }
        if addr >= mem.size {
            return Err(Error::AddressOutOfRange {
                memory: mem.name.clone(),
                addr,
                size: mem.size,
            });
        }

        let (cache, base, idx) = self.prepare(part, mem, addr)?;
        let ps = cache.page_size as usize;
        let page = idx / ps;
        let page_addr = (page * ps) as u32;

        if cache.page_size == 1 {
            pgm.write_byte(part, base, page_addr, ERASED)?;
        } else {
            pgm.page_erase(part, base, page_addr)?;
        }

        cache.page_loaded[page] = false;
        cache.load_page(pgm, part, base, page)?;

        let r = cache.page_range(page);
        if cache.content[r].iter().any(|&b| b != ERASED) {
            return Err(Error::EraseVerifyFailed {
                memory: base.name.clone(),
                addr: page_addr,
            });
        }
        Ok(())
    }

    /// Discard every cache without touching the device
    ///
    /// Abandons pending writes; always succeeds.
    pub fn reset(&mut self) {
        self.flash = None;
        self.eeprom = None;
    }
}

/// Estimated start of the boot section for post-chip-erase handling
///
/// Uses the part's known boot-section geometry when available, otherwise
/// assumes the top 16 KiB (top quarter for small flash), rounded down to a
/// page boundary.
pub(crate) fn boot_region_start(part: &Part, size: u32, page_size: u32) -> u32 {
    let start = match part.boot_start {
        Some(b) if b < size => b,
        _ => {
            if size / 4 >= 16 * 1024 {
                size - 16 * 1024
            } else {
                size - size / 4
            }
        }
    };
    start - start % page_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testutil::{test_part, MockConfig, MockProgrammer};

    #[test]
    fn paged_load_failure_falls_back_to_byte_reads() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(
            &part,
            MockConfig { fail_paged_load: true, ..Default::default() },
        );
        pgm.flash_mut()[65] = 0x77;
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        let v = session.read_byte(&mut pgm, &part, flash, 65).unwrap();
        assert_eq!(v, 0x77);
        // the whole page came in one byte at a time
        assert_eq!(pgm.counters.byte_reads, 64);
    }

    #[test]
    fn chip_erase_presets_flash_to_blank() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(&part, MockConfig::default());
        pgm.flash_mut()[3] = 0x12;
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        assert_eq!(session.read_byte(&mut pgm, &part, flash, 3).unwrap(), 0x12);
        pgm.reset_counters();

        session.chip_erase(&mut pgm, &part).unwrap();
        assert_eq!(pgm.counters.chip_erases, 1);

        // blank state was preset, no re-read needed
        assert_eq!(session.read_byte(&mut pgm, &part, flash, 3).unwrap(), 0xff);
        assert_eq!(pgm.counters.paged_loads, 0);
    }

    #[test]
    fn chip_erase_with_bootloader_rereads_boot_region_only() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(
            &part,
            MockConfig { bootloader: true, ..Default::default() },
        );
        // boot region of the 1 KiB mock flash is its top quarter, 768..1024
        pgm.flash_mut()[960] = 0xaa;
        pgm.flash_mut()[10] = 0x55;
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        // populate the cache so chip_erase has something to reconcile
        session.read_byte(&mut pgm, &part, flash, 10).unwrap();
        session.read_byte(&mut pgm, &part, flash, 960).unwrap();
        session.chip_erase(&mut pgm, &part).unwrap();
        pgm.reset_counters();

        // below the boot region: preset blank, no device read
        assert_eq!(session.read_byte(&mut pgm, &part, flash, 10).unwrap(), 0xff);
        assert_eq!(pgm.counters.paged_loads, 0);

        // inside the boot region: a fresh device read, bootloader survived
        assert_eq!(session.read_byte(&mut pgm, &part, flash, 960).unwrap(), 0xaa);
        assert_eq!(pgm.counters.paged_loads, 1);
    }

    #[test]
    fn chip_erase_detects_eeprom_wipe() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(
            &part,
            MockConfig { erase_clears_eeprom: true, ..Default::default() },
        );
        pgm.eeprom_mut()[8] = 0x42;
        let eeprom = part.eeprom().unwrap();
        let mut session = CacheSession::new();

        assert_eq!(session.read_byte(&mut pgm, &part, eeprom, 8).unwrap(), 0x42);
        session.chip_erase(&mut pgm, &part).unwrap();
        pgm.reset_counters();

        // the probe saw the wipe; the whole cache is preset blank
        assert_eq!(session.read_byte(&mut pgm, &part, eeprom, 8).unwrap(), 0xff);
        assert_eq!(session.read_byte(&mut pgm, &part, eeprom, 200).unwrap(), 0xff);
        assert_eq!(pgm.counters.paged_loads, 0);
    }

    #[test]
    fn chip_erase_keeps_surviving_eeprom_and_drops_pending_writes() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(&part, MockConfig::default());
        pgm.eeprom_mut()[8] = 0x42;
        let eeprom = part.eeprom().unwrap();
        let mut session = CacheSession::new();

        // a pending write that must not survive the erase
        session.write_byte(&mut pgm, &part, eeprom, 8, 0x24).unwrap();
        session.chip_erase(&mut pgm, &part).unwrap();

        assert_eq!(session.read_byte(&mut pgm, &part, eeprom, 8).unwrap(), 0x42);
        session.flush(&mut pgm, &part, &mut NoProgress).unwrap();
        assert_eq!(pgm.eeprom()[8], 0x42);
    }

    #[test]
    fn page_erase_blanks_and_reloads_the_page() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(
            &part,
            MockConfig { page_erase: true, ..Default::default() },
        );
        pgm.flash_mut()[128..192].fill(0x00);
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        session.page_erase(&mut pgm, &part, flash, 130).unwrap();
        assert_eq!(pgm.counters.page_erases, 1);
        assert!(pgm.flash()[128..192].iter().all(|&b| b == 0xff));
        assert_eq!(session.read_byte(&mut pgm, &part, flash, 130).unwrap(), 0xff);
    }

    #[test]
    fn page_erase_reports_a_lying_device() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(
            &part,
            MockConfig { page_erase: true, lying_page_erase: true, ..Default::default() },
        );
        pgm.flash_mut()[128..192].fill(0x00);
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        let err = session.page_erase(&mut pgm, &part, flash, 130).unwrap_err();
        assert!(matches!(err, Error::EraseVerifyFailed { .. }));
    }

    #[test]
    fn page_erase_out_of_range_is_a_hard_error() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(
            &part,
            MockConfig { page_erase: true, ..Default::default() },
        );
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        let err = session
            .page_erase(&mut pgm, &part, flash, flash.size)
            .unwrap_err();
        assert!(matches!(err, Error::AddressOutOfRange { .. }));
    }

    #[test]
    fn reset_discards_pending_writes_without_device_io() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(&part, MockConfig::default());
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        session.write_byte(&mut pgm, &part, flash, 0, 0x00).unwrap();
        pgm.reset_counters();
        session.reset();
        assert!(session.flash.is_none());

        session.flush(&mut pgm, &part, &mut NoProgress).unwrap();
        assert_eq!(pgm.counters.paged_writes, 0);
        assert_eq!(pgm.flash()[0], 0xff);
    }
}
