//! Cache flush: erase reconciliation and write-back
//!
//! Committing the write-set has to cope with devices that behave like NOR
//! flash, where a plain write can clear bits but never set them. Rather than
//! trusting the part database to know, the device is probed: for each
//! memory, one dirty page that would need a 0→1 transition (the litmus page)
//! is written plainly and read back. If the bits stuck, plain writes are
//! used throughout; if not, the page is retried behind a page erase; if that
//! is unavailable or still wrong, the only remaining tool is a full chip
//! erase, executed once for the whole device.
//!
//! Erase behavior is assumed uniform across a memory's pages, so the litmus
//! result is applied to every dirty page without re-probing each one; the
//! alternative would multiply device round-trips for no practical gain.
//!
//! Memories are processed flash first, then EEPROM, pages in ascending
//! order, in every phase. This matters: a chip-erase decision reached while
//! probing flash changes how EEPROM is subsequently handled, and EEPROM
//! write-back after a chip erase must happen after the erase call.

use crate::cache::memcache::{base_memory, boot_region_start, CacheSession, MemoryCache, ERASED};
use crate::cache::paged;
use crate::error::{Error, Result};
use crate::part::{Memory, MemoryKind, Part};
use crate::programmer::{Capabilities, Programmer};

/// Progress callback for the flush phases
///
/// Purely informational; correctness does not depend on it.
pub trait FlushProgress {
    /// Reading phase starts: `total` pages will be fetched
    fn reading(&mut self, total: usize);
    /// `done` of the announced pages have been fetched
    fn read_progress(&mut self, done: usize);
    /// Erasing phase starts: `total` pages will be erased
    fn erasing(&mut self, total: usize);
    /// `done` of the announced pages have been erased
    fn erase_progress(&mut self, done: usize);
    /// Writing phase starts: `total` pages will be written
    fn writing(&mut self, total: usize);
    /// `done` of the announced pages have been written and verified
    fn write_progress(&mut self, done: usize);
    /// The flush finished successfully
    fn complete(&mut self, stats: &FlushStats);
}

/// A no-op progress reporter
pub struct NoProgress;

impl FlushProgress for NoProgress {
    fn reading(&mut self, _total: usize) {}
    fn read_progress(&mut self, _done: usize) {}
    fn erasing(&mut self, _total: usize) {}
    fn erase_progress(&mut self, _done: usize) {}
    fn writing(&mut self, _total: usize) {}
    fn write_progress(&mut self, _done: usize) {}
    fn complete(&mut self, _stats: &FlushStats) {}
}

/// What a flush actually did
#[derive(Debug, Clone, Default)]
pub struct FlushStats {
    /// Pages fetched from the device
    pub pages_read: usize,
    /// Pages erased individually
    pub pages_erased: usize,
    /// Pages written and verified
    pub pages_written: usize,
    /// Whether a full chip erase was performed
    pub chip_erased: bool,
}

impl FlushStats {
    /// Whether the flush changed the device at all
    pub fn modified(&self) -> bool {
        self.chip_erased || self.pages_erased > 0 || self.pages_written > 0
    }
}

/// Erase handling chosen for one memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EraseStrategy {
    /// Plain page writes suffice
    Plain,
    /// Every dirty page is erased before its write
    PageErase,
}

/// Fixed processing order of the cacheable memories
const KINDS: [MemoryKind; 2] = [MemoryKind::Flash, MemoryKind::Eeprom];

/// Write one page from the cache and verify it by reading back
///
/// `device_copy` is updated from the read-back either way, so a failed
/// attempt leaves accurate bookkeeping: the page stays dirty.
fn write_page_checked<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    base: &Memory,
    cache: &mut MemoryCache,
    page: usize,
) -> Result<bool> {
    let addr = page as u32 * cache.page_size;
    let r = cache.page_range(page);
    let want = cache.content[r.clone()].to_vec();

    paged::write_page(pgm, part, base, addr, &want)?;
    let got = paged::read_page(pgm, part, base, addr)?;

    let ok = got == want;
    cache.device_copy[r].copy_from_slice(&got);
    Ok(ok)
}

fn verify_error(base: &Memory, cache: &MemoryCache, page: usize) -> Error {
    let r = cache.page_range(page);
    let start = r.start;
    for (i, (&c, &d)) in cache.content[r.clone()]
        .iter()
        .zip(&cache.device_copy[r])
        .enumerate()
    {
        if c != d {
            return Error::VerificationMismatch {
                memory: base.name.clone(),
                addr: (start + i) as u32,
                expected: c,
                found: d,
            };
        }
    }
    Error::VerificationMismatch {
        memory: base.name.clone(),
        addr: start as u32,
        expected: 0,
        found: 0,
    }
}

/// Reconcile every cache with the device
pub(crate) fn run<P: Programmer + ?Sized, R: FlushProgress + ?Sized>(
    session: &mut CacheSession,
    pgm: &mut P,
    part: &Part,
    progress: &mut R,
) -> Result<()> {
    let mut stats = FlushStats::default();

    // scan: nothing dirty, nothing to do
    let mut any_dirty = false;
    for kind in KINDS {
        if let Some(cache) = session.slot_mut(kind).as_ref() {
            any_dirty |= !cache.dirty_pages().is_empty();
        }
    }
    if !any_dirty {
        progress.complete(&stats);
        return Ok(());
    }

    // probe: decide the erase strategy per memory via its litmus page
    let mut strategy = [EraseStrategy::Plain; 2];
    let mut need_chip_erase = false;
    for (i, kind) in KINDS.into_iter().enumerate() {
        let Some(cache) = session.slot_mut(kind).as_mut() else {
            continue;
        };
        let base = base_memory(part, kind)?;

        let Some(litmus) = cache
            .dirty_pages()
            .into_iter()
            .find(|&p| cache.page_needs_set_bit(p))
        else {
            // all pending writes only clear bits; plain writes work even on
            // NOR-like devices
            continue;
        };

        if write_page_checked(pgm, part, base, cache, litmus)? {
            log::debug!("{}: plain write sticks, no erase needed", base.name);
            continue;
        }

        if pgm.capabilities().contains(Capabilities::PAGE_ERASE) && base.page_size > 1 {
            let addr = litmus as u32 * cache.page_size;
            pgm.page_erase(part, base, addr)?;
            stats.pages_erased += 1;
            if write_page_checked(pgm, part, base, cache, litmus)? {
                log::debug!("{}: using page erase before write", base.name);
                strategy[i] = EraseStrategy::PageErase;
                continue;
            }
        }

        log::debug!("{}: falling back to chip erase", base.name);
        need_chip_erase = true;
    }

    if need_chip_erase {
        // After the erase, the cache is the only record of what the
        // untouched parts of the device contained; complete it first.
        let mut to_read = 0;
        for kind in KINDS {
            if let Some(cache) = session.slot_mut(kind).as_ref() {
                to_read += cache.page_loaded.iter().filter(|&&l| !l).count();
            }
        }
        if to_read > 0 {
            progress.reading(to_read);
        }
        for kind in KINDS {
            let Some(cache) = session.slot_mut(kind).as_mut() else {
                continue;
            };
            let base = base_memory(part, kind)?;
            for p in 0..cache.page_count() {
                if !cache.page_loaded[p] {
                    cache.load_page(pgm, part, base, p)?;
                    stats.pages_read += 1;
                    progress.read_progress(stats.pages_read);
                }
            }
        }

        pgm.chip_erase(part)?;
        stats.chip_erased = true;

        if let Some(cache) = session.flash.as_mut() {
            if pgm.capabilities().contains(Capabilities::BOOTLOADER) {
                // A bootloader may refuse to erase itself; read back the
                // estimated boot section instead of assuming it blank.
                let base = base_memory(part, MemoryKind::Flash)?;
                let boot = boot_region_start(part, cache.size, cache.page_size);
                let boot_page = (boot / cache.page_size) as usize;
                for p in 0..cache.page_count() {
                    let r = cache.page_range(p);
                    if p < boot_page {
                        cache.device_copy[r].fill(ERASED);
                    } else {
                        let data =
                            paged::read_page(pgm, part, base, p as u32 * cache.page_size)?;
                        cache.device_copy[r].copy_from_slice(&data);
                        stats.pages_read += 1;
                    }
                }
            } else {
                cache.device_copy.fill(ERASED);
            }
        }

        if let Some(cache) = session.eeprom.as_mut() {
            // Probe whether the chip erase reached the EEPROM at all.
            let probe = (0..cache.page_count()).find(|&p| {
                cache.device_copy[cache.page_range(p)]
                    .iter()
                    .any(|&b| b != ERASED)
            });
            if let Some(p) = probe {
                let base = base_memory(part, MemoryKind::Eeprom)?;
                let data = paged::read_page(pgm, part, base, p as u32 * cache.page_size)?;
                if data.iter().all(|&b| b == ERASED) {
                    cache.device_copy.fill(ERASED);
                }
                // otherwise the EEPROM survived and device_copy is still
                // accurate
            }
        }
    } else {
        // erase phase: page-erase the remaining dirty pages of memories
        // whose litmus page demanded it
        let mut to_erase = 0;
        for (i, kind) in KINDS.into_iter().enumerate() {
            if strategy[i] == EraseStrategy::PageErase {
                if let Some(cache) = session.slot_mut(kind).as_ref() {
                    to_erase += cache.dirty_pages().len();
                }
            }
        }
        if to_erase > 0 {
            progress.erasing(to_erase);
            let mut erased = 0;
            for (i, kind) in KINDS.into_iter().enumerate() {
                if strategy[i] != EraseStrategy::PageErase {
                    continue;
                }
                let Some(cache) = session.slot_mut(kind).as_mut() else {
                    continue;
                };
                let base = base_memory(part, kind)?;
                for p in cache.dirty_pages() {
                    pgm.page_erase(part, base, p as u32 * cache.page_size)?;
                    stats.pages_erased += 1;
                    erased += 1;
                    progress.erase_progress(erased);
                }
            }
        }
    }

    // write phase: commit and verify every remaining dirty page
    let mut to_write = 0;
    for kind in KINDS {
        if let Some(cache) = session.slot_mut(kind).as_ref() {
            to_write += cache.dirty_pages().len();
        }
    }
    if to_write > 0 {
        progress.writing(to_write);
        let mut written = 0;
        for kind in KINDS {
            let Some(cache) = session.slot_mut(kind).as_mut() else {
                continue;
            };
            let base = base_memory(part, kind)?;
            for p in cache.dirty_pages() {
                if !write_page_checked(pgm, part, base, cache, p)? {
                    return Err(verify_error(base, cache, p));
                }
                stats.pages_written += 1;
                written += 1;
                progress.write_progress(written);
            }
        }
    }

    progress.complete(&stats);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testutil::{test_part, MockConfig, MockProgrammer};

    /// flash geometry of `test_part`: 1024 bytes, 64-byte pages
    const FLASH_PAGE: usize = 64;

    #[test]
    fn flush_is_noop_when_clean() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(&part, MockConfig::default());
        let mut session = CacheSession::new();

        session.flush(&mut pgm, &part, &mut NoProgress).unwrap();
        assert_eq!(pgm.counters.paged_writes, 0);
        assert_eq!(pgm.counters.chip_erases, 0);
    }

    #[test]
    fn read_after_write_hits_the_cache() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(&part, MockConfig::default());
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        session.write_byte(&mut pgm, &part, flash, 100, 0x42).unwrap();
        assert_eq!(pgm.counters.paged_loads, 1);

        let v = session.read_byte(&mut pgm, &part, flash, 100).unwrap();
        assert_eq!(v, 0x42);
        // the read was served from the cache
        assert_eq!(pgm.counters.paged_loads, 1);
        assert_eq!(pgm.counters.byte_reads, 0);
    }

    #[test]
    fn at_most_one_load_per_page() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(&part, MockConfig::default());
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        for addr in 128..192 {
            session.read_byte(&mut pgm, &part, flash, addr).unwrap();
            session.write_byte(&mut pgm, &part, flash, addr, 0x00).unwrap();
        }
        assert_eq!(pgm.counters.paged_loads, 1);
    }

    #[test]
    fn flush_is_idempotent() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(&part, MockConfig::default());
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        session.write_byte(&mut pgm, &part, flash, 10, 0x00).unwrap();
        session.flush(&mut pgm, &part, &mut NoProgress).unwrap();
        let writes_after_first = pgm.counters.paged_writes;
        assert!(writes_after_first > 0);

        session.flush(&mut pgm, &part, &mut NoProgress).unwrap();
        assert_eq!(pgm.counters.paged_writes, writes_after_first);
    }

    #[test]
    fn flush_leaves_caches_clean() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(&part, MockConfig::default());
        let flash = part.flash().unwrap();
        let eeprom = part.eeprom().unwrap();
        let mut session = CacheSession::new();

        session.write_byte(&mut pgm, &part, flash, 5, 0x11).unwrap();
        session.write_byte(&mut pgm, &part, flash, 700, 0x22).unwrap();
        session.write_byte(&mut pgm, &part, eeprom, 9, 0x33).unwrap();
        session.flush(&mut pgm, &part, &mut NoProgress).unwrap();

        let cache = session.flash.as_ref().unwrap();
        assert_eq!(cache.content, cache.device_copy);
        assert!(cache.dirty_pages().is_empty());
        assert!(session.eeprom.as_ref().unwrap().dirty_pages().is_empty());

        assert_eq!(pgm.flash()[5], 0x11);
        assert_eq!(pgm.flash()[700], 0x22);
        assert_eq!(pgm.eeprom()[9], 0x33);
    }

    #[test]
    fn clearing_bits_needs_no_erase() {
        // the worked example: flash 1024/64, device page 1 all 0xff, write
        // 0x0f at address 100
        let part = test_part();
        let mut pgm = MockProgrammer::new(&part, MockConfig { nor_like: true, ..Default::default() });
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        session.write_byte(&mut pgm, &part, flash, 100, 0x0f).unwrap();
        assert_eq!(pgm.counters.paged_loads, 1);

        session.flush(&mut pgm, &part, &mut NoProgress).unwrap();

        assert_eq!(pgm.counters.page_erases, 0);
        assert_eq!(pgm.counters.chip_erases, 0);
        assert_eq!(pgm.counters.paged_writes, 1);
        assert_eq!(pgm.flash()[100], 0x0f);
        assert_eq!(session.flash.as_ref().unwrap().device_copy[100], 0x0f);
    }

    #[test]
    fn nor_device_uses_page_erase_not_chip_erase() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(
            &part,
            MockConfig { nor_like: true, page_erase: true, ..Default::default() },
        );
        pgm.flash_mut()[2 * FLASH_PAGE..3 * FLASH_PAGE].fill(0x0f);
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        // 0x0f -> 0xf0 needs bits set
        session
            .write_byte(&mut pgm, &part, flash, 2 * FLASH_PAGE as u32, 0xf0)
            .unwrap();
        session.flush(&mut pgm, &part, &mut NoProgress).unwrap();

        assert_eq!(pgm.counters.page_erases, 1);
        assert_eq!(pgm.counters.chip_erases, 0);
        assert_eq!(pgm.flash()[2 * FLASH_PAGE], 0xf0);
        // the rest of the page came back after the erase
        assert_eq!(pgm.flash()[2 * FLASH_PAGE + 1], 0x0f);
    }

    #[test]
    fn nor_device_without_page_erase_chip_erases_once() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(
            &part,
            MockConfig { nor_like: true, page_erase: false, ..Default::default() },
        );
        // pre-existing content that must survive the chip erase via the cache
        pgm.flash_mut()[0] = 0x12;
        pgm.flash_mut()[130] = 0x0f;
        pgm.eeprom_mut()[0] = 0x55;
        let flash = part.flash().unwrap();
        let eeprom = part.eeprom().unwrap();
        let mut session = CacheSession::new();

        // flash write that needs a set bit, eeprom write that only clears
        session.write_byte(&mut pgm, &part, flash, 130, 0xf0).unwrap();
        session.write_byte(&mut pgm, &part, eeprom, 0, 0x51).unwrap();
        session.flush(&mut pgm, &part, &mut NoProgress).unwrap();

        assert_eq!(pgm.counters.chip_erases, 1);
        assert_eq!(pgm.counters.page_erases, 0);
        assert_eq!(pgm.flash()[130], 0xf0);
        // untouched flash restored from the cache after the erase
        assert_eq!(pgm.flash()[0], 0x12);
        assert_eq!(pgm.eeprom()[0], 0x51);
    }

    #[test]
    fn chip_erase_reports_in_stats() {
        struct Capture(Option<FlushStats>);
        impl FlushProgress for Capture {
            fn reading(&mut self, _t: usize) {}
            fn read_progress(&mut self, _d: usize) {}
            fn erasing(&mut self, _t: usize) {}
            fn erase_progress(&mut self, _d: usize) {}
            fn writing(&mut self, _t: usize) {}
            fn write_progress(&mut self, _d: usize) {}
            fn complete(&mut self, stats: &FlushStats) {
                self.0 = Some(stats.clone());
            }
        }

        let part = test_part();
        let mut pgm = MockProgrammer::new(
            &part,
            MockConfig { nor_like: true, page_erase: false, ..Default::default() },
        );
        pgm.flash_mut()[0] = 0x0f;
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();
        session.write_byte(&mut pgm, &part, flash, 0, 0xf0).unwrap();

        let mut capture = Capture(None);
        session.flush(&mut pgm, &part, &mut capture).unwrap();
        let stats = capture.0.unwrap();
        assert!(stats.chip_erased);
        assert!(stats.modified());
        assert!(stats.pages_written > 0);
    }

    #[test]
    fn out_of_range_read_flushes_and_returns_zero() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(&part, MockConfig::default());
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        session.write_byte(&mut pgm, &part, flash, 0, 0x00).unwrap();
        let v = session.read_byte(&mut pgm, &part, flash, flash.size).unwrap();
        assert_eq!(v, 0);
        assert_eq!(pgm.flash()[0], 0x00);
        assert!(session.flash.as_ref().unwrap().dirty_pages().is_empty());
    }

    #[test]
    fn out_of_range_read_propagates_flush_failure() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(
            &part,
            MockConfig { fail_paged_write: true, ..Default::default() },
        );
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        session.write_byte(&mut pgm, &part, flash, 0, 0x00).unwrap();
        assert!(session.read_byte(&mut pgm, &part, flash, flash.size).is_err());
    }

    #[test]
    fn failed_flush_keeps_dirty_pages_for_retry() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(
            &part,
            MockConfig { fail_paged_write: true, ..Default::default() },
        );
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        session.write_byte(&mut pgm, &part, flash, 40, 0x00).unwrap();
        assert!(session.flush(&mut pgm, &part, &mut NoProgress).is_err());
        assert!(!session.flash.as_ref().unwrap().dirty_pages().is_empty());

        pgm.cfg.fail_paged_write = false;
        session.flush(&mut pgm, &part, &mut NoProgress).unwrap();
        assert_eq!(pgm.flash()[40], 0x00);
    }

    #[test]
    fn verification_mismatch_is_fatal() {
        let part = test_part();
        // NOR device with no erase at all and a lying chip erase would be a
        // broken device; a plain stuck write is caught by verification
        let mut pgm = MockProgrammer::new(
            &part,
            MockConfig { nor_like: true, page_erase: false, lying_chip_erase: true, ..Default::default() },
        );
        pgm.flash_mut()[0] = 0x0f;
        let flash = part.flash().unwrap();
        let mut session = CacheSession::new();

        session.write_byte(&mut pgm, &part, flash, 0, 0xf0).unwrap();
        let err = session.flush(&mut pgm, &part, &mut NoProgress).unwrap_err();
        assert!(matches!(err, Error::VerificationMismatch { .. }));
    }

    #[test]
    fn alias_memory_shares_the_flash_cache() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(&part, MockConfig::default());
        let flash = part.flash().unwrap();
        let boot = part.memory("boot").unwrap();
        let mut session = CacheSession::new();

        session.write_byte(&mut pgm, &part, boot, 0, 0x7e).unwrap();
        let v = session
            .read_byte(&mut pgm, &part, flash, boot.offset)
            .unwrap();
        assert_eq!(v, 0x7e);
        assert_eq!(pgm.counters.paged_loads, 1);
    }

    #[test]
    fn page_size_disagreement_is_a_hard_error() {
        let mut part = test_part();
        // corrupt the alias definition
        if let Some(m) = part.memories.iter_mut().find(|m| m.name == "boot") {
            m.page_size = 32;
        }
        let mut pgm = MockProgrammer::new(&part, MockConfig::default());
        let flash = part.flash().unwrap();
        let boot = part.memory("boot").unwrap();
        let mut session = CacheSession::new();

        session.write_byte(&mut pgm, &part, flash, 0, 0x00).unwrap();
        let err = session
            .read_byte(&mut pgm, &part, boot, 0)
            .unwrap_err();
        assert!(matches!(err, Error::IncompatibleGeometry { .. }));
    }

    #[test]
    fn non_cacheable_memory_goes_direct() {
        let part = test_part();
        let mut pgm = MockProgrammer::new(&part, MockConfig::default());
        let lfuse = part.memory("lfuse").unwrap();
        let mut session = CacheSession::new();

        session.write_byte(&mut pgm, &part, lfuse, 0, 0x62).unwrap();
        let v = session.read_byte(&mut pgm, &part, lfuse, 0).unwrap();
        assert_eq!(v, 0x62);
        assert_eq!(pgm.counters.byte_reads, 1);
        assert_eq!(pgm.counters.byte_writes, 1);
        assert_eq!(pgm.counters.paged_loads, 0);
        assert!(session.flash.is_none());
    }
}
