//! Mock programmer and part fixtures shared by the cache tests

use std::collections::HashMap;

use crate::cache::memcache::boot_region_start;
use crate::error::{Error, Result};
use crate::part::{Memory, MemoryKind, Part};
use crate::programmer::{Capabilities, Programmer};

/// Behavior switches for [`MockProgrammer`]
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Plain writes can only clear bits on flash/EEPROM
    pub nor_like: bool,
    /// Expose the page-erase primitive
    pub page_erase: bool,
    /// Expose the paged load/write primitives
    pub paged: bool,
    /// Pretend to serve a self-programming bootloader
    pub bootloader: bool,
    /// Chip erase wipes the EEPROM too
    pub erase_clears_eeprom: bool,
    /// Paged loads fail (exercises the byte-wise fallback)
    pub fail_paged_load: bool,
    /// Paged writes fail
    pub fail_paged_write: bool,
    /// Page erase succeeds but does nothing
    pub lying_page_erase: bool,
    /// Chip erase succeeds but does nothing
    pub lying_chip_erase: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            nor_like: false,
            page_erase: false,
            paged: true,
            bootloader: false,
            erase_clears_eeprom: false,
            fail_paged_load: false,
            fail_paged_write: false,
            lying_page_erase: false,
            lying_chip_erase: false,
        }
    }
}

/// Operation counters, for asserting how much device I/O happened
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub byte_reads: usize,
    pub byte_writes: usize,
    pub paged_loads: usize,
    pub paged_writes: usize,
    pub page_erases: usize,
    pub chip_erases: usize,
}

/// In-memory device emulation with operation counters
pub struct MockProgrammer {
    pub cfg: MockConfig,
    pub counters: Counters,
    stores: HashMap<String, Vec<u8>>,
}

impl MockProgrammer {
    pub fn new(part: &Part, cfg: MockConfig) -> Self {
        let mut stores = HashMap::new();
        for mem in &part.memories {
            // alias regions share the canonical store
            let canonical = match mem.kind {
                MemoryKind::Flash => "flash",
                MemoryKind::Eeprom => "eeprom",
                _ => mem.name.as_str(),
            };
            if canonical == mem.name {
                let fill = if mem.kind == MemoryKind::Signature { 0 } else { 0xff };
                stores.insert(mem.name.clone(), vec![fill; mem.size as usize]);
            }
        }
        if let Some(sig) = stores.get_mut("signature") {
            sig.copy_from_slice(&part.signature);
        }
        Self { cfg, counters: Counters::default(), stores }
    }

    pub fn flash(&self) -> &[u8] {
        &self.stores["flash"]
    }

    pub fn flash_mut(&mut self) -> &mut Vec<u8> {
        self.stores.get_mut("flash").unwrap()
    }

    pub fn eeprom(&self) -> &[u8] {
        &self.stores["eeprom"]
    }

    pub fn eeprom_mut(&mut self) -> &mut Vec<u8> {
        self.stores.get_mut("eeprom").unwrap()
    }

    pub fn reset_counters(&mut self) {
        self.counters = Counters::default();
    }

    fn resolve(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<(&mut Vec<u8>, usize)> {
        let (key, base_off) = match mem.kind {
            MemoryKind::Flash => ("flash", part.flash().map_or(0, |m| m.offset)),
            MemoryKind::Eeprom => ("eeprom", part.eeprom().map_or(0, |m| m.offset)),
            _ => (mem.name.as_str(), mem.offset),
        };
        let abs = (addr + mem.offset - base_off) as usize;
        let store = self
            .stores
            .get_mut(key)
            .ok_or_else(|| Error::Io(format!("mock has no {key} store")))?;
        if abs >= store.len() {
            return Err(Error::Io(format!("mock {key} access at {abs} out of bounds")));
        }
        Ok((store, abs))
    }
}

impl Programmer for MockProgrammer {
    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::empty();
        if self.cfg.paged {
            caps |= Capabilities::PAGED_LOAD | Capabilities::PAGED_WRITE;
        }
        if self.cfg.page_erase {
            caps |= Capabilities::PAGE_ERASE;
        }
        if self.cfg.bootloader {
            caps |= Capabilities::BOOTLOADER;
        }
        caps
    }

    fn read_byte(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<u8> {
        self.counters.byte_reads += 1;
        let (store, abs) = self.resolve(part, mem, addr)?;
        Ok(store[abs])
    }

    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: u32, value: u8) -> Result<()> {
        self.counters.byte_writes += 1;
        let nor = self.cfg.nor_like && mem.kind.is_cacheable();
        let (store, abs) = self.resolve(part, mem, addr)?;
        if nor {
            store[abs] &= value;
        } else {
            store[abs] = value;
        }
        Ok(())
    }

    fn paged_load(
        &mut self,
        part: &Part,
        mem: &Memory,
        _page_size: u32,
        base: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        self.counters.paged_loads += 1;
        if self.cfg.fail_paged_load {
            return Err(Error::Io("simulated paged load failure".to_string()));
        }
        let len = buf.len();
        let (store, abs) = self.resolve(part, mem, base)?;
        buf.copy_from_slice(&store[abs..abs + len]);
        Ok(())
    }

    fn paged_write(
        &mut self,
        part: &Part,
        mem: &Memory,
        _page_size: u32,
        base: u32,
        data: &[u8],
    ) -> Result<()> {
        self.counters.paged_writes += 1;
        if self.cfg.fail_paged_write {
            return Err(Error::Io("simulated paged write failure".to_string()));
        }
        let nor = self.cfg.nor_like && mem.kind.is_cacheable();
        let (store, abs) = self.resolve(part, mem, base)?;
        for (i, &b) in data.iter().enumerate() {
            if nor {
                store[abs + i] &= b;
            } else {
                store[abs + i] = b;
            }
        }
        Ok(())
    }

    fn page_erase(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<()> {
        self.counters.page_erases += 1;
        if self.cfg.lying_page_erase {
            return Ok(());
        }
        let page_size = mem.page_size as usize;
        let (store, abs) = self.resolve(part, mem, addr)?;
        let start = abs - abs % page_size;
        store[start..start + page_size].fill(0xff);
        Ok(())
    }

    fn chip_erase(&mut self, part: &Part) -> Result<()> {
        self.counters.chip_erases += 1;
        if self.cfg.lying_chip_erase {
            return Ok(());
        }
        if let Some(flash) = part.flash() {
            let keep_from = if self.cfg.bootloader {
                boot_region_start(part, flash.size, flash.page_size) as usize
            } else {
                flash.size as usize
            };
            if let Some(store) = self.stores.get_mut("flash") {
                store[..keep_from].fill(0xff);
            }
        }
        if self.cfg.erase_clears_eeprom {
            if let Some(store) = self.stores.get_mut("eeprom") {
                store.fill(0xff);
            }
        }
        // lock bits come back open after a chip erase
        if let Some(store) = self.stores.get_mut("lock") {
            store.fill(0xff);
        }
        Ok(())
    }
}

/// A small synthetic part: 1 KiB flash in 64-byte pages with a "boot" alias
/// at the top 256 bytes, 256-byte EEPROM in 4-byte pages, one fuse byte and
/// the signature
pub fn test_part() -> Part {
    Part {
        name: "Mock64".to_string(),
        id: "mock64".to_string(),
        signature: [0x1e, 0x90, 0x01],
        boot_start: None,
        memories: vec![
            Memory::new("flash", MemoryKind::Flash, 1024, 64, 0),
            Memory::new("boot", MemoryKind::Flash, 256, 64, 768),
            Memory::new("eeprom", MemoryKind::Eeprom, 256, 4, 0),
            Memory::new("lfuse", MemoryKind::Fuse, 1, 1, 0),
            Memory::new("lock", MemoryKind::Lock, 1, 1, 0),
            Memory::new("signature", MemoryKind::Signature, 3, 1, 0),
        ],
        ops: HashMap::new(),
        config: Vec::new(),
    }
}
