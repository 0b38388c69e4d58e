//! avrprog-dummy - In-memory AVR part emulator
//!
//! This crate provides a dummy programmer that emulates a part's memories in
//! RAM. It's useful for testing and development without real hardware, and
//! its erase/write behavior is configurable so the cache layer's NOR
//! handling, page-erase fallback and bootloader caution can all be exercised
//! from the command line.
//!
//! Where the part database defines serial programming opcodes, byte reads
//! and writes are routed through the opcode codec: the command word is
//! assembled from the bit table, "executed" against the emulated memory, and
//! the response decoded back - the same path a real wire driver takes.

use std::collections::HashMap;

use avrprog_core::error::{Error, Result};
use avrprog_core::opcode::{OpKind, OpcodeSpec, CMD_LEN};
use avrprog_core::part::{Memory, MemoryKind, Part};
use avrprog_core::programmer::{Capabilities, Programmer};

/// Behavior configuration for the emulated device
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Plain writes to flash/EEPROM can only clear bits (NOR behavior)
    pub nor_like: bool,
    /// Expose the page-erase primitive
    pub page_erase: bool,
    /// Expose the paged load/write primitives
    pub paged: bool,
    /// Emulate a self-programming bootloader: chip erase preserves the boot
    /// region
    pub bootloader: bool,
    /// Chip erase wipes the EEPROM too
    pub erase_clears_eeprom: bool,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            nor_like: true,
            page_erase: false,
            paged: true,
            bootloader: false,
            erase_clears_eeprom: false,
        }
    }
}

/// Counters of primitive invocations, for tests and curiosity
#[derive(Debug, Clone, Copy, Default)]
pub struct OpCounters {
    /// Byte reads
    pub byte_reads: usize,
    /// Byte writes
    pub byte_writes: usize,
    /// Paged loads
    pub paged_loads: usize,
    /// Paged writes
    pub paged_writes: usize,
    /// Page erases
    pub page_erases: usize,
    /// Chip erases
    pub chip_erases: usize,
}

/// Dummy programmer emulating one part in memory
pub struct DummyAvr {
    config: DummyConfig,
    counters: OpCounters,
    stores: HashMap<String, Vec<u8>>,
}

impl DummyAvr {
    /// Create an emulated device for `part` with default behavior
    pub fn new(part: &Part) -> Self {
        Self::with_config(part, DummyConfig::default())
    }

    /// Create an emulated device with explicit behavior switches
    pub fn with_config(part: &Part, config: DummyConfig) -> Self {
        let mut stores = HashMap::new();
        for mem in &part.memories {
            if canonical_name(mem) == mem.name {
                stores.insert(mem.name.clone(), vec![0xff; mem.size as usize]);
            }
        }
        if let Some(sig) = stores.get_mut("signature") {
            let n = sig.len().min(3);
            sig[..n].copy_from_slice(&part.signature[..n]);
        }
        if let Some(spec) = part.op(OpKind::PgmEnable) {
            let mut cmd = [0u8; CMD_LEN];
            spec.set_constant_bits(&mut cmd);
            log::trace!("program enable command {cmd:02x?}");
        }
        log::debug!("dummy device for {} created", part.name);
        Self {
            config,
            counters: OpCounters::default(),
            stores,
        }
    }

    /// The emulated contents of a memory, by canonical name
    pub fn memory(&self, name: &str) -> Option<&[u8]> {
        self.stores.get(name).map(Vec::as_slice)
    }

    /// Mutable emulated contents, for seeding device state in tests
    pub fn memory_mut(&mut self, name: &str) -> Option<&mut Vec<u8>> {
        self.stores.get_mut(name)
    }

    /// Invocation counters
    pub fn counters(&self) -> &OpCounters {
        &self.counters
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
            .ok_or_else(|| Error::Io(format!("no emulated {key} memory")))?;
        if abs >= store.len() {
            return Err(Error::Io(format!(
                "emulated {key} access at 0x{abs:x} out of bounds"
            )));
        }
        Ok((store, abs))
    }

    /// Assemble the command word for an operation the way a wire driver
    /// would, returning it for the "device" side to act on
    fn assemble(mem: &Memory, op: OpKind, addr: u32, data: Option<u8>) -> Option<[u8; CMD_LEN]> {
        let spec = mem.op(op)?;
        let mut cmd = [0u8; CMD_LEN];
        spec.set_constant_bits(&mut cmd);
        let wire_addr = if mem.kind.is_flash() { addr >> 1 } else { addr };
        spec.set_address_bits_for_op(mem, op, &mut cmd, wire_addr);
        if let Some(d) = data {
            spec.set_input_bits(&mut cmd, d);
        }
        Some(cmd)
    }

    /// Build the response a real device would send, echoing the command
    /// word with the data byte placed where the opcode expects output
    fn respond(spec: &OpcodeSpec, cmd: [u8; CMD_LEN], value: u8) -> [u8; CMD_LEN] {
        let mut res = cmd;
        if let Some(idx) = spec.output_byte_index() {
            res[idx] = value;
        }
        res
    }
}

fn canonical_name(mem: &Memory) -> &str {
    match mem.kind {
        MemoryKind::Flash => "flash",
        MemoryKind::Eeprom => "eeprom",
        _ => mem.name.as_str(),
    }
}

impl Programmer for DummyAvr {
    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::empty();
        if self.config.paged {
            caps |= Capabilities::PAGED_LOAD | Capabilities::PAGED_WRITE;
        }
        if self.config.page_erase {
            caps |= Capabilities::PAGE_ERASE;
        }
        if self.config.bootloader {
            caps |= Capabilities::BOOTLOADER;
        }
        caps
    }

    fn read_byte(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<u8> {
        self.counters.byte_reads += 1;
        let cmd = Self::assemble(mem, OpKind::Read, addr, None);
        let (store, abs) = self.resolve(part, mem, addr)?;
        let value = store[abs];

        // run the response through the codec when an opcode exists, as a
        // real ISP driver would
        if let (Some(cmd), Some(spec)) = (cmd, mem.op(OpKind::Read)) {
            let res = Self::respond(spec, cmd, value);
            let mut data = 0u8;
            spec.get_output_bits(&res, &mut data);
            return Ok(data);
        }
        Ok(value)
    }

    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: u32, value: u8) -> Result<()> {
        self.counters.byte_writes += 1;
        if mem.kind == MemoryKind::Signature || mem.kind == MemoryKind::Calibration {
            return Err(Error::NotSupported);
        }

        // assemble the command word a wire driver would transmit
        if let Some(cmd) = Self::assemble(mem, OpKind::Write, addr, Some(value)) {
            log::trace!("{} write command {:02x?}", mem.name, cmd);
        }

        let nor = self.config.nor_like && mem.kind.is_cacheable();
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
        let len = buf.len();
        let (store, abs) = self.resolve(part, mem, base)?;
        if abs + len > store.len() {
            return Err(Error::Io("paged load past end of memory".to_string()));
        }
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
        let nor = self.config.nor_like && mem.kind.is_cacheable();
        let (store, abs) = self.resolve(part, mem, base)?;
        if abs + data.len() > store.len() {
            return Err(Error::Io("paged write past end of memory".to_string()));
        }
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
        let page_size = mem.page_size as usize;
        let (store, abs) = self.resolve(part, mem, addr)?;
        let start = abs - abs % page_size;
        store[start..start + page_size].fill(0xff);
        Ok(())
    }

    fn chip_erase(&mut self, part: &Part) -> Result<()> {
        self.counters.chip_erases += 1;
        if let Some(spec) = part.op(OpKind::ChipErase) {
            let mut cmd = [0u8; CMD_LEN];
            spec.set_constant_bits(&mut cmd);
            log::trace!("chip erase command {cmd:02x?}");
        }
        if let Some(flash) = part.flash() {
            let keep_from = if self.config.bootloader {
                boot_estimate(part, flash.size, flash.page_size) as usize
            } else {
                flash.size as usize
            };
            if let Some(store) = self.stores.get_mut("flash") {
                store[..keep_from].fill(0xff);
            }
        }
        if self.config.erase_clears_eeprom {
            if let Some(store) = self.stores.get_mut("eeprom") {
                store.fill(0xff);
            }
        }
        // lock bits open up again after a chip erase
        if let Some(store) = self.stores.get_mut("lock") {
            store.fill(0xff);
        }
        log::debug!("dummy chip erase done");
        Ok(())
    }
}

/// Where the emulated bootloader starts: the part's boot section when known,
/// else the top quarter of flash
fn boot_estimate(part: &Part, size: u32, page_size: u32) -> u32 {
    let start = part.boot_start.unwrap_or(size - size / 4);
    start - start % page_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrprog_core::part::PartDatabase;
    use avrprog_core::programmer::verify_signature;

    fn m328p() -> Part {
        PartDatabase::builtin().find("m328p").unwrap().clone()
    }

    #[test]
    fn signature_reads_through_the_codec() {
        let part = m328p();
        let mut dev = DummyAvr::new(&part);
        verify_signature(&mut dev, &part).unwrap();
    }

    #[test]
    fn eeprom_byte_write_round_trips_through_opcodes() {
        let part = m328p();
        let mut dev = DummyAvr::with_config(
            &part,
            DummyConfig { nor_like: false, ..Default::default() },
        );
        let eeprom = part.eeprom().unwrap();

        dev.write_byte(&part, eeprom, 0x123, 0x5a).unwrap();
        assert_eq!(dev.memory("eeprom").unwrap()[0x123], 0x5a);
        assert_eq!(dev.read_byte(&part, eeprom, 0x123).unwrap(), 0x5a);
    }

    #[test]
    fn fuse_write_round_trips() {
        let part = m328p();
        let mut dev = DummyAvr::new(&part);
        let lfuse = part.memory("lfuse").unwrap();

        dev.write_byte(&part, lfuse, 0, 0x62).unwrap();
        assert_eq!(dev.read_byte(&part, lfuse, 0).unwrap(), 0x62);
    }

    #[test]
    fn nor_behavior_only_clears_bits() {
        let part = m328p();
        let mut dev = DummyAvr::new(&part);
        let flash = part.flash().unwrap();

        dev.paged_write(&part, flash, 128, 0, &[0x0f; 128]).unwrap();
        dev.paged_write(&part, flash, 128, 0, &[0xf0; 128]).unwrap();
        // 0x0f & 0xf0
        assert!(dev.memory("flash").unwrap()[..128].iter().all(|&b| b == 0x00));

        dev.page_erase(&part, flash, 0).unwrap();
        assert!(dev.memory("flash").unwrap()[..128].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn chip_erase_preserves_bootloader_region() {
        let part = m328p();
        let mut dev = DummyAvr::with_config(
            &part,
            DummyConfig { bootloader: true, ..Default::default() },
        );
        dev.memory_mut("flash").unwrap()[0] = 0x00;
        dev.memory_mut("flash").unwrap()[0x7100] = 0x42;

        dev.chip_erase(&part).unwrap();
        assert_eq!(dev.memory("flash").unwrap()[0], 0xff);
        // boot section (0x7000 up on the m328p) survives
        assert_eq!(dev.memory("flash").unwrap()[0x7100], 0x42);
    }

    #[test]
    fn chip_erase_opens_lock_bits() {
        let part = m328p();
        let mut dev = DummyAvr::new(&part);
        let lock = part.memory("lock").unwrap();
        dev.write_byte(&part, lock, 0, 0x00).unwrap();
        assert_eq!(dev.read_byte(&part, lock, 0).unwrap(), 0x00);

        dev.chip_erase(&part).unwrap();
        // the lock read opcode carries six output bits; the top two read 0
        assert_eq!(dev.read_byte(&part, lock, 0).unwrap(), 0x3f);
    }

    #[test]
    fn signature_is_read_only() {
        let part = m328p();
        let mut dev = DummyAvr::new(&part);
        let sig = part.signature_memory().unwrap();
        assert!(matches!(
            dev.write_byte(&part, sig, 0, 0x00),
            Err(Error::NotSupported)
        ));
    }
}
