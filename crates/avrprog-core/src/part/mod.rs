//! Part, memory and configuration-item definitions
//!
//! A [`Part`] describes one microcontroller model: its signature, its
//! memories (flash, EEPROM, fuses, lock byte, ...), the programming opcodes
//! for each, and the symbolic configuration bitfields that live in the fuse
//! and lock bytes. Definitions are loaded from RON files through
//! [`database::PartDatabase`].

pub mod database;

pub use database::{PartDatabase, Size};

use std::collections::HashMap;

use crate::opcode::{OpKind, OpcodeSpec};

/// Kind of an on-chip memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
pub enum MemoryKind {
    /// Program flash (or a region of it, such as a boot section)
    Flash,
    /// Data EEPROM
    Eeprom,
    /// A fuse byte
    Fuse,
    /// The lock byte(s)
    Lock,
    /// The device signature bytes
    Signature,
    /// Oscillator calibration byte(s)
    Calibration,
}

impl MemoryKind {
    /// Whether this memory is word-addressed over the wire
    pub fn is_flash(self) -> bool {
        matches!(self, MemoryKind::Flash)
    }

    /// Whether this memory kind is backed by the paged cache
    ///
    /// Fuses, locks and the like are deliberately accessed directly: they
    /// are single-shot, low-frequency and safety-critical, so writes must
    /// never be deferred.
    pub fn is_cacheable(self) -> bool {
        matches!(self, MemoryKind::Flash | MemoryKind::Eeprom)
    }
}

/// One memory region of a part
#[derive(Debug, Clone)]
pub struct Memory {
    /// Memory name ("flash", "eeprom", "lfuse", ...)
    pub name: String,
    /// What kind of memory this is
    pub kind: MemoryKind,
    /// Total size in bytes
    pub size: u32,
    /// Page granularity in bytes (1 for byte-accessed memories)
    pub page_size: u32,
    /// Base address of this memory in the device's address space
    ///
    /// Alias regions ("application", "boot") carry the offset that places
    /// them inside the canonical memory they alias.
    pub offset: u32,
    /// Programming opcodes, by operation class
    pub ops: HashMap<OpKind, OpcodeSpec>,
}

impl Memory {
    /// Create a memory with no opcodes (useful for tests and emulators)
    pub fn new(name: &str, kind: MemoryKind, size: u32, page_size: u32, offset: u32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            size,
            page_size,
            offset,
            ops: HashMap::new(),
        }
    }

    /// Number of pages in this memory
    pub fn page_count(&self) -> u32 {
        if self.page_size == 0 {
            0
        } else {
            self.size / self.page_size
        }
    }

    /// The opcode for an operation class, if the part database defines one
    pub fn op(&self, kind: OpKind) -> Option<&OpcodeSpec> {
        self.ops.get(&kind)
    }

    /// Whether an address falls inside this memory
    pub fn contains(&self, addr: u32) -> bool {
        addr < self.size
    }
}

/// A named value a configuration bitfield can take
#[derive(Debug, Clone)]
pub struct ConfigValue {
    /// Symbolic name ("disabled", "4v3", ...)
    pub name: String,
    /// The raw field value
    pub value: u32,
}

/// A symbolic configuration bitfield living in a fuse or lock memory
#[derive(Debug, Clone)]
pub struct ConfigItem {
    /// Item name ("BODLEVEL", "SUT_CKSEL", ...)
    pub name: String,
    /// Name of the memory holding the field (1-4 bytes)
    pub memory: String,
    /// Bit mask of the field within the little-endian-composed memory value
    pub mask: u32,
    /// Right-shift that aligns the masked field to bit 0
    pub shift: u8,
    /// Known symbolic values, possibly empty
    pub values: Vec<ConfigValue>,
}

/// One microcontroller model
#[derive(Debug, Clone)]
pub struct Part {
    /// Full name ("ATmega328P")
    pub name: String,
    /// Short identifier used on the command line ("m328p")
    pub id: String,
    /// Device signature bytes
    pub signature: [u8; 3],
    /// Start address of the boot section, when the part has a fixed one
    pub boot_start: Option<u32>,
    /// Memories of this part
    pub memories: Vec<Memory>,
    /// Part-level opcodes (chip erase, program enable)
    pub ops: HashMap<OpKind, OpcodeSpec>,
    /// Symbolic configuration bitfields
    pub config: Vec<ConfigItem>,
}

impl Part {
    /// Look up a memory by exact name
    pub fn memory(&self, name: &str) -> Option<&Memory> {
        self.memories.iter().find(|m| m.name == name)
    }

    /// The canonical flash memory
    ///
    /// Alias regions share its cache; offset translation is relative to it.
    pub fn flash(&self) -> Option<&Memory> {
        self.memories
            .iter()
            .find(|m| m.kind == MemoryKind::Flash && m.name == "flash")
    }

    /// The canonical EEPROM memory
    pub fn eeprom(&self) -> Option<&Memory> {
        self.memories
            .iter()
            .find(|m| m.kind == MemoryKind::Eeprom && m.name == "eeprom")
    }

    /// The signature memory
    pub fn signature_memory(&self) -> Option<&Memory> {
        self.memories.iter().find(|m| m.kind == MemoryKind::Signature)
    }

    /// The part-level opcode for an operation class
    pub fn op(&self, kind: OpKind) -> Option<&OpcodeSpec> {
        self.ops.get(&kind)
    }
}

impl std::fmt::Display for Part {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({:02x} {:02x} {:02x})",
            self.name, self.signature[0], self.signature[1], self.signature[2]
        )
    }
}
